//! Serial port channels for SunSpec buses
//!
//! Each open port runs an I/O task on the tokio runtime. The live channel
//! handed to the tree only queues writes for that task; read or write
//! failures are reported through the channel's [`OfflineNotifier`].

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::channel::{ChannelFactory, LiveChannel, OfflineNotifier};
use crate::error::ChannelError;
use crate::family::{BusFamily, InterfaceParams};

/// Depth of the per-port write queue
const WRITE_QUEUE_DEPTH: usize = 64;

/// Opens serial ports for SunSpec buses
#[derive(Debug, Clone)]
pub struct SerialChannelFactory {
    runtime: Handle,
}

impl SerialChannelFactory {
    /// Create a factory whose I/O tasks run on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl ChannelFactory for SerialChannelFactory {
    fn family(&self) -> BusFamily {
        BusFamily::SunSpec
    }

    fn open(
        &self,
        params: &InterfaceParams,
        bitrate: u32,
        notifier: OfflineNotifier,
    ) -> Result<Box<dyn LiveChannel>, ChannelError> {
        let InterfaceParams::Serial { port } = params else {
            return Err(ChannelError::UnsupportedParams(params.unique()));
        };

        // The async port registers with the reactor of the current runtime
        let _guard = self.runtime.enter();
        let stream = tokio_serial::new(port, bitrate)
            .timeout(Duration::from_millis(100))
            .open_native_async()?;

        info!("Opened {} @ {}", port, bitrate);
        Ok(Box::new(SerialChannel::spawn(
            &self.runtime,
            port.clone(),
            stream,
            notifier,
        )))
    }
}

/// A live serial channel
pub struct SerialChannel {
    port: String,
    write_tx: mpsc::Sender<Vec<u8>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SerialChannel {
    /// Start the I/O task for an open stream
    pub fn spawn<T>(runtime: &Handle, port: String, io: T, notifier: OfflineNotifier) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime.spawn(run_channel_io(io, write_rx, shutdown_rx, notifier));

        Self {
            port,
            write_tx,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl LiveChannel for SerialChannel {
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        self.write_tx
            .try_send(payload.to_vec())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Io(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("write queue of {} is full", self.port),
                )),
                mpsc::error::TrySendError::Closed(_) => ChannelError::NotConnected,
            })
    }

    fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            debug!("Closing {}", self.port);
            let _ = tx.send(());
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the I/O loop for one open port
///
/// Returns on shutdown without reporting. Any read or write failure, or the
/// far end closing, is reported as went-offline and ends the loop.
pub async fn run_channel_io<T>(
    mut io: T,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    notifier: OfflineNotifier,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buffer = vec![0u8; 256];

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!("Channel I/O for {} shutting down", notifier.bus());
                return;
            }

            Some(data) = write_rx.recv() => {
                let written = match io.write_all(&data).await {
                    Ok(()) => io.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    notifier.report(format!("Write error: {}", e));
                    return;
                }
            }

            result = tokio::time::timeout(Duration::from_millis(100), io.read(&mut buffer)) => {
                match result {
                    Ok(Ok(0)) => {
                        notifier.report("Port closed");
                        return;
                    }
                    Ok(Ok(n)) => {
                        debug!("Channel {} received {} bytes", notifier.bus(), n);
                    }
                    Ok(Err(e)) => {
                        if e.kind() != io::ErrorKind::WouldBlock
                            && e.kind() != io::ErrorKind::TimedOut
                        {
                            notifier.report(format!("Read error: {}", e));
                            return;
                        }
                    }
                    Err(_) => {} // Timeout, continue
                }
            }
        }
    }
}
