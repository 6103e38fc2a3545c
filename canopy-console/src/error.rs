//! Console error type

use canopy_detect::DetectError;
use canopy_sim::SimError;
use canopy_tree::TreeError;
use thiserror::Error;

/// Errors surfaced to the console user
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The command line could not be parsed
    #[error("{0}")]
    Parse(String),

    /// The tree rejected the request
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Virtual hardware rejected the request
    #[error(transparent)]
    Sim(#[from] SimError),

    /// Discovery failed
    #[error(transparent)]
    Detect(#[from] DetectError),

    /// The tree actor has stopped
    #[error("tree actor is not running")]
    ActorGone,

    /// Settings could not be stored
    #[error("settings: {0}")]
    Settings(String),

    /// A background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Terminal I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
