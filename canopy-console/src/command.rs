//! Console command parsing

use canopy_tree::{Column, NodeId, TriState};

use crate::error::ConsoleError;

/// Help text printed by `help`
pub const HELP: &str = "\
Commands:
  list                      show the tree
  on|off|partial <node>     set the active flag of a bus or device
  tx on|off|partial <node>  set the transmit flag of a bus or device
  bitrate <bus> <rate>      select a bitrate by value (250000) or label (250 kBit/s)
  add <bus> <name>          attach a virtual device to a bus
  remove <device>           remove a device
  send <device> <hex>       send bytes through a device's bus
  unplug <bus>              pull a virtual CAN adapter
  scan                      run discovery and list what is found
  save                      write the current settings file
  help                      show this text
  quit                      leave";

/// A parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Set {
        node: NodeId,
        column: Column,
        state: TriState,
    },
    Bitrate {
        bus: NodeId,
        value: String,
    },
    Add {
        bus: NodeId,
        name: String,
    },
    Remove {
        device: NodeId,
    },
    Send {
        device: NodeId,
        payload: Vec<u8>,
    },
    Unplug {
        bus: NodeId,
    },
    Scan,
    Save,
    Help,
    Quit,
}

fn parse_node(word: Option<&str>) -> Result<NodeId, ConsoleError> {
    let word = word.ok_or_else(|| ConsoleError::Parse("missing node".into()))?;
    word.trim_start_matches('#')
        .parse()
        .map(NodeId)
        .map_err(|_| ConsoleError::Parse(format!("not a node: {}", word)))
}

fn parse_state(word: &str) -> Option<TriState> {
    match word {
        "on" => Some(TriState::On),
        "off" => Some(TriState::Off),
        "partial" => Some(TriState::Partial),
        _ => None,
    }
}

fn parse_hex(words: &[&str]) -> Result<Vec<u8>, ConsoleError> {
    let digits: String = words.concat();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(ConsoleError::Parse(format!(
            "expected an even number of hex digits, got {:?}",
            digits
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| ConsoleError::Parse(format!("bad hex: {}", digits)))
        })
        .collect()
}

/// Parse one input line; blank lines yield `None`
pub fn parse(line: &str) -> Result<Option<Command>, ConsoleError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = words.split_first() else {
        return Ok(None);
    };

    let command = match verb {
        "list" | "ls" => Command::List,
        "scan" => Command::Scan,
        "save" => Command::Save,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "tx" => {
            let state = rest
                .first()
                .and_then(|w| parse_state(w))
                .ok_or_else(|| ConsoleError::Parse("usage: tx on|off|partial <node>".into()))?;
            Command::Set {
                node: parse_node(rest.get(1).copied())?,
                column: Column::Transmit,
                state,
            }
        }
        "bitrate" => {
            if rest.len() < 2 {
                return Err(ConsoleError::Parse("usage: bitrate <bus> <rate>".into()));
            }
            Command::Bitrate {
                bus: parse_node(rest.first().copied())?,
                value: rest[1..].join(" "),
            }
        }
        "add" => {
            if rest.len() < 2 {
                return Err(ConsoleError::Parse("usage: add <bus> <name>".into()));
            }
            Command::Add {
                bus: parse_node(rest.first().copied())?,
                name: rest[1..].join(" "),
            }
        }
        "remove" | "rm" => Command::Remove {
            device: parse_node(rest.first().copied())?,
        },
        "send" => Command::Send {
            device: parse_node(rest.first().copied())?,
            payload: parse_hex(rest.get(1..).unwrap_or_default())?,
        },
        "unplug" => Command::Unplug {
            bus: parse_node(rest.first().copied())?,
        },
        other => match parse_state(other) {
            Some(state) => Command::Set {
                node: parse_node(rest.first().copied())?,
                column: Column::Name,
                state,
            },
            None => {
                return Err(ConsoleError::Parse(format!(
                    "unknown command {:?}, try help",
                    other
                )))
            }
        },
    };

    Ok(Some(command))
}
