//! Three-valued selection flag

use serde::{Deserialize, Serialize};

/// Selection state of a checkable column
///
/// `Partial` means "selected, but currently inactive because the parent is
/// unavailable". It is derived by the tree and never requested on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriState {
    /// Not selected
    #[default]
    Off,
    /// Selected but waiting on the parent
    Partial,
    /// Selected and active
    On,
}

impl TriState {
    /// `On` for `true`, `Off` for `false`
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Check if the flag is fully on
    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// Check if the flag is anything other than off
    pub fn is_selected(self) -> bool {
        self != Self::Off
    }

    /// Short marker used in console listings
    pub fn marker(self) -> &'static str {
        match self {
            Self::Off => "[ ]",
            Self::Partial => "[~]",
            Self::On => "[x]",
        }
    }
}
