//! Column layout shared by every row of the tree

use serde::{Deserialize, Serialize};

/// A column of the bus tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Column {
    /// Node name; checkable (connect / activate)
    Name,
    /// Bus bitrate; editable on buses only
    Bitrate,
    /// Transmit enable; checkable
    Transmit,
}

impl Column {
    /// All columns in display order
    pub const ALL: [Column; 3] = [Column::Name, Column::Bitrate, Column::Transmit];

    /// First column in display order
    pub const FIRST: Column = Column::Name;

    /// Last column in display order
    pub const LAST: Column = Column::Transmit;

    /// Position of the column in display order
    pub fn index(self) -> usize {
        match self {
            Self::Name => 0,
            Self::Bitrate => 1,
            Self::Transmit => 2,
        }
    }

    /// Column at a display position
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Whether the column carries a checkbox
    pub fn is_checkable(self) -> bool {
        matches!(self, Self::Name | Self::Transmit)
    }

    /// Whether the column carries an editable value
    pub fn is_editable(self) -> bool {
        self == Self::Bitrate
    }

    /// Header label
    pub fn header(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::Bitrate => "Bitrate",
            Self::Transmit => "Transmit",
        }
    }
}

/// One value per column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Columns<T> {
    pub name: T,
    pub bitrate: T,
    pub transmit: T,
}

impl<T: Clone> Columns<T> {
    /// Fill every column with the same value
    pub fn fill(value: T) -> Self {
        Self {
            name: value.clone(),
            bitrate: value.clone(),
            transmit: value,
        }
    }
}

impl<T> Columns<T> {
    /// Value of a column
    pub fn get(&self, column: Column) -> &T {
        match column {
            Column::Name => &self.name,
            Column::Bitrate => &self.bitrate,
            Column::Transmit => &self.transmit,
        }
    }

    /// Mutable value of a column
    pub fn get_mut(&mut self, column: Column) -> &mut T {
        match column {
            Column::Name => &mut self.name,
            Column::Bitrate => &mut self.bitrate,
            Column::Transmit => &mut self.transmit,
        }
    }
}

/// Header labels for every column
pub fn headers() -> Columns<&'static str> {
    Columns {
        name: Column::Name.header(),
        bitrate: Column::Bitrate.header(),
        transmit: Column::Transmit.header(),
    }
}
