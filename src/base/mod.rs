//! This module contains base types that are used across Weir.
use std::fmt;
use std::rc::Rc;

mod error;
pub mod utils;

pub use error::{WeirError, WeirResult};
pub use utils::{ByteSize, LiveValue};

/// A two-dimensional resource vector: a count of concurrent reads and the
/// bytes of memory they hold. The semaphore keeps one of these for its total
/// capacity and one for what is currently free; the free vector may go
/// negative in the memory component while over-consumption is permitted.
#[derive(
    Debug, Display, Clone, Copy, Default, PartialEq, Eq, Add, Sub, AddAssign, SubAssign,
)]
#[display("{{{count}, {memory}}}")]
pub struct Resources {
    pub count: i64,
    pub memory: i64,
}

impl Resources {
    pub const fn new(count: i64, memory: i64) -> Self {
        Self { count, memory }
    }

    /// A memory-only amount, as consumed by buffers mid-read.
    pub const fn with_memory(memory: i64) -> Self {
        Self { count: 0, memory }
    }

    /// Returns whether either component is non-zero.
    pub const fn non_zero(&self) -> bool {
        self.count != 0 || self.memory != 0
    }
}

/// Opaque identity of a table, used to group and evict parked readers.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u64);

/// Descriptor of the table a read operates on. The semaphore only ever needs
/// the identity and the display names; everything else about a schema lives
/// with the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub id: TableId,
    pub db_name: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(id: TableId, db_name: impl Into<String>, table_name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            id,
            db_name: db_name.into(),
            table_name: table_name.into(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db_name, self.table_name)
    }
}
