//! Admission control for storage-engine reads.
//!
//! The centerpiece is [`ReadSemaphore`], a per-shard semaphore that bounds
//! both the number of in-flight reads and the memory they collectively hold,
//! arbitrates fair admission when the shard is saturated, and evicts parked
//! readers when new work would otherwise starve. Each admitted read carries a
//! [`ReadPermit`] that accounts for everything the read consumes.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod config;
pub(crate) mod diagnostics;
pub mod inactive;
pub mod permit;
pub(crate) mod queue;
pub mod semaphore;

pub use base::{ByteSize, LiveValue, Resources, TableId, TableRef, WeirError, WeirResult};
pub use config::SemaphoreConfig;
pub use inactive::{EvictReason, EvictableReader, EvictionNotifier, InactiveReadHandle};
pub use permit::{BlockedGuard, PermitState, ReadPermit, ResourceUnits, UsedGuard};
pub use semaphore::{ReadFunc, ReadSemaphore, SemaphoreStats};
