use std::collections::{HashMap, VecDeque};
use std::rc::Weak;

use async_trait::async_trait;
use tokio::task::AbortHandle;

use crate::base::TableId;
use crate::permit::ReadPermit;
use crate::semaphore::SemaphoreInner;

/// Why an inactive read was evicted.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Evicted to free resources for a waiting read.
    #[display("permit")]
    Permit,
    /// The read's TTL expired.
    #[display("time")]
    Time,
    /// Explicitly evicted, e.g. because its table is going away.
    #[display("manual")]
    Manual,
}

/// The capability set the semaphore needs from a parked reader: who it reads
/// for, which table it reads from, and how to close it. The concrete reader
/// type lives with the storage engine.
#[async_trait(?Send)]
pub trait EvictableReader {
    /// The permit this reader was admitted under.
    fn permit(&self) -> ReadPermit;

    /// Identity of the table this reader reads from.
    fn table_id(&self) -> TableId;

    /// Closes the reader, releasing any buffers it still holds.
    async fn close(self: Box<Self>);
}

/// Callback invoked when a registered read is evicted.
pub type EvictionNotifier = Box<dyn FnOnce(EvictReason)>;

/// A parked reader, linked into the semaphore's inactive list.
pub(crate) struct InactiveRead {
    pub(crate) reader: Box<dyn EvictableReader>,
    pub(crate) notify: Option<EvictionNotifier>,
    pub(crate) ttl_timer: Option<AbortHandle>,
}

impl InactiveRead {
    pub(crate) fn new(reader: Box<dyn EvictableReader>) -> Self {
        Self {
            reader,
            notify: None,
            ttl_timer: None,
        }
    }

    pub(crate) fn cancel_ttl_timer(&self) {
        if let Some(timer) = &self.ttl_timer {
            timer.abort();
        }
    }
}

/// Storage for inactive reads: entries keyed by a never-reused id, FIFO order
/// kept in a separate deque. Ids of detached entries linger in the deque and
/// are skipped lazily, which keeps detach-by-handle O(1).
#[derive(Default)]
pub(crate) struct InactiveRegistry {
    entries: HashMap<u64, InactiveRead>,
    order: VecDeque<u64>,
}

impl InactiveRegistry {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, id: u64, read: InactiveRead) {
        self.entries.insert(id, read);
        self.order.push_back(id);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<InactiveRead> {
        self.entries.remove(&id)
    }

    pub(crate) fn get(&self, id: u64) -> Option<&InactiveRead> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut InactiveRead> {
        self.entries.get_mut(&id)
    }

    /// Id of the oldest registered read, skipping over stale order entries.
    pub(crate) fn front_id(&mut self) -> Option<u64> {
        while let Some(&id) = self.order.front() {
            if self.entries.contains_key(&id) {
                return Some(id);
            }
            self.order.pop_front();
        }
        None
    }

    /// All live ids, oldest first.
    pub(crate) fn ids_in_order(&self) -> Vec<u64> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.entries.contains_key(id))
            .collect()
    }
}

/// Handle to a registered inactive read. An empty handle means the read was
/// immediately evicted at registration time.
///
/// Dropping a handle whose read is still registered abandons the read: the
/// entry is removed and the reader closed in the background, without the
/// eviction callback firing.
pub struct InactiveReadHandle {
    pub(crate) sem: Weak<SemaphoreInner>,
    pub(crate) id: Option<u64>,
}

impl InactiveReadHandle {
    pub(crate) fn new(sem: Weak<SemaphoreInner>, id: u64) -> Self {
        Self { sem, id: Some(id) }
    }

    pub(crate) fn empty() -> Self {
        Self {
            sem: Weak::new(),
            id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }
}

impl Drop for InactiveReadHandle {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Some(sem) = self.sem.upgrade() else {
            return;
        };
        sem.abandon_inactive_read(id);
    }
}
