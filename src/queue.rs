use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::base::WeirResult;
use crate::permit::ReadPermit;
use crate::semaphore::ReadFunc;

/// A read waiting for admission or for a memory grant.
pub(crate) struct WaitEntry {
    /// Global enqueue order across both sub-queues.
    pub(crate) seq: u64,
    pub(crate) permit: ReadPermit,
    pub(crate) func: Option<ReadFunc>,
    pub(crate) tx: oneshot::Sender<WeirResult<()>>,
    /// Deadline timer, aborted when the entry leaves the queue.
    pub(crate) timer: Option<AbortHandle>,
}

impl WaitEntry {
    pub(crate) fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// An admitted read waiting to be dispatched by the execution loop.
pub(crate) struct ReadyEntry {
    pub(crate) permit: ReadPermit,
    pub(crate) func: ReadFunc,
    pub(crate) tx: oneshot::Sender<WeirResult<()>>,
}

/// The semaphore's wait list: two FIFO sub-queues (admission and memory),
/// merged by enqueue order. `front()` is the earliest-enqueued entry across
/// both, which is the only entry the admission policy ever considers.
#[derive(Default)]
pub(crate) struct WaitList {
    admission: VecDeque<WaitEntry>,
    memory: VecDeque<WaitEntry>,
    next_seq: u64,
}

impl WaitList {
    pub(crate) fn is_empty(&self) -> bool {
        self.admission.is_empty() && self.memory.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.admission.len() + self.memory.len()
    }

    pub(crate) fn push_admission(
        &mut self,
        permit: ReadPermit,
        func: Option<ReadFunc>,
        tx: oneshot::Sender<WeirResult<()>>,
    ) -> u64 {
        let seq = self.next_seq();
        self.admission.push_back(WaitEntry {
            seq,
            permit,
            func,
            tx,
            timer: None,
        });
        seq
    }

    pub(crate) fn push_memory(
        &mut self,
        permit: ReadPermit,
        tx: oneshot::Sender<WeirResult<()>>,
    ) -> u64 {
        let seq = self.next_seq();
        self.memory.push_back(WaitEntry {
            seq,
            permit,
            func: None,
            tx,
            timer: None,
        });
        seq
    }

    pub(crate) fn front(&self) -> Option<&WaitEntry> {
        match (self.admission.front(), self.memory.front()) {
            (Some(a), Some(m)) => Some(if a.seq < m.seq { a } else { m }),
            (Some(a), None) => Some(a),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<WaitEntry> {
        match (self.admission.front(), self.memory.front()) {
            (Some(a), Some(m)) => {
                if a.seq < m.seq {
                    self.admission.pop_front()
                } else {
                    self.memory.pop_front()
                }
            }
            (Some(_), None) => self.admission.pop_front(),
            (None, Some(_)) => self.memory.pop_front(),
            (None, None) => None,
        }
    }

    /// Removes the entry with the given sequence number, wherever it is
    /// queued. Entries are seq-sorted within each sub-queue, so this is a
    /// binary search.
    pub(crate) fn remove(&mut self, seq: u64) -> Option<WaitEntry> {
        if let Ok(i) = self.admission.binary_search_by_key(&seq, |e| e.seq) {
            return self.admission.remove(i);
        }
        if let Ok(i) = self.memory.binary_search_by_key(&seq, |e| e.seq) {
            return self.memory.remove(i);
        }
        None
    }

    pub(crate) fn set_timer(&mut self, seq: u64, timer: AbortHandle) {
        if let Ok(i) = self.admission.binary_search_by_key(&seq, |e| e.seq) {
            self.admission[i].timer = Some(timer);
        } else if let Ok(i) = self.memory.binary_search_by_key(&seq, |e| e.seq) {
            self.memory[i].timer = Some(timer);
        } else {
            // Entry was served or expired before the timer was attached.
            timer.abort();
        }
    }

    /// Empties both sub-queues, returning the entries in enqueue order.
    pub(crate) fn drain(&mut self) -> Vec<WaitEntry> {
        let mut entries: Vec<_> = self
            .admission
            .drain(..)
            .chain(self.memory.drain(..))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
