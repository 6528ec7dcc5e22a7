use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::base::utils::Gate;
use crate::base::{LiveValue, Resources, TableId, TableRef, WeirError, WeirResult};
use crate::config::SemaphoreConfig;
use crate::diagnostics::{self, PermitSnapshot, RateLimiter};
use crate::inactive::{EvictReason, EvictableReader, InactiveRead, InactiveReadHandle, InactiveRegistry};
use crate::permit::{MemoryFuture, PermitInner, PermitState, ReadPermit};
use crate::queue::{ReadyEntry, WaitEntry, WaitList};

/// The read a permit was obtained for, dispatched through the ready list by
/// the execution loop.
pub type ReadFunc = Box<dyn FnOnce(ReadPermit) -> LocalBoxFuture<'static, WeirResult<()>>>;

const DIAGNOSTICS_LOG_PERIOD: Duration = Duration::from_secs(30);
const DIAGNOSTICS_DEFAULT_MAX_LINES: usize = 20;

/// Named counters exposed for introspection and metrics scraping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreStats {
    pub current_permits: u64,
    pub total_permits: u64,
    pub used_permits: u64,
    pub blocked_permits: u64,
    pub reads_admitted: u64,
    pub reads_enqueued_for_admission: u64,
    pub reads_enqueued_for_memory: u64,
    pub inactive_reads: u64,
    pub permit_based_evictions: u64,
    pub time_based_evictions: u64,
    pub sstables_read: u64,
    pub disk_reads: u64,
    pub total_reads_shed_due_to_overload: u64,
    pub total_reads_killed_due_to_kill_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CanAdmit {
    Yes,
    No,
    /// Nothing is free right now, but evicting inactive reads may help.
    Maybe,
}

enum WaitOn {
    Admission,
    Memory,
}

/// How an enqueued waiter learns about its fate.
pub(crate) enum WaiterCompletion {
    Admission(oneshot::Receiver<WeirResult<()>>),
    Memory(MemoryFuture),
}

impl WaiterCompletion {
    async fn wait(self) -> WeirResult<()> {
        match self {
            Self::Admission(rx) => rx.await.unwrap_or(Err(WeirError::BrokenSemaphore)),
            Self::Memory(fut) => fut.await,
        }
    }
}

pub(crate) struct SemState {
    initial: Resources,
    available: Resources,
    wait_list: WaitList,
    ready_list: VecDeque<ReadyEntry>,
    inactive: InactiveRegistry,
    permits: HashMap<u64, Weak<PermitInner>>,
    stats: SemaphoreStats,
}

impl SemState {
    fn consumed(&self) -> Resources {
        self.initial - self.available
    }

    fn consumed_memory(&self) -> u64 {
        self.consumed().memory.max(0) as u64
    }

    fn inactive_insert(&mut self, id: u64, read: InactiveRead) {
        self.inactive.insert(id, read);
        self.stats.inactive_reads += 1;
    }

    fn inactive_remove(&mut self, id: u64) -> Option<InactiveRead> {
        let read = self.inactive.remove(id)?;
        self.stats.inactive_reads = self.stats.inactive_reads.saturating_sub(1);
        Some(read)
    }
}

pub(crate) struct SemaphoreInner {
    /// Self-reference handed to timers and background tasks, set up through
    /// `Rc::new_cyclic` at construction.
    weak_self: Weak<SemaphoreInner>,
    name: String,
    max_queue_length: usize,
    serialize_limit_multiplier: LiveValue<u32>,
    kill_limit_multiplier: LiveValue<u32>,
    state: RefCell<SemState>,
    stopped: Cell<bool>,
    /// Latch for the background eviction task.
    evicting: Cell<bool>,
    /// In the serialize regime, the one permit allowed to keep growing its
    /// memory footprint. Cleared when that permit is destroyed.
    blessed_permit: Cell<Option<u64>>,
    id_source: Cell<u64>,
    ready_notify: Rc<Notify>,
    execution_loop: RefCell<Option<JoinHandle<()>>>,
    /// Reader closes run through this gate so stop() can await them.
    close_gate: Gate,
    /// Every live permit holds this gate; stop() waits for all of them.
    permit_gate: Gate,
    diag_limiter: RateLimiter,
}

impl SemaphoreInner {
    fn next_id(&self) -> u64 {
        let id = self.id_source.get();
        self.id_source.set(id + 1);
        id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn with_stats(&self, f: impl FnOnce(&mut SemaphoreStats)) {
        f(&mut self.state.borrow_mut().stats);
    }

    fn is_unlimited(st: &SemState) -> bool {
        st.initial.count == i64::MAX && st.initial.memory == i64::MAX
    }

    fn limit(st: &SemState, multiplier: u32) -> u64 {
        if multiplier == 0 || multiplier == u32::MAX || Self::is_unlimited(st) {
            return u64::MAX;
        }
        (st.initial.memory.max(0) as u64).saturating_mul(multiplier as u64)
    }

    /// Consumed memory beyond this restricts memory growth to the blessed
    /// permit.
    fn serialize_limit(&self, st: &SemState) -> u64 {
        Self::limit(st, self.serialize_limit_multiplier.get())
    }

    /// Consumed memory beyond this fails the consuming read with OOM.
    fn kill_limit(&self, st: &SemState) -> u64 {
        Self::limit(st, self.kill_limit_multiplier.get())
    }

    /// Debits `r`. Fails when the debit would leave no free memory while
    /// pushing total consumption past the kill limit; the kill statistic is
    /// bumped once per permit.
    pub(crate) fn consume(&self, permit: &PermitInner, r: Resources) -> WeirResult<()> {
        let killed = {
            let mut st = self.state.borrow_mut();
            let kill_limit = self.kill_limit(&st);
            if kill_limit != u64::MAX
                && st.available.memory.saturating_sub(r.memory) <= 0
                && st.consumed_memory().saturating_add(r.memory.max(0) as u64) >= kill_limit
            {
                if permit.on_oom_kill() {
                    st.stats.total_reads_killed_due_to_kill_limit += 1;
                }
                true
            } else {
                st.available -= r;
                false
            }
        };
        if killed {
            self.maybe_log_diagnostics("kill limit triggered");
            return Err(WeirError::OutOfMemory(self.name.clone()));
        }
        Ok(())
    }

    /// The strong self-reference; valid for as long as any semaphore method
    /// can run at all.
    fn strong_self(&self) -> Rc<Self> {
        self.weak_self
            .upgrade()
            .expect("the semaphore is alive while its methods run")
    }

    /// Credits `r` back and immediately reconsiders waiters.
    pub(crate) fn signal(&self, r: Resources) {
        self.state.borrow_mut().available += r;
        self.maybe_admit_waiters();
    }

    fn has_available_units(st: &SemState, r: Resources) -> bool {
        // Special case: when no read is admitted at all (count untouched),
        // admit one regardless of memory, so a single read larger than the
        // whole budget can still make progress.
        (st.available.non_zero() && st.available.count >= r.count && st.available.memory >= r.memory)
            || st.available.count == st.initial.count
    }

    fn all_used_permits_are_stalled(st: &SemState) -> bool {
        st.stats.used_permits == st.stats.blocked_permits
    }

    fn can_admit_read(&self, st: &SemState, permit: &PermitInner) -> CanAdmit {
        if st.available.memory < 0 {
            let consumed_memory = st.consumed_memory();
            if consumed_memory >= self.kill_limit(st) {
                // A subsequent consume would throw OOM anyway.
                return CanAdmit::No;
            }
            if consumed_memory >= self.serialize_limit(st) {
                if let Some(blessed) = self.blessed_permit.get() {
                    return if blessed == permit.id()
                        && permit.state() == PermitState::WaitingForMemory
                    {
                        CanAdmit::Yes
                    } else {
                        CanAdmit::No
                    };
                }
                return if permit.state() == PermitState::WaitingForMemory {
                    CanAdmit::Yes
                } else {
                    CanAdmit::No
                };
            }
        }

        if permit.state() == PermitState::WaitingForMemory {
            return CanAdmit::Yes;
        }

        if !st.ready_list.is_empty() {
            return CanAdmit::No;
        }

        // While any admitted read is still making progress, wait for its
        // signals instead of admitting more work. This may delay admission
        // even when resources are available.
        if !Self::all_used_permits_are_stalled(st) {
            return CanAdmit::No;
        }

        if !Self::has_available_units(st, permit.base_resources()) {
            return if st.inactive.is_empty() {
                CanAdmit::No
            } else {
                CanAdmit::Maybe
            };
        }

        CanAdmit::Yes
    }

    fn check_queue_size(&self, queue_name: &'static str) -> WeirResult<()> {
        let overloaded = {
            let mut st = self.state.borrow_mut();
            if st.wait_list.len() + st.ready_list.len() >= self.max_queue_length {
                st.stats.total_reads_shed_due_to_overload += 1;
                true
            } else {
                false
            }
        };
        if overloaded {
            self.maybe_log_diagnostics(&format!("{queue_name} queue overload"));
            return Err(WeirError::QueueOverloaded(self.name.clone(), queue_name));
        }
        Ok(())
    }

    fn enqueue_waiter(
        &self,
        permit: ReadPermit,
        func: Option<ReadFunc>,
        wait_on: WaitOn,
    ) -> WeirResult<WaiterCompletion> {
        if self.stopped.get() {
            return Err(WeirError::SemaphoreStopped(self.name.clone()));
        }
        self.check_queue_size("wait")?;
        let (tx, rx) = oneshot::channel();
        let deadline = permit.timeout();
        let (seq, completion) = match wait_on {
            WaitOn::Admission => {
                permit.inner().on_waiting_for_admission();
                let seq = {
                    let mut st = self.state.borrow_mut();
                    st.stats.reads_enqueued_for_admission += 1;
                    st.wait_list.push_admission(permit, func, tx)
                };
                (seq, WaiterCompletion::Admission(rx))
            }
            WaitOn::Memory => {
                let fut: MemoryFuture = async move {
                    rx.await.unwrap_or(Err(WeirError::BrokenSemaphore))
                }
                .boxed_local()
                .shared();
                permit.inner().on_waiting_for_memory(fut.clone());
                let seq = {
                    let mut st = self.state.borrow_mut();
                    st.stats.reads_enqueued_for_memory += 1;
                    st.wait_list.push_memory(permit, tx)
                };
                (seq, WaiterCompletion::Memory(fut))
            }
        };
        if let Some(deadline) = deadline {
            let sem = self.weak_self.clone();
            let timer = tokio::task::spawn_local(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(sem) = sem.upgrade() {
                    sem.expire_waiter(seq);
                }
            });
            self.state
                .borrow_mut()
                .wait_list
                .set_timer(seq, timer.abort_handle());
        }
        Ok(completion)
    }

    fn expire_waiter(&self, seq: u64) {
        let Some(entry) = self.state.borrow_mut().wait_list.remove(seq) else {
            return;
        };
        let WaitEntry { permit, tx, func, .. } = entry;
        trace!(
            semaphore = %self.name,
            permit = %permit.description(),
            "failing waiter, deadline expired"
        );
        let _ = tx.send(Err(WeirError::SemaphoreTimedOut(self.name.clone())));
        self.maybe_log_diagnostics("timed out");
        drop(func);
        drop(permit);
    }

    /// Serves the head of the wait list for as long as the admission policy
    /// says yes. Idempotent under a fixed resource state.
    pub(crate) fn maybe_admit_waiters(&self) {
        let mut admit = CanAdmit::No;
        loop {
            let entry = {
                let mut st = self.state.borrow_mut();
                admit = match st.wait_list.front() {
                    None => break,
                    Some(front) => self.can_admit_read(&st, front.permit.inner()),
                };
                if admit != CanAdmit::Yes {
                    break;
                }
                st.wait_list.pop_front().expect("wait list checked non-empty")
            };
            entry.cancel_timer();
            let WaitEntry { permit, func, tx, .. } = entry;
            let granted = if permit.state() == PermitState::WaitingForMemory {
                self.blessed_permit.set(Some(permit.inner().id()));
                permit.inner().on_granted_memory()
            } else {
                let admitted = permit.inner().on_admission();
                if admitted.is_ok() {
                    self.with_stats(|stats| stats.reads_admitted += 1);
                }
                admitted
            };
            match (granted, func) {
                (Ok(()), Some(func)) => {
                    self.state
                        .borrow_mut()
                        .ready_list
                        .push_back(ReadyEntry { permit, func, tx });
                    self.ready_notify.notify_one();
                }
                (Ok(()), None) => {
                    let _ = tx.send(Ok(()));
                }
                (Err(e), _) => {
                    let _ = tx.send(Err(e));
                }
            }
        }
        if admit == CanAdmit::Maybe {
            // Each eviction completes through the signal path, which calls
            // back into maybe_admit_waiters().
            self.evict_readers_in_background();
        }
    }

    pub(crate) async fn do_wait_admission(
        &self,
        permit: ReadPermit,
        func: Option<ReadFunc>,
    ) -> WeirResult<()> {
        self.ensure_execution_loop();

        let (admit, have_waiters) = {
            let st = self.state.borrow();
            (
                self.can_admit_read(&st, permit.inner()),
                !st.wait_list.is_empty(),
            )
        };
        if admit != CanAdmit::Yes || have_waiters {
            let completion = self.enqueue_waiter(permit, func, WaitOn::Admission)?;
            if admit == CanAdmit::Yes && have_waiters {
                // Contradiction: waiters are admitted the moment that becomes
                // possible, so an admissible semaphore must not have any.
                self.maybe_log_diagnostics(
                    "semaphore could admit new reads yet there are waiters",
                );
                self.maybe_admit_waiters();
            } else if admit == CanAdmit::Maybe {
                self.evict_readers_in_background();
            }
            return completion.wait().await;
        }

        permit.inner().on_admission()?;
        self.with_stats(|stats| stats.reads_admitted += 1);
        match func {
            Some(func) => self.with_ready_permit(permit, func).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn with_ready_permit(
        &self,
        permit: ReadPermit,
        func: ReadFunc,
    ) -> WeirResult<()> {
        if self.stopped.get() {
            return Err(WeirError::SemaphoreStopped(self.name.clone()));
        }
        self.ensure_execution_loop();
        self.check_queue_size("ready")?;
        let (tx, rx) = oneshot::channel();
        self.state
            .borrow_mut()
            .ready_list
            .push_back(ReadyEntry { permit, func, tx });
        self.ready_notify.notify_one();
        rx.await.unwrap_or(Err(WeirError::BrokenSemaphore))
    }

    /// Asks for `memory` additional bytes on behalf of `permit`. Returns
    /// `None` when the grant is immediate, or the shared completion to await.
    pub(crate) fn request_memory(
        &self,
        permit: &Rc<PermitInner>,
        memory: i64,
    ) -> WeirResult<Option<MemoryFuture>> {
        // Already blocked on memory? Share the pending grant.
        if permit.state() == PermitState::WaitingForMemory {
            return Ok(Some(permit.memory_future()));
        }

        let granted = {
            let st = self.state.borrow();
            st.available.memory > 0
                || st
                    .consumed_memory()
                    .saturating_add(memory.max(0) as u64)
                    < self.serialize_limit(&st)
        };
        if granted {
            permit.on_granted_memory()?;
            return Ok(None);
        }

        if self.blessed_permit.get().is_none() {
            self.blessed_permit.set(Some(permit.id()));
        }
        if self.blessed_permit.get() == Some(permit.id()) {
            permit.on_granted_memory()?;
            return Ok(None);
        }

        match self.enqueue_waiter(
            ReadPermit::from_inner(permit.clone()),
            None,
            WaitOn::Memory,
        )? {
            WaiterCompletion::Memory(fut) => Ok(Some(fut)),
            WaiterCompletion::Admission(_) => unreachable!("enqueued on the memory queue"),
        }
    }

    pub(crate) fn make_permit(
        &self,
        schema: Option<Rc<TableRef>>,
        op_name: &str,
        base_resources: Resources,
        timeout: Option<Instant>,
    ) -> WeirResult<ReadPermit> {
        if self.stopped.get() {
            return Err(WeirError::SemaphoreStopped(self.name.clone()));
        }
        let Some(gate) = self.permit_gate.try_enter() else {
            return Err(WeirError::SemaphoreStopped(self.name.clone()));
        };
        let id = self.next_id();
        let inner = Rc::new(PermitInner::new(
            self.strong_self(),
            id,
            schema,
            op_name,
            base_resources,
            timeout,
            gate,
        ));
        {
            let mut st = self.state.borrow_mut();
            st.permits.insert(id, Rc::downgrade(&inner));
            st.stats.total_permits += 1;
            st.stats.current_permits += 1;
        }
        Ok(ReadPermit::from_inner(inner))
    }

    pub(crate) fn on_permit_destroyed(&self, id: u64) {
        {
            let mut st = self.state.borrow_mut();
            st.permits.remove(&id);
            st.stats.current_permits = st.stats.current_permits.saturating_sub(1);
        }
        if self.blessed_permit.get() == Some(id) {
            self.blessed_permit.set(None);
            self.maybe_admit_waiters();
        }
    }

    pub(crate) fn on_permit_used(&self) {
        self.state.borrow_mut().stats.used_permits += 1;
    }

    pub(crate) fn on_permit_unused(&self) {
        {
            let mut st = self.state.borrow_mut();
            if st.stats.used_permits == 0 {
                error!(semaphore = %self.name, "used permit count underflow");
            } else {
                st.stats.used_permits -= 1;
            }
            debug_assert!(st.stats.used_permits >= st.stats.blocked_permits);
        }
        self.maybe_admit_waiters();
    }

    pub(crate) fn on_permit_blocked(&self) {
        {
            let mut st = self.state.borrow_mut();
            st.stats.blocked_permits += 1;
            debug_assert!(st.stats.used_permits >= st.stats.blocked_permits);
        }
        self.maybe_admit_waiters();
    }

    pub(crate) fn on_permit_unblocked(&self) {
        let mut st = self.state.borrow_mut();
        if st.stats.blocked_permits == 0 {
            error!(semaphore = %self.name, "blocked permit count underflow");
        } else {
            st.stats.blocked_permits -= 1;
        }
    }

    /// Detaches an inactive read: the entry is removed, its permit evicted
    /// (releasing the base reservation), and the notify callback invoked.
    /// The caller is responsible for closing the returned reader.
    pub(crate) fn detach_inactive_read(
        &self,
        id: u64,
        reason: EvictReason,
    ) -> Option<Box<dyn EvictableReader>> {
        let read = self.state.borrow_mut().inactive_remove(id)?;
        read.cancel_ttl_timer();
        let InactiveRead { reader, notify, .. } = read;
        reader.permit().inner().on_evicted();
        if let Some(notify) = notify {
            notify(reason);
        }
        self.with_stats(|stats| match reason {
            EvictReason::Permit => stats.permit_based_evictions += 1,
            EvictReason::Time => stats.time_based_evictions += 1,
            EvictReason::Manual => {}
        });
        trace!(semaphore = %self.name, %reason, "evicted inactive read");
        Some(reader)
    }

    /// Removes an inactive read without evicting its permit; used when a
    /// still-linked handle is dropped.
    pub(crate) fn abandon_inactive_read(&self, id: u64) {
        let Some(read) = self.state.borrow_mut().inactive_remove(id) else {
            return;
        };
        read.cancel_ttl_timer();
        self.close_reader(read.reader);
    }

    /// Closes a reader in the background, through the close gate so stop()
    /// can await it.
    pub(crate) fn close_reader(&self, reader: Box<dyn EvictableReader>) {
        let gate = self.close_gate.try_enter();
        if gate.is_none() {
            debug!(semaphore = %self.name, "closing a reader after the close gate was shut");
        }
        tokio::task::spawn_local(async move {
            reader.close().await;
            drop(gate);
        });
    }

    /// While reads are waiting and inactive reads exist, evicts the oldest
    /// inactive read, one at a time. Idempotent: a single eviction task runs
    /// at any moment.
    pub(crate) fn evict_readers_in_background(&self) {
        if self.evicting.replace(true) {
            return;
        }
        let Some(gate) = self.close_gate.try_enter() else {
            self.evicting.set(false);
            return;
        };
        let weak = self.weak_self.clone();
        tokio::task::spawn_local(async move {
            let _gate = gate;
            loop {
                let Some(sem) = weak.upgrade() else { return };
                let front = {
                    let mut st = sem.state.borrow_mut();
                    if st.wait_list.is_empty() {
                        None
                    } else {
                        st.inactive.front_id()
                    }
                };
                let Some(id) = front else {
                    sem.evicting.set(false);
                    return;
                };
                let reader = sem.detach_inactive_read(id, EvictReason::Permit);
                drop(sem);
                if let Some(reader) = reader {
                    reader.close().await;
                }
            }
        });
    }

    fn ensure_execution_loop(&self) {
        if self.execution_loop.borrow().is_some() || self.stopped.get() {
            return;
        }
        let weak = self.weak_self.clone();
        let ready = self.ready_notify.clone();
        let handle = tokio::task::spawn_local(execution_loop(weak, ready));
        *self.execution_loop.borrow_mut() = Some(handle);
    }

    /// Fails every queued waiter with `ex` (or the generic broken error).
    pub(crate) fn broken_with(&self, ex: Option<WeirError>) {
        let ex = ex.unwrap_or(WeirError::BrokenSemaphore);
        let entries = self.state.borrow_mut().wait_list.drain();
        for entry in entries {
            entry.cancel_timer();
            let WaitEntry { tx, .. } = entry;
            let _ = tx.send(Err(ex.clone()));
        }
    }

    fn permit_snapshots(&self) -> Vec<PermitSnapshot> {
        let st = self.state.borrow();
        st.permits
            .values()
            .filter_map(Weak::upgrade)
            .map(|permit| PermitSnapshot {
                schema: permit.schema().cloned(),
                op_name: permit.op_name().to_owned(),
                state: permit.state(),
                resources: permit.resources(),
            })
            .collect()
    }

    pub(crate) fn dump_diagnostics(&self, problem: &str, max_lines: usize) -> String {
        let snapshots = self.permit_snapshots();
        let (initial, available) = {
            let st = self.state.borrow();
            (st.initial, st.available)
        };
        diagnostics::format_permit_dump(&self.name, initial, available, problem, &snapshots, max_lines)
    }

    pub(crate) fn maybe_log_diagnostics(&self, problem: &str) {
        if self.diag_limiter.should_fire() {
            info!("{}", self.dump_diagnostics(problem, DIAGNOSTICS_DEFAULT_MAX_LINES));
        }
    }
}

async fn execution_loop(sem: Weak<SemaphoreInner>, ready: Rc<Notify>) {
    loop {
        // Wait for the ready list to become non-empty.
        loop {
            let Some(inner) = sem.upgrade() else { return };
            if inner.stopped.get() {
                return;
            }
            if !inner.state.borrow().ready_list.is_empty() {
                break;
            }
            drop(inner);
            ready.notified().await;
        }

        // Drain it, yielding cooperatively between entries.
        loop {
            let entry = {
                let Some(inner) = sem.upgrade() else { return };
                if inner.stopped.get() {
                    return;
                }
                inner.state.borrow_mut().ready_list.pop_front()
            };
            let Some(ReadyEntry { permit, func, tx }) = entry else {
                break;
            };
            let fut = func(permit);
            tokio::task::spawn_local(async move {
                let _ = tx.send(fut.await);
            });
            tokio::task::consume_budget().await;
        }
    }
}

/// An admission-control semaphore that bounds both the number of in-flight
/// reads and the memory they collectively hold.
///
/// A read asks for a permit with its base resources `(1, memory)` and a
/// deadline. It is admitted immediately when resources allow, queued in FIFO
/// order otherwise. Admitted reads consume and signal further resources
/// through their [`ReadPermit`]; mid-read memory needs go through
/// [`ReadPermit::request_memory`], which may queue or, under sustained
/// overspend, restrict growth to a single blessed read and eventually fail
/// reads outright (see [`SemaphoreConfig`]'s serialize and kill multipliers).
/// Long-idle readers can be parked with
/// [`register_inactive_read`](Self::register_inactive_read), making them
/// eviction candidates when new work is starved.
///
/// There is one semaphore per shard and everything about it is
/// single-threaded: permits, handles and internal tasks are `!Send`, and the
/// background work (execution loop, timers, evictions) is spawned with
/// `tokio::task::spawn_local`, so a `LocalSet` or comparable local context is
/// required.
///
/// [`stop`](Self::stop) is mandatory before dropping the semaphore once it
/// has issued any permit.
pub struct ReadSemaphore {
    inner: Rc<SemaphoreInner>,
}

impl ReadSemaphore {
    /// Panics if `config.count` or `config.memory` is negative.
    pub fn new(config: SemaphoreConfig) -> Self {
        assert!(config.count >= 0, "semaphore count must not be negative");
        assert!(config.memory >= 0, "semaphore memory must not be negative");
        let initial = Resources::new(config.count, config.memory);
        Self {
            inner: Rc::new_cyclic(|weak| SemaphoreInner {
                weak_self: weak.clone(),
                name: config.name,
                max_queue_length: config.max_queue_length,
                serialize_limit_multiplier: config.serialize_limit_multiplier,
                kill_limit_multiplier: config.kill_limit_multiplier,
                state: RefCell::new(SemState {
                    initial,
                    available: initial,
                    wait_list: WaitList::default(),
                    ready_list: VecDeque::new(),
                    inactive: InactiveRegistry::default(),
                    permits: HashMap::new(),
                    stats: SemaphoreStats::default(),
                }),
                stopped: Cell::new(false),
                evicting: Cell::new(false),
                blessed_permit: Cell::new(None),
                id_source: Cell::new(0),
                ready_notify: Rc::new(Notify::new()),
                execution_loop: RefCell::new(None),
                close_gate: Gate::new(),
                permit_gate: Gate::new(),
                diag_limiter: RateLimiter::new(DIAGNOSTICS_LOG_PERIOD),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn initial_resources(&self) -> Resources {
        self.inner.state.borrow().initial
    }

    pub fn available_resources(&self) -> Resources {
        self.inner.state.borrow().available
    }

    pub fn consumed_resources(&self) -> Resources {
        self.inner.state.borrow().consumed()
    }

    pub fn stats(&self) -> SemaphoreStats {
        self.inner.state.borrow().stats
    }

    /// Replaces the capacity, applying the delta to what is currently free,
    /// and reconsiders waiters.
    pub fn set_resources(&self, resources: Resources) {
        {
            let mut st = self.inner.state.borrow_mut();
            let delta = resources - st.initial;
            st.initial = resources;
            st.available += delta;
        }
        self.inner.maybe_admit_waiters();
    }

    /// Obtains a permit with base resources `(1, memory)`, queueing on the
    /// admission queue if the read cannot be admitted right away.
    pub async fn obtain_permit(
        &self,
        schema: Option<Rc<TableRef>>,
        op_name: &str,
        memory: u64,
        timeout: Option<Instant>,
    ) -> WeirResult<ReadPermit> {
        let permit = self.inner.make_permit(
            schema,
            op_name,
            Resources::new(1, memory as i64),
            timeout,
        )?;
        self.inner.do_wait_admission(permit.clone(), None).await?;
        Ok(permit)
    }

    /// An accounting-only permit: zero base resources, admitted immediately,
    /// never queued. For operations that must not be throttled but whose
    /// memory should still be attributed.
    pub fn make_tracking_only_permit(
        &self,
        schema: Option<Rc<TableRef>>,
        op_name: &str,
        timeout: Option<Instant>,
    ) -> WeirResult<ReadPermit> {
        self.inner
            .make_permit(schema, op_name, Resources::default(), timeout)
    }

    /// Obtains a permit like [`obtain_permit`](Self::obtain_permit) and runs
    /// `func` with it through the ready list once admitted.
    pub async fn with_permit(
        &self,
        schema: Option<Rc<TableRef>>,
        op_name: &str,
        memory: u64,
        timeout: Option<Instant>,
        func: ReadFunc,
    ) -> WeirResult<()> {
        let permit = self.inner.make_permit(
            schema,
            op_name,
            Resources::new(1, memory as i64),
            timeout,
        )?;
        self.inner.do_wait_admission(permit, Some(func)).await
    }

    /// Runs `func` with an already admitted permit through the ready list.
    pub async fn with_ready_permit(&self, permit: ReadPermit, func: ReadFunc) -> WeirResult<()> {
        self.inner.with_ready_permit(permit, func).await
    }

    /// Parks a reader, making it an eviction candidate. When reads are
    /// already waiting (or memory is exhausted) the reader is immediately
    /// evicted instead and an empty handle returned; the base reservation is
    /// only released on actual eviction, not on registration.
    pub fn register_inactive_read(&self, reader: Box<dyn EvictableReader>) -> InactiveReadHandle {
        let permit = reader.permit();
        permit.inner().on_register_as_inactive();
        // A non-empty wait list implies all inactive reads are already being
        // evicted, so there is nothing to gain from parking this one. The
        // wait list only covers the count dimension; check memory separately.
        let can_link = {
            let st = self.inner.state.borrow();
            st.wait_list.is_empty() && st.available.memory > 0
        };
        if can_link {
            let id = self.inner.next_id();
            self.inner
                .state
                .borrow_mut()
                .inactive_insert(id, InactiveRead::new(reader));
            return InactiveReadHandle::new(Rc::downgrade(&self.inner), id);
        }
        permit.inner().on_evicted();
        self.inner
            .with_stats(|stats| stats.permit_based_evictions += 1);
        self.inner.close_reader(reader);
        InactiveReadHandle::empty()
    }

    /// Attaches an eviction callback and, optionally, a TTL after which the
    /// read is evicted with reason [`EvictReason::Time`]. No-op on an empty
    /// or already-detached handle.
    pub fn set_notify_handler(
        &self,
        handle: &InactiveReadHandle,
        handler: impl FnOnce(EvictReason) + 'static,
        ttl: Option<Duration>,
    ) {
        let Some(id) = handle.id else { return };
        {
            let mut st = self.inner.state.borrow_mut();
            let Some(read) = st.inactive.get_mut(id) else {
                return;
            };
            read.notify = Some(Box::new(handler));
        }
        if let Some(ttl) = ttl {
            let weak = Rc::downgrade(&self.inner);
            let timer = tokio::task::spawn_local(async move {
                tokio::time::sleep(ttl).await;
                if let Some(sem) = weak.upgrade()
                    && let Some(reader) = sem.detach_inactive_read(id, EvictReason::Time)
                {
                    sem.close_reader(reader);
                }
            });
            let mut st = self.inner.state.borrow_mut();
            match st.inactive.get_mut(id) {
                Some(read) => read.ttl_timer = Some(timer.abort_handle()),
                None => timer.abort(),
            }
        }
    }

    /// Detaches a parked reader and hands it back, restoring its permit to an
    /// active state. Returns `None` for an empty or already-detached handle.
    /// A handle belonging to a different semaphore is an internal error; the
    /// read is closed through its own semaphore.
    pub fn unregister_inactive_read(
        &self,
        mut handle: InactiveReadHandle,
    ) -> Option<Box<dyn EvictableReader>> {
        let id = handle.id.take()?;
        let owner = handle.sem.upgrade();
        let foreign = match &owner {
            Some(owner) => !Rc::ptr_eq(owner, &self.inner),
            None => true,
        };
        if foreign {
            error!(
                semaphore = %self.name(),
                "attempted to unregister an inactive read with a handle belonging to another semaphore"
            );
            if let Some(owner) = owner {
                owner.abandon_inactive_read(id);
            }
            return None;
        }
        let read = self.inner.state.borrow_mut().inactive_remove(id)?;
        read.cancel_ttl_timer();
        let InactiveRead { reader, .. } = read;
        reader.permit().inner().on_unregister_as_inactive();
        Some(reader)
    }

    /// Evicts the oldest inactive read, if any. Returns whether one was
    /// evicted.
    pub fn try_evict_one_inactive_read(&self, reason: EvictReason) -> bool {
        let front = self.inner.state.borrow_mut().inactive.front_id();
        let Some(id) = front else { return false };
        match self.inner.detach_inactive_read(id, reason) {
            Some(reader) => {
                self.inner.close_reader(reader);
                true
            }
            None => false,
        }
    }

    /// Drops all inactive reads, closing their readers in the background.
    /// The permits are not transitioned; the readers release them on close.
    pub fn clear_inactive_reads(&self) {
        loop {
            let read = {
                let mut st = self.inner.state.borrow_mut();
                match st.inactive.front_id() {
                    Some(id) => st.inactive_remove(id),
                    None => None,
                }
            };
            let Some(read) = read else { break };
            read.cancel_ttl_timer();
            self.inner.close_reader(read.reader);
        }
    }

    /// Evicts every inactive read of the given table, closing the readers
    /// one after the other before returning.
    pub async fn evict_inactive_reads_for_table(&self, id: TableId) {
        let ids = self.inner.state.borrow().inactive.ids_in_order();
        let mut detached = Vec::new();
        for entry_id in ids {
            let matches = self
                .inner
                .state
                .borrow()
                .inactive
                .get(entry_id)
                .is_some_and(|read| read.reader.table_id() == id);
            if matches
                && let Some(reader) = self
                    .inner
                    .detach_inactive_read(entry_id, EvictReason::Manual)
            {
                detached.push(reader);
            }
        }
        for reader in detached {
            reader.close().await;
        }
    }

    /// Fails all queued waiters with `ex`, or with
    /// [`WeirError::BrokenSemaphore`] when no error is given.
    pub fn broken(&self, ex: Option<WeirError>) {
        self.inner.broken_with(ex);
    }

    /// Shuts the semaphore down: clears inactive reads, waits for in-flight
    /// reader closes and for every permit to be dropped, stops the execution
    /// loop, and fails any residual waiters. Mandatory once the semaphore has
    /// issued a permit; panics when called twice.
    pub async fn stop(&self) {
        let inner = &self.inner;
        assert!(
            !inner.stopped.get(),
            "stop() called twice on semaphore {}",
            inner.name
        );
        inner.stopped.set(true);
        debug!(semaphore = %inner.name, "stopping");
        self.clear_inactive_reads();
        inner.close_gate.close().await;
        inner.permit_gate.close().await;
        let loop_handle = inner.execution_loop.borrow_mut().take();
        if let Some(handle) = loop_handle {
            inner.ready_notify.notify_one();
            let _ = handle.await;
        }
        inner.broken_with(Some(WeirError::SemaphoreStopped(inner.name.clone())));
    }

    /// Renders the permit dump on demand; `max_lines == 0` disables the cap.
    pub fn dump_diagnostics(&self, max_lines: usize) -> String {
        self.inner.dump_diagnostics("user request", max_lines)
    }

    /// Visits every live permit issued by this semaphore.
    pub fn foreach_permit(&self, mut f: impl FnMut(&ReadPermit)) {
        let permits: Vec<_> = {
            let st = self.inner.state.borrow();
            st.permits.values().filter_map(Weak::upgrade).collect()
        };
        for permit in permits {
            f(&ReadPermit::from_inner(permit));
        }
    }
}

impl Drop for ReadSemaphore {
    fn drop(&mut self) {
        if self.inner.stopped.get() {
            return;
        }
        let total_permits = self.inner.state.borrow().stats.total_permits;
        if total_permits > 0 {
            error!(
                semaphore = %self.inner.name,
                "semaphore destroyed without stop() after issuing permits"
            );
        }
        self.inner.stopped.set(true);
        self.inner.broken_with(None);
        // Let a parked execution loop observe the stop flag and exit.
        self.inner.ready_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::base::TableId;
    use crate::tests::{TestReader, run_local, run_local_paused, setup_tracing, yield_to_tasks};

    fn config(count: i64, memory: i64) -> SemaphoreConfig {
        SemaphoreConfig::for_testing(count, memory)
    }

    #[test]
    fn test_admission_is_fifo() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            assert_eq!(sem.stats().reads_admitted, 1);

            let order = Rc::new(RefCell::new(Vec::new()));
            let tasks: Vec<_> = ["b", "c"]
                .into_iter()
                .map(|op| {
                    let sem = sem.clone();
                    let order = order.clone();
                    tokio::task::spawn_local(async move {
                        let permit = sem.obtain_permit(None, op, 100, None).await.unwrap();
                        order.borrow_mut().push(op);
                        drop(permit);
                    })
                })
                .collect();
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_enqueued_for_admission, 2);
            assert!(order.borrow().is_empty());

            drop(a);
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(*order.borrow(), ["b", "c"]);
            assert_eq!(sem.stats().reads_admitted, 3);
            assert_eq!(sem.available_resources(), sem.initial_resources());

            sem.stop().await;
        });
    }

    #[test]
    fn test_admission_timeout() {
        setup_tracing();
        run_local_paused(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let deadline = Instant::now() + Duration::from_millis(10);
            let waiter = {
                let sem = sem.clone();
                tokio::task::spawn_local(async move {
                    sem.obtain_permit(None, "b", 100, Some(deadline)).await
                })
            };
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(WeirError::SemaphoreTimedOut(_))));
            assert_eq!(sem.stats().reads_enqueued_for_admission, 1);

            // The expired entry is gone; dropping the admitted read admits
            // nothing.
            drop(a);
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_admitted, 1);

            sem.stop().await;
        });
    }

    #[test]
    fn test_inactive_eviction_under_pressure() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(2, 1024)));
            let a = sem.obtain_permit(None, "a", 400, None).await.unwrap();
            let b = sem.obtain_permit(None, "b", 400, None).await.unwrap();

            let (reader, closed) = TestReader::new(a.clone(), TableId(1));
            let handle = sem.register_inactive_read(reader);
            assert!(!handle.is_empty());

            let reasons = Rc::new(RefCell::new(Vec::new()));
            {
                let reasons = reasons.clone();
                sem.set_notify_handler(
                    &handle,
                    move |reason| reasons.borrow_mut().push(reason),
                    None,
                );
            }

            // No free count or memory, but an inactive read exists: policy
            // says maybe, background eviction frees A's slot for C.
            let c = sem.obtain_permit(None, "c", 400, None).await.unwrap();
            assert_eq!(*reasons.borrow(), [EvictReason::Permit]);
            assert_eq!(sem.stats().permit_based_evictions, 1);
            assert_eq!(a.state(), PermitState::Evicted);

            yield_to_tasks().await;
            assert!(closed.get());

            drop(handle);
            drop(a);
            drop(b);
            drop(c);
            sem.stop().await;
        });
    }

    #[test]
    fn test_serialize_regime_blesses_one_permit() {
        setup_tracing();
        run_local(async {
            let cfg = SemaphoreConfig {
                serialize_limit_multiplier: LiveValue::new(2),
                kill_limit_multiplier: LiveValue::new(4),
                ..config(2, 1024)
            };
            let sem = Rc::new(ReadSemaphore::new(cfg));
            let a = sem.obtain_permit(None, "a", 400, None).await.unwrap();
            let b = sem.obtain_permit(None, "b", 400, None).await.unwrap();

            // Memory is still positive: granted immediately.
            let a1 = a.request_memory(700).await.unwrap();
            assert_eq!(sem.consumed_resources().memory, 1500);

            // Now over budget and past the serialize limit: A becomes the
            // blessed permit and may keep growing.
            let a2 = a.request_memory(1200).await.unwrap();
            assert_eq!(sem.consumed_resources().memory, 2700);

            // B is not blessed: it has to queue.
            let b_request = {
                let b = b.clone();
                tokio::task::spawn_local(async move { b.request_memory(100).await })
            };
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_enqueued_for_memory, 1);
            assert_eq!(b.state(), PermitState::WaitingForMemory);

            // A shrinking drains the memory queue.
            drop(a2);
            let b_units = b_request.await.unwrap().unwrap();
            assert_eq!(b_units.resources(), Resources::with_memory(100));
            assert_eq!(b.state(), PermitState::ActiveUnused);

            drop(b_units);
            drop(a1);
            drop(a);
            drop(b);
            sem.stop().await;
        });
    }

    #[test]
    fn test_kill_limit_oom() {
        setup_tracing();
        run_local(async {
            let cfg = SemaphoreConfig {
                kill_limit_multiplier: LiveValue::new(2),
                ..config(1, 1024)
            };
            let sem = ReadSemaphore::new(cfg);
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let err = a.consume(Resources::with_memory(2000)).unwrap_err();
            assert!(matches!(err, WeirError::OutOfMemory(_)));
            assert_eq!(sem.stats().total_reads_killed_due_to_kill_limit, 1);
            // The failed consume left the permit's counter untouched.
            assert_eq!(a.consumed_resources(), Resources::new(1, 100));

            // Only the first kill per permit is counted.
            assert!(a.consume(Resources::with_memory(5000)).is_err());
            assert_eq!(sem.stats().total_reads_killed_due_to_kill_limit, 1);

            // A smaller consume below the kill limit goes through.
            a.consume(Resources::with_memory(1500)).unwrap();
            assert_eq!(a.consumed_resources(), Resources::new(1, 1600));
            a.signal(Resources::with_memory(1500));

            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_ttl_eviction() {
        setup_tracing();
        run_local_paused(async {
            let sem = ReadSemaphore::new(config(2, 1024));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            let (reader, closed) = TestReader::new(a.clone(), TableId(1));
            let handle = sem.register_inactive_read(reader);

            let reasons = Rc::new(RefCell::new(Vec::new()));
            {
                let reasons = reasons.clone();
                sem.set_notify_handler(
                    &handle,
                    move |reason| reasons.borrow_mut().push(reason),
                    Some(Duration::from_millis(50)),
                );
            }

            tokio::time::sleep(Duration::from_millis(60)).await;
            yield_to_tasks().await;

            assert_eq!(*reasons.borrow(), [EvictReason::Time]);
            assert_eq!(sem.stats().time_based_evictions, 1);
            assert_eq!(a.state(), PermitState::Evicted);
            assert!(closed.get());

            drop(handle);
            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_single_large_read_is_admitted() {
        setup_tracing();
        run_local(async {
            let cfg = SemaphoreConfig {
                kill_limit_multiplier: LiveValue::new(u32::MAX),
                ..config(1, 1024)
            };
            let sem = ReadSemaphore::new(cfg);
            // Larger than the whole memory budget, but no other read is
            // active, so it must go through.
            let a = sem.obtain_permit(None, "big", 5000, None).await.unwrap();
            assert_eq!(sem.available_resources(), Resources::new(0, 1024 - 5000));

            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_stalled_rule_delays_admission() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(2, 4096)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            a.mark_used();

            // Resources for B are available, but A is still making progress,
            // so admission waits for A's signals.
            let waiter = {
                let sem = sem.clone();
                tokio::task::spawn_local(async move {
                    sem.obtain_permit(None, "b", 100, None).await
                })
            };
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_enqueued_for_admission, 1);
            assert_eq!(sem.stats().reads_admitted, 1);

            // A stalls on an external event: now all used permits are
            // blocked and B gets in.
            a.mark_blocked();
            let b = waiter.await.unwrap().unwrap();
            assert_eq!(sem.stats().reads_admitted, 2);

            a.mark_unblocked();
            a.mark_unused();
            drop(a);
            drop(b);
            sem.stop().await;
        });
    }

    #[test]
    fn test_queue_overload_sheds_reads() {
        setup_tracing();
        run_local(async {
            let cfg = SemaphoreConfig {
                max_queue_length: 1,
                ..config(1, 1024)
            };
            let sem = Rc::new(ReadSemaphore::new(cfg));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let waiter = {
                let sem = sem.clone();
                tokio::task::spawn_local(async move {
                    sem.obtain_permit(None, "b", 100, None).await
                })
            };
            yield_to_tasks().await;

            let shed = sem.obtain_permit(None, "c", 100, None).await;
            assert!(matches!(shed, Err(WeirError::QueueOverloaded(_, "wait"))));
            assert_eq!(sem.stats().total_reads_shed_due_to_overload, 1);

            drop(a);
            let b = waiter.await.unwrap().unwrap();
            drop(b);
            sem.stop().await;
        });
    }

    #[test]
    fn test_broken_fails_waiters() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let waiter = {
                let sem = sem.clone();
                tokio::task::spawn_local(async move {
                    sem.obtain_permit(None, "b", 100, None).await
                })
            };
            yield_to_tasks().await;

            sem.broken(None);
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(WeirError::BrokenSemaphore)));

            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_stop_rejects_new_permits() {
        setup_tracing();
        run_local(async {
            let sem = ReadSemaphore::new(config(1, 1024));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            drop(a);
            sem.stop().await;

            let obtained = sem.obtain_permit(None, "b", 100, None).await;
            assert!(matches!(obtained, Err(WeirError::SemaphoreStopped(_))));
            let tracking = sem.make_tracking_only_permit(None, "t", None);
            assert!(matches!(tracking, Err(WeirError::SemaphoreStopped(_))));
        });
    }

    #[test]
    fn test_with_permit_dispatches_through_ready_list() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let ran = Rc::new(Cell::new(false));
            let job = {
                let sem = sem.clone();
                let ran = ran.clone();
                tokio::task::spawn_local(async move {
                    sem.with_permit(
                        None,
                        "job",
                        100,
                        None,
                        Box::new(move |permit| {
                            async move {
                                assert_eq!(permit.state(), PermitState::ActiveUnused);
                                ran.set(true);
                                Ok(())
                            }
                            .boxed_local()
                        }),
                    )
                    .await
                })
            };
            yield_to_tasks().await;
            assert!(!ran.get());

            drop(a);
            job.await.unwrap().unwrap();
            assert!(ran.get());

            sem.stop().await;
        });
    }

    #[test]
    fn test_consumed_matches_permit_sum() {
        setup_tracing();
        run_local(async {
            let sem = ReadSemaphore::new(config(4, 65536));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            let b = sem.obtain_permit(None, "b", 200, None).await.unwrap();
            let tracked = sem.make_tracking_only_permit(None, "t", None).unwrap();

            let units_a = a.consume_memory(1000).unwrap();
            let units_t = tracked.consume_memory(400).unwrap();

            let mut sum = Resources::default();
            sem.foreach_permit(|permit| sum += permit.consumed_resources());
            assert_eq!(sum, sem.consumed_resources());
            assert_eq!(sum, Resources::new(2, 1700));

            drop(units_a);
            drop(units_t);
            drop(a);
            drop(b);
            drop(tracked);
            sem.stop().await;
        });
    }

    #[test]
    fn test_tracking_only_permit_bypasses_admission() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            // The semaphore is saturated, yet a tracking-only permit is
            // handed out synchronously with zero base resources.
            let tracked = sem.make_tracking_only_permit(None, "t", None).unwrap();
            assert_eq!(tracked.base_resources(), Resources::default());
            assert_eq!(tracked.state(), PermitState::ActiveUnused);
            assert_eq!(sem.stats().current_permits, 2);
            assert_eq!(sem.stats().reads_enqueued_for_admission, 0);

            drop(tracked);
            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_set_resources_admits_waiters() {
        setup_tracing();
        run_local(async {
            let sem = Rc::new(ReadSemaphore::new(config(1, 1024)));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();

            let waiter = {
                let sem = sem.clone();
                tokio::task::spawn_local(async move {
                    sem.obtain_permit(None, "b", 100, None).await
                })
            };
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_admitted, 1);

            sem.set_resources(Resources::new(2, 2048));
            let b = waiter.await.unwrap().unwrap();
            assert_eq!(sem.stats().reads_admitted, 2);
            assert_eq!(sem.initial_resources(), Resources::new(2, 2048));

            drop(a);
            drop(b);
            sem.stop().await;
        });
    }

    #[test]
    fn test_evicted_permit_readmission() {
        setup_tracing();
        run_local(async {
            let sem = ReadSemaphore::new(config(2, 1024));
            let a = sem.obtain_permit(None, "a", 400, None).await.unwrap();
            let (reader, closed) = TestReader::new(a.clone(), TableId(1));
            let _handle = sem.register_inactive_read(reader);

            assert!(sem.try_evict_one_inactive_read(EvictReason::Manual));
            assert!(a.needs_readmission());
            // Manual evictions bump no eviction counter.
            assert_eq!(sem.stats().permit_based_evictions, 0);
            assert_eq!(sem.stats().time_based_evictions, 0);
            assert_eq!(sem.available_resources(), Resources::new(2, 1024));

            a.wait_readmission().await.unwrap();
            assert_eq!(a.state(), PermitState::ActiveUnused);
            assert_eq!(sem.available_resources(), Resources::new(1, 624));

            yield_to_tasks().await;
            assert!(closed.get());
            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_evict_inactive_reads_for_table() {
        setup_tracing();
        run_local(async {
            let sem = ReadSemaphore::new(config(4, 4096));
            let a = sem.obtain_permit(None, "a", 100, None).await.unwrap();
            let b = sem.obtain_permit(None, "b", 100, None).await.unwrap();

            let (reader_a, closed_a) = TestReader::new(a.clone(), TableId(1));
            let (reader_b, closed_b) = TestReader::new(b.clone(), TableId(2));
            let handle_a = sem.register_inactive_read(reader_a);
            let handle_b = sem.register_inactive_read(reader_b);
            assert_eq!(sem.stats().inactive_reads, 2);

            sem.evict_inactive_reads_for_table(TableId(1)).await;
            assert!(closed_a.get());
            assert!(!closed_b.get());
            assert_eq!(sem.stats().inactive_reads, 1);
            assert_eq!(a.state(), PermitState::Evicted);
            assert_eq!(b.state(), PermitState::Inactive);

            drop(handle_a);
            drop(handle_b);
            yield_to_tasks().await;
            assert!(closed_b.get());

            drop(a);
            drop(b);
            sem.stop().await;
        });
    }

    #[test]
    fn test_dump_diagnostics_lists_live_permits() {
        setup_tracing();
        run_local(async {
            let sem = ReadSemaphore::new(config(4, 4096));
            let schema = TableRef::new(TableId(1), "main", "users");
            let a = sem
                .obtain_permit(Some(schema), "scan", 100, None)
                .await
                .unwrap();

            let dump = sem.dump_diagnostics(20);
            assert!(dump.contains("main.users/scan/active/unused"));
            assert!(dump.lines().any(|l| l.ends_with("\ttotal")));

            drop(a);
            sem.stop().await;
        });
    }

    #[test]
    fn test_request_memory_shares_one_future() {
        setup_tracing();
        run_local(async {
            let cfg = SemaphoreConfig {
                serialize_limit_multiplier: LiveValue::new(2),
                kill_limit_multiplier: LiveValue::new(8),
                ..config(2, 1024)
            };
            let sem = Rc::new(ReadSemaphore::new(cfg));
            let a = sem.obtain_permit(None, "a", 400, None).await.unwrap();
            let b = sem.obtain_permit(None, "b", 400, None).await.unwrap();

            // The first request drains the budget, the second runs past the
            // serialize limit and blesses A.
            let a1 = a.request_memory(500).await.unwrap();
            let a2 = a.request_memory(900).await.unwrap();

            // Two concurrent requests on B coalesce into one queue entry.
            let first = {
                let b = b.clone();
                tokio::task::spawn_local(async move { b.request_memory(50).await })
            };
            yield_to_tasks().await;
            let second = {
                let b = b.clone();
                tokio::task::spawn_local(async move { b.request_memory(70).await })
            };
            yield_to_tasks().await;
            assert_eq!(sem.stats().reads_enqueued_for_memory, 1);

            drop(a2);
            let first_units = first.await.unwrap().unwrap();
            let second_units = second.await.unwrap().unwrap();
            assert_eq!(first_units.resources(), Resources::with_memory(50));
            assert_eq!(second_units.resources(), Resources::with_memory(70));
            // Both grants were debited when the shared future resolved.
            assert_eq!(b.consumed_resources(), Resources::new(1, 520));

            drop(first_units);
            drop(second_units);
            drop(a1);
            drop(a);
            drop(b);
            sem.stop().await;
        });
    }
}
