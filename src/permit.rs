use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{LocalBoxFuture, Shared};
use tokio::time::Instant;

use crate::base::utils::GateGuard;
use crate::base::{Resources, TableRef, WeirResult};
use crate::semaphore::SemaphoreInner;

/// Completion handle shared by every caller waiting on the same permit's
/// pending memory grant.
pub(crate) type MemoryFuture = Shared<LocalBoxFuture<'static, WeirResult<()>>>;

/// Lifecycle state of a read permit.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermitState {
    #[display("waiting_for_admission")]
    WaitingForAdmission,
    #[display("waiting_for_memory")]
    WaitingForMemory,
    #[display("active/unused")]
    ActiveUnused,
    #[display("active/used")]
    ActiveUsed,
    #[display("active/blocked")]
    ActiveBlocked,
    #[display("inactive")]
    Inactive,
    #[display("evicted")]
    Evicted,
}

pub(crate) struct PermitInner {
    sem: Rc<SemaphoreInner>,
    id: u64,
    schema: Option<Rc<TableRef>>,
    op_name: String,
    base_resources: Cell<Resources>,
    base_consumed: Cell<bool>,
    resources: Cell<Resources>,
    state: Cell<PermitState>,
    used_branches: Cell<u64>,
    marked_as_used: Cell<bool>,
    blocked_branches: Cell<u64>,
    marked_as_blocked: Cell<bool>,
    timeout: Cell<Option<Instant>>,
    sstables_read: Cell<u64>,
    requested_memory: Cell<i64>,
    memory_future: RefCell<Option<MemoryFuture>>,
    oom_kills: Cell<u64>,
    _gate: GateGuard,
}

impl PermitInner {
    pub(crate) fn new(
        sem: Rc<SemaphoreInner>,
        id: u64,
        schema: Option<Rc<TableRef>>,
        op_name: &str,
        base_resources: Resources,
        timeout: Option<Instant>,
        gate: GateGuard,
    ) -> Self {
        Self {
            sem,
            id,
            schema,
            op_name: op_name.to_owned(),
            base_resources: Cell::new(base_resources),
            base_consumed: Cell::new(false),
            resources: Cell::new(Resources::default()),
            state: Cell::new(PermitState::ActiveUnused),
            used_branches: Cell::new(0),
            marked_as_used: Cell::new(false),
            blocked_branches: Cell::new(0),
            marked_as_blocked: Cell::new(false),
            timeout: Cell::new(timeout),
            sstables_read: Cell::new(0),
            requested_memory: Cell::new(0),
            memory_future: RefCell::new(None),
            oom_kills: Cell::new(0),
            _gate: gate,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> PermitState {
        self.state.get()
    }

    pub(crate) fn schema(&self) -> Option<&Rc<TableRef>> {
        self.schema.as_ref()
    }

    pub(crate) fn op_name(&self) -> &str {
        &self.op_name
    }

    pub(crate) fn sem(&self) -> &Rc<SemaphoreInner> {
        &self.sem
    }

    pub(crate) fn resources(&self) -> Resources {
        self.resources.get()
    }

    pub(crate) fn base_resources(&self) -> Resources {
        self.base_resources.get()
    }

    pub(crate) fn description(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}:{}", schema, self.op_name),
            None => format!("*.*:{}", self.op_name),
        }
    }

    fn on_permit_used(&self) {
        self.sem.on_permit_used();
        self.marked_as_used.set(true);
    }

    fn on_permit_unused(&self) {
        self.sem.on_permit_unused();
        self.marked_as_used.set(false);
    }

    fn on_permit_blocked(&self) {
        self.sem.on_permit_blocked();
        self.marked_as_blocked.set(true);
    }

    fn on_permit_unblocked(&self) {
        self.sem.on_permit_unblocked();
        self.marked_as_blocked.set(false);
    }

    /// Re-derives the active state from the branch counters, re-registering
    /// the permit's used/blocked contribution with the semaphore.
    fn on_permit_active(&self) {
        if self.used_branches.get() > 0 {
            self.state.set(PermitState::ActiveUsed);
            self.on_permit_used();
            if self.blocked_branches.get() > 0 {
                self.state.set(PermitState::ActiveBlocked);
                self.on_permit_blocked();
            }
        } else {
            self.state.set(PermitState::ActiveUnused);
        }
    }

    /// Moves to a non-active state, withdrawing the permit's used/blocked
    /// contribution while keeping the branch counters intact.
    fn on_permit_inactive(&self, state: PermitState) {
        self.state.set(state);
        if self.marked_as_blocked.get() {
            self.on_permit_unblocked();
        }
        if self.marked_as_used.get() {
            self.on_permit_unused();
        }
    }

    pub(crate) fn on_waiting_for_admission(&self) {
        self.on_permit_inactive(PermitState::WaitingForAdmission);
    }

    pub(crate) fn on_waiting_for_memory(&self, fut: MemoryFuture) {
        self.on_permit_inactive(PermitState::WaitingForMemory);
        *self.memory_future.borrow_mut() = Some(fut);
    }

    pub(crate) fn memory_future(&self) -> MemoryFuture {
        self.memory_future
            .borrow()
            .clone()
            .expect("a permit waiting for memory must have a memory future")
    }

    pub(crate) fn on_admission(&self) -> WeirResult<()> {
        debug_assert_ne!(self.state.get(), PermitState::ActiveBlocked);
        self.on_permit_active();
        self.consume(self.base_resources.get())?;
        self.base_consumed.set(true);
        Ok(())
    }

    pub(crate) fn on_granted_memory(&self) -> WeirResult<()> {
        if self.state.get() == PermitState::WaitingForMemory {
            self.on_permit_active();
        }
        let requested = self.requested_memory.replace(0);
        self.consume(Resources::with_memory(requested))
    }

    pub(crate) fn on_register_as_inactive(&self) {
        debug_assert!(matches!(
            self.state.get(),
            PermitState::ActiveUnused | PermitState::ActiveUsed
        ));
        self.on_permit_inactive(PermitState::Inactive);
    }

    pub(crate) fn on_unregister_as_inactive(&self) {
        debug_assert_eq!(self.state.get(), PermitState::Inactive);
        self.on_permit_active();
    }

    pub(crate) fn on_evicted(&self) {
        debug_assert_eq!(self.state.get(), PermitState::Inactive);
        self.state.set(PermitState::Evicted);
        if self.base_consumed.replace(false) {
            self.signal(self.base_resources.get());
        }
    }

    pub(crate) fn consume(&self, r: Resources) -> WeirResult<()> {
        self.sem.consume(self, r)?;
        self.resources.set(self.resources.get() + r);
        Ok(())
    }

    pub(crate) fn signal(&self, r: Resources) {
        self.resources.set(self.resources.get() - r);
        self.sem.signal(r);
    }

    pub(crate) fn add_requested_memory(&self, memory: i64) {
        self.requested_memory.set(self.requested_memory.get() + memory);
    }

    pub(crate) fn release_base_resources(&self) {
        if self.base_consumed.replace(false) {
            self.resources
                .set(self.resources.get() - self.base_resources.get());
            self.sem.signal(self.base_resources.replace(Resources::default()));
        } else {
            self.base_resources.set(Resources::default());
        }
    }

    pub(crate) fn mark_used(&self) {
        self.used_branches.set(self.used_branches.get() + 1);
        if !self.marked_as_used.get() && self.state.get() == PermitState::ActiveUnused {
            self.state.set(PermitState::ActiveUsed);
            self.on_permit_used();
            if self.blocked_branches.get() > 0 && !self.marked_as_blocked.get() {
                self.state.set(PermitState::ActiveBlocked);
                self.on_permit_blocked();
            }
        }
    }

    pub(crate) fn mark_unused(&self) {
        let branches = self.used_branches.get();
        if branches == 0 {
            error!(
                permit = %self.description(),
                "mark_unused() called without a matching mark_used()"
            );
            return;
        }
        self.used_branches.set(branches - 1);
        if self.marked_as_used.get() && branches == 1 {
            // Guards may be dropped out of order while unwinding an error
            // path; force the unblock first to keep used >= blocked.
            if self.marked_as_blocked.get() {
                self.on_permit_unblocked();
            }
            self.state.set(PermitState::ActiveUnused);
            self.on_permit_unused();
        }
    }

    pub(crate) fn mark_blocked(&self) {
        self.blocked_branches.set(self.blocked_branches.get() + 1);
        if self.blocked_branches.get() == 1 && self.state.get() == PermitState::ActiveUsed {
            self.state.set(PermitState::ActiveBlocked);
            self.on_permit_blocked();
        }
    }

    pub(crate) fn mark_unblocked(&self) {
        let branches = self.blocked_branches.get();
        if branches == 0 {
            error!(
                permit = %self.description(),
                "mark_unblocked() called without a matching mark_blocked()"
            );
            return;
        }
        self.blocked_branches.set(branches - 1);
        if self.marked_as_blocked.get() && branches == 1 {
            self.state.set(PermitState::ActiveUsed);
            self.on_permit_unblocked();
        }
    }

    pub(crate) fn timeout(&self) -> Option<Instant> {
        self.timeout.get()
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Instant>) {
        if let (Some(old), Some(new)) = (self.timeout.get(), timeout)
            && new < old
            && old - new > Duration::from_millis(100)
        {
            warn!(
                permit = %self.description(),
                skew_ms = (old - new).as_millis() as u64,
                "detected timeout skew, please check time skew between nodes in the cluster"
            );
        }
        self.timeout.set(timeout);
    }

    pub(crate) fn on_start_sstable_read(&self) {
        let reads = self.sstables_read.get();
        self.sstables_read.set(reads + 1);
        self.sem.with_stats(|stats| {
            if reads == 0 {
                stats.disk_reads += 1;
            }
            stats.sstables_read += 1;
        });
    }

    pub(crate) fn on_finish_sstable_read(&self) {
        let reads = self.sstables_read.get();
        if reads == 0 {
            error!(
                permit = %self.description(),
                "on_finish_sstable_read() called without a matching start"
            );
            return;
        }
        self.sstables_read.set(reads - 1);
        self.sem.with_stats(|stats| {
            stats.sstables_read = stats.sstables_read.saturating_sub(1);
            if reads == 1 {
                stats.disk_reads = stats.disk_reads.saturating_sub(1);
            }
        });
    }

    /// Returns whether this is the first kill for the permit; the semaphore's
    /// kill counter must only be bumped once per permit.
    pub(crate) fn on_oom_kill(&self) -> bool {
        let kills = self.oom_kills.get();
        self.oom_kills.set(kills + 1);
        kills == 0
    }

    pub(crate) fn needs_readmission(&self) -> bool {
        self.state.get() == PermitState::Evicted
    }
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        if self.base_consumed.get() {
            self.signal(self.base_resources.get());
        }

        let leaked = self.resources.get();
        if leaked.non_zero() {
            error!(
                permit = %self.description(),
                resources = %leaked,
                "permit dropped while still holding resources, repairing the leak"
            );
            self.signal(leaked);
        }

        if self.used_branches.get() > 0 {
            error!(
                permit = %self.description(),
                branches = self.used_branches.get(),
                "permit dropped with outstanding used branches"
            );
            self.sem.on_permit_unused();
        }

        if self.blocked_branches.get() > 0 {
            error!(
                permit = %self.description(),
                branches = self.blocked_branches.get(),
                "permit dropped with outstanding blocked branches"
            );
            self.sem.on_permit_unblocked();
        }

        let sstables = self.sstables_read.get();
        if sstables > 0 {
            self.sem.with_stats(|stats| {
                stats.sstables_read = stats.sstables_read.saturating_sub(sstables);
                stats.disk_reads = stats.disk_reads.saturating_sub(1);
            });
        }

        self.sem.on_permit_destroyed(self.id);
    }
}

/// A per-read reservation of count and memory, and the accounting context
/// every buffer and storage-file read of that read is attributed to.
///
/// Cloning is cheap; all clones share one reservation. The underlying
/// resources are released when the last clone is dropped, at which point the
/// permit must hold no consumed resources and no used/blocked guards; a
/// violation is logged and repaired.
#[derive(Clone)]
pub struct ReadPermit {
    inner: Rc<PermitInner>,
}

impl ReadPermit {
    pub(crate) fn from_inner(inner: Rc<PermitInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<PermitInner> {
        &self.inner
    }

    pub fn state(&self) -> PermitState {
        self.inner.state()
    }

    /// Debits `r` from the semaphore on behalf of this permit. Fails with
    /// [`WeirError::OutOfMemory`] when the consume would cross the kill
    /// limit, in which case the permit's own counter is left untouched.
    pub fn consume(&self, r: Resources) -> WeirResult<()> {
        self.inner.consume(r)
    }

    /// Credits `r` back. Never fails; immediately reconsiders waiters.
    pub fn signal(&self, r: Resources) {
        self.inner.signal(r)
    }

    /// Consumes `memory` bytes, scoped to the returned units handle.
    pub fn consume_memory(&self, memory: u64) -> WeirResult<ResourceUnits> {
        self.consume_resources(Resources::with_memory(memory as i64))
    }

    /// Consumes `r`, scoped to the returned units handle.
    pub fn consume_resources(&self, r: Resources) -> WeirResult<ResourceUnits> {
        ResourceUnits::new(self.clone(), r)
    }

    /// Requests `memory` additional bytes. Resolves immediately while memory
    /// is available (or the request stays below the serialize limit), blocks
    /// on the memory queue otherwise. Concurrent requests on a permit already
    /// waiting for memory share one completion.
    pub async fn request_memory(&self, memory: u64) -> WeirResult<ResourceUnits> {
        let memory = memory as i64;
        self.inner.add_requested_memory(memory);
        if let Some(grant) = self.inner.sem().request_memory(&self.inner, memory)? {
            grant.await?;
        }
        Ok(ResourceUnits::already_consumed(
            self.clone(),
            Resources::with_memory(memory),
        ))
    }

    pub fn consumed_resources(&self) -> Resources {
        self.inner.resources()
    }

    pub fn base_resources(&self) -> Resources {
        self.inner.base_resources()
    }

    /// Idempotently credits back the base reservation, for callers that have
    /// drained the read but want to keep the permit object alive without
    /// holding its slot.
    pub fn release_base_resources(&self) {
        self.inner.release_base_resources()
    }

    /// `"db.table:op"`, with `*.*` when no schema is attached.
    pub fn description(&self) -> String {
        self.inner.description()
    }

    pub fn schema(&self) -> Option<&Rc<TableRef>> {
        self.inner.schema()
    }

    pub fn op_name(&self) -> &str {
        self.inner.op_name()
    }

    pub fn mark_used(&self) {
        self.inner.mark_used()
    }

    pub fn mark_unused(&self) {
        self.inner.mark_unused()
    }

    pub fn mark_blocked(&self) {
        self.inner.mark_blocked()
    }

    pub fn mark_unblocked(&self) {
        self.inner.mark_unblocked()
    }

    /// RAII form of [`mark_used`](Self::mark_used) /
    /// [`mark_unused`](Self::mark_unused).
    pub fn used_guard(&self) -> UsedGuard {
        UsedGuard::new(self.clone())
    }

    /// RAII form of [`mark_blocked`](Self::mark_blocked) /
    /// [`mark_unblocked`](Self::mark_unblocked).
    pub fn blocked_guard(&self) -> BlockedGuard {
        BlockedGuard::new(self.clone())
    }

    pub fn timeout(&self) -> Option<Instant> {
        self.inner.timeout()
    }

    pub fn set_timeout(&self, timeout: Option<Instant>) {
        self.inner.set_timeout(timeout)
    }

    pub fn on_start_sstable_read(&self) {
        self.inner.on_start_sstable_read()
    }

    pub fn on_finish_sstable_read(&self) {
        self.inner.on_finish_sstable_read()
    }

    /// Whether the permit was evicted and has to go through admission again
    /// before the read can resume.
    pub fn needs_readmission(&self) -> bool {
        self.inner.needs_readmission()
    }

    /// Queues the evicted permit for re-admission.
    pub async fn wait_readmission(&self) -> WeirResult<()> {
        self.inner.sem().do_wait_admission(self.clone(), None).await
    }
}

impl PartialEq for ReadPermit {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPermit")
            .field("description", &self.description())
            .field("state", &self.state())
            .field("resources", &self.consumed_resources())
            .finish()
    }
}

/// A scoped sub-reservation on a permit. Signals the held amount back when
/// dropped.
pub struct ResourceUnits {
    permit: ReadPermit,
    resources: Resources,
}

impl ResourceUnits {
    pub(crate) fn new(permit: ReadPermit, resources: Resources) -> WeirResult<Self> {
        permit.consume(resources)?;
        Ok(Self { permit, resources })
    }

    pub(crate) fn already_consumed(permit: ReadPermit, resources: Resources) -> Self {
        Self { permit, resources }
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn permit(&self) -> &ReadPermit {
        &self.permit
    }

    /// Merges another units handle into this one. Both must belong to the
    /// same permit.
    pub fn add(&mut self, mut other: ResourceUnits) {
        assert!(
            self.permit == other.permit,
            "cannot merge resource units of different permits"
        );
        self.resources += std::mem::take(&mut other.resources);
    }

    /// Replaces the held amount with `r`, consuming the new amount before
    /// signalling the old so the permit's counter never dips spuriously. On
    /// failure the old amount is kept.
    pub fn reset_to(&mut self, r: Resources) -> WeirResult<()> {
        if r.non_zero() {
            self.permit.consume(r)?;
        }
        if self.resources.non_zero() {
            self.permit.signal(self.resources);
        }
        self.resources = r;
        Ok(())
    }
}

impl Drop for ResourceUnits {
    fn drop(&mut self) {
        if self.resources.non_zero() {
            self.permit.signal(self.resources);
        }
    }
}

/// Marks a permit as used for the duration of the guard's lifetime.
pub struct UsedGuard {
    permit: ReadPermit,
}

impl UsedGuard {
    fn new(permit: ReadPermit) -> Self {
        permit.mark_used();
        Self { permit }
    }
}

impl Drop for UsedGuard {
    fn drop(&mut self) {
        self.permit.mark_unused();
    }
}

/// Marks a permit as blocked for the duration of the guard's lifetime.
pub struct BlockedGuard {
    permit: ReadPermit,
}

impl BlockedGuard {
    fn new(permit: ReadPermit) -> Self {
        permit.mark_blocked();
        Self { permit }
    }
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        self.permit.mark_unblocked();
    }
}
