use std::cell::Cell;
use std::collections::HashMap;
use std::fmt::Write;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use crate::base::{ByteSize, Resources, TableId, TableRef};
use crate::permit::PermitState;

/// Point-in-time view of one permit, taken while the semaphore state is
/// borrowed and formatted afterwards.
pub(crate) struct PermitSnapshot {
    pub(crate) schema: Option<Rc<TableRef>>,
    pub(crate) op_name: String,
    pub(crate) state: PermitState,
    pub(crate) resources: Resources,
}

#[derive(Default)]
struct GroupStats {
    permits: u64,
    resources: Resources,
}

/// Renders the permit dump: permits grouped by (table, operation, state),
/// sorted by memory footprint descending, capped at `max_lines` groups with
/// the remainder collapsed, followed by a total row. `max_lines == 0` means
/// no cap.
pub(crate) fn format_permit_dump(
    name: &str,
    initial: Resources,
    available: Resources,
    problem: &str,
    permits: &[PermitSnapshot],
    max_lines: usize,
) -> String {
    type GroupKey = (Option<TableId>, String, PermitState);

    let mut groups: HashMap<GroupKey, (Option<Rc<TableRef>>, GroupStats)> = HashMap::new();
    for snapshot in permits {
        let key = (
            snapshot.schema.as_ref().map(|s| s.id),
            snapshot.op_name.clone(),
            snapshot.state,
        );
        let (_, stats) = groups
            .entry(key)
            .or_insert_with(|| (snapshot.schema.clone(), GroupStats::default()));
        stats.permits += 1;
        stats.resources += snapshot.resources;
    }

    let mut summaries: Vec<_> = groups.into_iter().collect();
    summaries.sort_by_key(|(_, (_, stats))| std::cmp::Reverse(stats.resources.memory));

    let mut out = String::new();
    let consumed = initial - available;
    let _ = writeln!(
        out,
        "semaphore {} with {}/{} count and {}/{} memory resources: {}, dumping permit diagnostics:",
        name, consumed.count, initial.count, consumed.memory, initial.memory, problem,
    );
    let _ = writeln!(out, "permits\tcount\tmemory\ttable/description/state");

    let mut total = GroupStats::default();
    let mut omitted = GroupStats::default();
    let mut lines = 0usize;
    for ((_, op_name, state), (schema, stats)) in &summaries {
        total.permits += stats.permits;
        total.resources += stats.resources;
        if max_lines == 0 || lines < max_lines {
            lines += 1;
            let table = match schema {
                Some(schema) => schema.to_string(),
                None => "*.*".to_owned(),
            };
            let _ = writeln!(
                out,
                "{}\t{}\t{:?}\t{}/{}/{}",
                stats.permits,
                stats.resources.count,
                ByteSize(stats.resources.memory.max(0) as u64),
                table,
                op_name,
                state,
            );
        } else {
            omitted.permits += stats.permits;
            omitted.resources += stats.resources;
        }
    }
    if omitted.permits > 0 {
        let _ = writeln!(
            out,
            "{}\t{}\t{:?}\tpermits omitted for brevity",
            omitted.permits,
            omitted.resources.count,
            ByteSize(omitted.resources.memory.max(0) as u64),
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{}\t{}\t{:?}\ttotal",
        total.permits,
        total.resources.count,
        ByteSize(total.resources.memory.max(0) as u64),
    );
    out
}

/// Suppresses repeat emissions within a fixed period. Each diagnostics call
/// site holds its own limiter, so one noisy trigger cannot silence another.
pub(crate) struct RateLimiter {
    period: Duration,
    last: Cell<Option<Instant>>,
}

impl RateLimiter {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period,
            last: Cell::new(None),
        }
    }

    pub(crate) fn should_fire(&self) -> bool {
        let now = Instant::now();
        match self.last.get() {
            Some(last) if now < last + self.period => false,
            _ => {
                self.last.set(Some(now));
                true
            }
        }
    }
}
