use std::{cell::Cell, fmt, rc::Rc};

use tokio::sync::Notify;

/// Wraps a byte count so its [`std::fmt::Debug`] output reads as a size in
/// the largest binary unit that fits (B through TiB), with up to two
/// fractional digits. A fraction of zero is dropped, and a trailing
/// fractional zero is shortened to one digit.
///
/// # Examples
///
/// ```
/// # use weir::base::ByteSize;
/// assert_eq!(format!("{:?}", ByteSize(484)),        "484B");
/// assert_eq!(format!("{:?}", ByteSize(1536)),       "1.5KiB");
/// assert_eq!(format!("{:?}", ByteSize(2147483648)), "2GiB");
/// assert_eq!(format!("{:?}", ByteSize(2684354560)), "2.5GiB");
/// ```
pub struct ByteSize(pub u64);

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1 << 40, "TiB"),
            (1 << 30, "GiB"),
            (1 << 20, "MiB"),
            (1 << 10, "KiB"),
        ];

        for (unit, suffix) in UNITS {
            if self.0 < unit {
                continue;
            }
            let whole = self.0 / unit;
            // Fraction in hundredths, without going through floats.
            let hundredths = self.0 % unit * 100 / unit;
            return match hundredths {
                0 => write!(f, "{whole}{suffix}"),
                h if h % 10 == 0 => write!(f, "{whole}.{}{suffix}", h / 10),
                h => write!(f, "{whole}.{h:02}{suffix}"),
            };
        }
        write!(f, "{}B", self.0)
    }
}

/// A shared scalar that can be updated while the semaphore is running.
/// Cloning shares the underlying cell, so the holder of any clone can
/// retune the value and every reader observes the update on its next read.
///
/// Shard-local, like everything else in this crate.
#[derive(Debug, Clone)]
pub struct LiveValue<T: Copy> {
    value: Rc<Cell<T>>,
}

impl<T: Copy> LiveValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Rc::new(Cell::new(value)),
        }
    }

    pub fn get(&self) -> T {
        self.value.get()
    }

    pub fn set(&self, value: T) {
        self.value.set(value);
    }
}

/// A counting gate for background work that must be drained on shutdown.
///
/// Tasks enter the gate while they run; [`Gate::close`] flips the gate shut
/// (no new entries) and waits until every outstanding [`GateGuard`] has been
/// dropped.
pub(crate) struct Gate {
    inner: Rc<GateInner>,
}

struct GateInner {
    entered: Cell<u64>,
    closed: Cell<bool>,
    released: Notify,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(GateInner {
                entered: Cell::new(0),
                closed: Cell::new(false),
                released: Notify::new(),
            }),
        }
    }

    /// Returns `None` once the gate has been closed.
    pub(crate) fn try_enter(&self) -> Option<GateGuard> {
        if self.inner.closed.get() {
            return None;
        }
        self.inner.entered.set(self.inner.entered.get() + 1);
        Some(GateGuard {
            inner: self.inner.clone(),
        })
    }

    /// Shuts the gate and waits for all outstanding guards to be dropped.
    pub(crate) async fn close(&self) {
        self.inner.closed.set(true);
        while self.inner.entered.get() > 0 {
            self.inner.released.notified().await;
        }
    }
}

pub(crate) struct GateGuard {
    inner: Rc<GateInner>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let remaining = self.inner.entered.get() - 1;
        self.inner.entered.set(remaining);
        if remaining == 0 && self.inner.closed.get() {
            self.inner.released.notify_one();
        }
    }
}
