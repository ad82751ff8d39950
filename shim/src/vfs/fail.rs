use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Switch that makes a shim's writes fail with `SQLITE_FULL`.
///
/// Clones share one flag, so a harness keeps a clone and toggles it while the
/// shim it was handed to reads it on every write. Separate `new()` flags are
/// independent. Toggling is expected to happen between quiescent phases of a
/// test; a write racing with a toggle may observe either state.
#[derive(Clone, Debug, Default)]
pub struct WriteFailFlag {
    inner: Arc<AtomicBool>,
}

impl WriteFailFlag {
    /// A new flag, initially clear.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.set_to(true);
    }

    pub fn clear(&self) {
        self.set_to(false);
    }

    pub fn set_to(&self, fail: bool) {
        self.inner.store(fail, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}
