use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies the [`crate::State`] a problem or plan was created by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StateId(u64);

static NEXT_STATE: AtomicU64 = AtomicU64::new(0);

impl StateId {
    /// Generates an incrementing sequence of IDs, unique within the process.
    pub(crate) fn next_id() -> Self {
        Self(NEXT_STATE.fetch_add(1, Ordering::Relaxed))
    }
}
