use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Generates `{prefix}-{unix_seconds}-{counter}` identifiers.
///
/// The counter is process-wide per generator and never repeats, so IDs are
/// unique within a run. A persistent store seeds it from its row count.
#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start counting after `start`.
    pub(crate) fn starting_at(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    pub(crate) fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", prefix, Utc::now().timestamp(), n)
    }

    /// Keep `id` when set, otherwise generate one.
    pub(crate) fn assign(&self, id: &mut String, prefix: &str) {
        if id.is_empty() {
            *id = self.next(prefix);
        }
    }
}
