//! Unique id generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonically increasing id source, seeded from wall-clock milliseconds.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    next: Arc<AtomicU64>,
}

impl SequenceGenerator {
    /// Seed from the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(u64::try_from(crate::now_millis()).unwrap_or_default())
    }

    /// Seed from an explicit value; the first id returned is `seed + 1`.
    #[must_use]
    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(seed)),
        }
    }

    /// Next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
