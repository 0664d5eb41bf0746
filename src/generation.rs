//! Monotonic generation counter used to cancel in-flight device-programming
//! streams without plumbing explicit task handles through the coordinator.
//!
//! Every programming stream is tagged with the counter's value at the
//! moment it starts; it re-checks the live value before each send and
//! treats a mismatch as cancellation, not failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Generation(Arc::new(AtomicU64::new(0)))
    }

    /// Advances the counter and returns the new value. Call immediately
    /// before starting a new stream so any stream already in flight observes
    /// a mismatch at its next check.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn matches(&self, expected: u64) -> bool {
        self.current() == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_advances_and_invalidates_old_snapshot() {
        let gen = Generation::new();
        let first = gen.current();
        assert!(gen.matches(first));
        let second = gen.bump();
        assert!(second > first);
        assert!(!gen.matches(first));
        assert!(gen.matches(second));
    }

    #[test]
    fn clones_share_the_same_counter() {
        let gen = Generation::new();
        let clone = gen.clone();
        clone.bump();
        assert_eq!(gen.current(), clone.current());
    }
}
