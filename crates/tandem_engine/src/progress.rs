//! Hierarchical, cancellable progress reporting.
//!
//! A [`Progress`] is a cancellation context passed top-down: cancelling a
//! node poisons its whole subtree, and completing a child credits its
//! pending units to the parent. Operations weigh their work in units (a
//! record body is 1 unit, its files 3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    total: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    parent: Option<(Progress, u64)>,
}

/// A hierarchical progress and cancellation token.
///
/// Cloning is cheap and shares state with the original.
#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

impl Progress {
    /// Creates a root progress with the given total unit count.
    pub fn new(total_units: u64) -> Self {
        Self::with_parent(total_units, None)
    }

    fn with_parent(total_units: u64, parent: Option<(Progress, u64)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                total: AtomicU64::new(total_units),
                completed: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                parent,
            }),
        }
    }

    /// Creates a child that credits `pending_units` of this progress when it
    /// completes.
    pub fn child(&self, pending_units: u64) -> Progress {
        Self::with_parent(1, Some((self.clone(), pending_units)))
    }

    /// Sets the total unit count.
    pub fn set_total(&self, units: u64) {
        self.inner.total.store(units, Ordering::SeqCst);
    }

    /// The total unit count.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// The completed unit count.
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Adds completed units, saturating at the total.
    pub fn add_completed(&self, units: u64) {
        let total = self.total();
        let previous = self.inner.completed.fetch_add(units, Ordering::SeqCst);
        if previous + units > total {
            self.inner.completed.store(total, Ordering::SeqCst);
        }
    }

    /// Marks one unit as completed.
    pub fn complete_unit(&self) {
        self.add_completed(1);
    }

    /// Completes the whole progress, crediting the parent once.
    pub fn complete(&self) {
        self.inner
            .completed
            .store(self.total(), Ordering::SeqCst);

        if !self.inner.finished.swap(true, Ordering::SeqCst) {
            if let Some((parent, units)) = &self.inner.parent {
                parent.add_completed(*units);
            }
        }
    }

    /// Returns true if this progress has been completed.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Requests cancellation of this progress and its whole subtree.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if this progress or any of its ancestors was cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some((parent, _)) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Fraction of the total completed, between 0.0 and 1.0.
    pub fn fraction_completed(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return if self.is_finished() { 1.0 } else { 0.0 };
        }
        self.completed() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completing_a_child_credits_the_parent() {
        let parent = Progress::new(4);
        let child = parent.child(3);

        child.set_total(10);
        child.add_completed(10);
        assert_eq!(parent.completed(), 0);

        child.complete();
        assert_eq!(parent.completed(), 3);

        // Completing twice does not double-credit.
        child.complete();
        assert_eq!(parent.completed(), 3);
    }

    #[test]
    fn cancellation_reaches_descendants() {
        let root = Progress::new(1);
        let child = root.child(1);
        let grandchild = child.child(1);

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn cancelling_a_child_leaves_the_parent_alone() {
        let root = Progress::new(1);
        let child = root.child(1);

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn fraction_saturates_at_one() {
        let progress = Progress::new(2);
        progress.add_completed(5);
        assert_eq!(progress.completed(), 2);
        assert!((progress.fraction_completed() - 1.0).abs() < f64::EPSILON);
    }
}
