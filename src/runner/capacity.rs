//! Counting admission control for task executions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Limits the number of concurrently running tasks.
///
/// Wraps an `AtomicUsize` counter with CAS-based `try_acquire()`. Acquire
/// never blocks: a caller that loses the race gets `false` and backs off.
#[derive(Debug)]
pub struct CapacityGate {
    active: AtomicUsize,
    max: usize,
}

impl CapacityGate {
    /// Create a gate with the given capacity (clamped to at least 1).
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max: max.max(1),
        }
    }

    /// Try to acquire a slot. Returns `true` if successful.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a slot previously obtained from `try_acquire()`.
    pub fn release(&self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "capacity slot released more often than acquired");
    }

    /// Acquire a slot that releases itself when dropped.
    pub fn try_slot(self: &Arc<Self>) -> Option<CapacitySlot> {
        self.try_acquire().then(|| CapacitySlot {
            gate: Arc::clone(self),
        })
    }

    /// Slots currently held.
    pub fn outstanding(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.outstanding())
    }

    pub fn capacity(&self) -> usize {
        self.max
    }
}

/// A held capacity permit.
///
/// Released exactly once, on drop, whichever way the holder exits
/// (including unwinding).
#[derive(Debug)]
pub struct CapacitySlot {
    gate: Arc<CapacityGate>,
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.gate.release();
    }
}
