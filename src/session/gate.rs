//! Request serializer: at most one generation in flight per session.
//!
//! Submissions never queue. [`RequestGate::try_acquire`] either hands out
//! the single [`InFlightGuard`] or reports the session busy. The guard
//! travels with the job to the worker and frees the slot when dropped,
//! whichever way the job ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct RequestGate {
    in_flight: Arc<AtomicBool>,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the in-flight slot. `None` if a request already holds it.
    pub fn try_acquire(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                flag: self.in_flight.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Holds the in-flight slot until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
