//! In-flight item accounting
//!
//! Executors bound memory by capping how many items are pulled from their
//! input but not yet yielded downstream. [`InFlightGauge`] tracks that
//! number and its high-water mark so the bound can be observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of items that are pulled but not yet yielded
#[derive(Debug, Clone, Default)]
pub struct InFlightGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// Point-in-time view of an [`InFlightGauge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightStats {
    /// Items currently in flight
    pub current: usize,

    /// Highest in-flight count observed
    pub peak: usize,

    /// Items that entered since creation
    pub total: usize,
}

impl InFlightGauge {
    /// Create a gauge at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` items pulled from the input
    pub fn enter(&self, n: usize) {
        let now = self.inner.current.fetch_add(n, Ordering::AcqRel) + n;
        self.inner.total.fetch_add(n, Ordering::Relaxed);
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
    }

    /// Record `n` items yielded downstream (or discarded)
    pub fn leave(&self, n: usize) {
        let _ = self
            .inner
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            });
    }

    /// Items currently in flight
    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Restart peak tracking from the current level
    pub fn reset_peak(&self) {
        self.inner.peak.store(self.current(), Ordering::Release);
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> InFlightStats {
        InFlightStats {
            current: self.current(),
            peak: self.peak(),
            total: self.inner.total.load(Ordering::Relaxed),
        }
    }
}
