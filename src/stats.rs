//! Lock-free counters describing event core activity.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters shared by every part of the event core.
///
/// All updates are `Relaxed`; the counters are diagnostics, not
/// synchronization.
#[derive(Debug, Default)]
pub struct EventCounters {
    posted: AtomicUsize,
    delivered: AtomicUsize,
    duplicates_suppressed: AtomicUsize,
    callback_faults: AtomicUsize,
    deferred_enqueued: AtomicUsize,
    deferred_delivered: AtomicUsize,
    deferred_dropped: AtomicUsize,
    collector_flushed: AtomicUsize,
    collector_dropped: AtomicUsize,
    invariant_violations: AtomicUsize,
}

macro_rules! counter_ops {
    ($($field:ident => $record:ident),+ $(,)?) => {
        impl EventCounters {
            $(
                #[inline]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )+

            pub fn snapshot(&self) -> EventStats {
                EventStats {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counter_ops! {
    posted => record_posted,
    delivered => record_delivered,
    duplicates_suppressed => record_duplicate_suppressed,
    callback_faults => record_callback_fault,
    deferred_enqueued => record_deferred_enqueued,
    deferred_delivered => record_deferred_delivered,
    deferred_dropped => record_deferred_dropped,
    collector_flushed => record_collector_flushed,
    collector_dropped => record_collector_dropped,
    invariant_violations => record_invariant_violation,
}

/// Point-in-time copy of [`EventCounters`].
///
/// ```
/// use vigil::stats::EventStats;
/// let stats = EventStats::default();
/// assert_eq!(stats.delivered, 0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    /// `post` calls that passed the fast enablement check; the disabled
    /// path itself is never counted
    pub posted: usize,
    /// Callbacks invoked
    pub delivered: usize,
    /// Location-gated events suppressed as duplicates
    pub duplicates_suppressed: usize,
    pub callback_faults: usize,
    pub deferred_enqueued: usize,
    pub deferred_delivered: usize,
    pub deferred_dropped: usize,
    /// Collected records delivered to at least one environment
    pub collector_flushed: usize,
    /// Collected records whose object died before the flush
    pub collector_dropped: usize,
    pub invariant_violations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let counters = EventCounters::default();
        counters.record_posted();
        counters.record_posted();
        counters.record_delivered();
        counters.record_deferred_dropped();

        let stats = counters.snapshot();
        assert_eq!(stats.posted, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.deferred_dropped, 1);
        assert_eq!(stats.callback_faults, 0);
    }
}
