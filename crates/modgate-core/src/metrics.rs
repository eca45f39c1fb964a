//! Process-wide pipeline counters.
//!
//! Increments are relaxed atomics. [`Metrics::snapshot`] reads them all for
//! reporting and [`Metrics::flush`] logs them as one event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub static METRICS: Metrics = Metrics::new();

macro_rules! counters {
    ($($field:ident => $inc:ident),+ $(,)?) => {
        pub struct Metrics {
            $($field: AtomicU64,)+
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct MetricsSnapshot {
            $(pub $field: u64,)+
        }

        impl Metrics {
            pub const fn new() -> Self {
                Self {
                    $($field: AtomicU64::new(0),)+
                }
            }

            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(metric = stringify!($field), "counter incremented");
                }
            )+

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }

            /// Zero every counter.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)+
            }
        }
    };
}

counters! {
    pipelines_started => inc_pipelines_started,
    promotions => inc_promotions,
    rejections => inc_rejections,
    testing_failures => inc_testing_failures,
    sandbox_runs => inc_sandbox_runs,
    sandbox_timeouts => inc_sandbox_timeouts,
    limit_kills => inc_limit_kills,
    repairs => inc_repairs,
    rate_limited => inc_rate_limited,
    lock_timeouts => inc_lock_timeouts,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            pipelines_started = s.pipelines_started,
            promotions = s.promotions,
            rejections = s.rejections,
            testing_failures = s.testing_failures,
            sandbox_runs = s.sandbox_runs,
            sandbox_timeouts = s.sandbox_timeouts,
            limit_kills = s.limit_kills,
            repairs = s.repairs,
            rate_limited = s.rate_limited,
            lock_timeouts = s.lock_timeouts,
        );
    }
}
