//! Operator-facing counters.
//!
//! Drops, timeouts and rejections are never raised as errors; they are counted
//! here and read through [`PipelineCounters::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        /// Lock-free counters shared (via `Arc`) by every pipeline stage.
        #[derive(Debug, Default)]
        pub struct PipelineCounters {
            $($(#[$meta])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`PipelineCounters`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct CounterSnapshot {
            $(pub $name: u64,)*
        }

        impl PipelineCounters {
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    live_received,
    /// Envelopes failing validation (bad type, missing source, bad JSON).
    live_invalid,
    /// Danmaku under the minimum score.
    live_filtered,
    /// Events missing between two received sequence numbers.
    live_sequence_gaps,
    /// Duplicate or regressed sequence numbers.
    live_out_of_order,
    live_rate_limited,
    /// Consumer channel full.
    live_consumer_overflow,
    decisions_selected,
    decisions_noop,
    dispatch_acked,
    dispatch_timeouts,
    dispatch_failed,
    dispatch_retries,
    /// Backpressure and validation rejections at submission.
    dispatch_rejected,
    dispatch_cancelled,
    audio_played,
    audio_preempted,
    audio_cancelled,
    audio_dropped,
    audio_delivery_failed,
    unknown_dimensions,
    session_not_found,
}

impl PipelineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
