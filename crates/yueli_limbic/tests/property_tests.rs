//! Property-based tests for the emotion store.
//!
//! Each case drives a paused tokio clock so decay is deterministic.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use yueli_core::affect::DEFAULT_DIMENSIONS;
use yueli_core::config::EmotionConfig;
use yueli_core::{EmotionDelta, PipelineCounters, SessionId};
use yueli_limbic::EmotionStore;

#[derive(Debug, Clone)]
enum Step {
    Apply(String, f32),
    Wait(u64),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (
            prop::sample::select(DEFAULT_DIMENSIONS.to_vec()).prop_map(str::to_string),
            -3.0f32..=3.0
        )
            .prop_map(|(d, v)| Step::Apply(d, v)),
        (0u64..3_600).prop_map(Step::Wait),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    /// Whatever sequence of deltas and waits, every dimension stays in [-1, 1].
    #[test]
    fn values_stay_bounded(steps in prop::collection::vec(arb_step(), 1..40)) {
        let rt = paused_runtime();
        let ok = rt.block_on(async {
            let store = EmotionStore::new(&EmotionConfig::default(), Arc::new(PipelineCounters::default()));
            let session = SessionId::from("prop");
            for step in steps {
                match step {
                    Step::Apply(dim, v) => {
                        let s = store.apply_delta(&session, &EmotionDelta::new().with(dim, v)).await;
                        if s.iter().any(|(_, v)| !(-1.0..=1.0).contains(&v)) {
                            return false;
                        }
                    }
                    Step::Wait(secs) => tokio::time::advance(Duration::from_secs(secs)).await,
                }
            }
            match store.snapshot(&session).await {
                Some(s) => s.iter().all(|(_, v)| (-1.0..=1.0).contains(&v)),
                None => false,
            }
        });
        prop_assert!(ok);
    }

    /// With no writes, distance from baseline only shrinks over time.
    #[test]
    fn idle_session_relaxes(start in -1.0f32..=1.0, waits in prop::collection::vec(1u64..900, 1..10)) {
        let rt = paused_runtime();
        let ok = rt.block_on(async {
            let store = EmotionStore::new(&EmotionConfig::default(), Arc::new(PipelineCounters::default()));
            let session = SessionId::from("prop");
            store.apply_delta(&session, &EmotionDelta::new().with("fear", start)).await;
            let mut last = start.abs();
            for secs in waits {
                tokio::time::advance(Duration::from_secs(secs)).await;
                let now = match store.snapshot(&session).await {
                    Some(s) => s.get("fear").abs(),
                    None => return false,
                };
                if now > last + 1e-6 {
                    return false;
                }
                last = now;
            }
            true
        });
        prop_assert!(ok);
    }
}
