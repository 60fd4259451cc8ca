//! Validation, sequencing and fan-out.
//!
//! Each consumer gets its own bounded priority mailbox: paid events overtake
//! chat that is still waiting, and a full mailbox sheds its least urgent
//! entry.

use crate::event::{LiveEnvelope, LiveError, LiveEvent, LiveEventKind, LivePayload};
use crate::filter::DanmakuFilter;
use crate::limiter::TokenBucket;
use crate::mailbox::{mailbox, LiveReceiver, MailboxSender, Offer};
use crate::sequence::{SequenceCheck, SequenceTracker};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use yueli_core::config::{ConsumerConfig, EventPriorities, LiveConfig};
use yueli_core::PipelineCounters;

/// What became of one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Passed every check; handed to `delivered` consumers.
    Accepted { delivered: usize },
    Invalid(LiveError),
    /// Danmaku under the minimum score.
    Filtered { score: i32 },
    /// Sequence number at or below the last accepted one.
    OutOfOrder { last: u64 },
}

struct Consumer {
    name: String,
    bucket: TokenBucket,
    tx: MailboxSender,
}

pub struct LiveHub {
    priorities: EventPriorities,
    filter: DanmakuFilter,
    sequences: Mutex<SequenceTracker>,
    consumers: Mutex<Vec<Consumer>>,
    counters: Arc<PipelineCounters>,
}

impl LiveHub {
    pub fn new(config: &LiveConfig, counters: Arc<PipelineCounters>) -> Self {
        Self {
            priorities: config.priorities.clone(),
            filter: DanmakuFilter::new(config),
            sequences: Mutex::new(SequenceTracker::new(config.max_sources)),
            consumers: Mutex::new(Vec::new()),
            counters,
        }
    }

    /// Register a downstream consumer with its own bounded mailbox and
    /// token bucket. Events accepted before this call are not replayed.
    pub async fn subscribe(&self, name: &str, config: &ConsumerConfig) -> LiveReceiver {
        let (tx, rx) = mailbox(config.capacity);
        self.consumers.lock().await.push(Consumer {
            name: name.to_string(),
            bucket: TokenBucket::new(config.rate_per_sec, config.burst),
            tx,
        });
        debug!(consumer = name, capacity = config.capacity, rate = config.rate_per_sec, "Live consumer subscribed");
        rx
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.counters
    }

    /// Parse and ingest one wire line.
    pub async fn ingest_line(&self, line: &str) -> IngestOutcome {
        match LiveEnvelope::parse(line) {
            Ok(envelope) => self.ingest(envelope).await,
            Err(e) => {
                PipelineCounters::bump(&self.counters.live_received);
                self.reject(e)
            }
        }
    }

    pub async fn ingest(&self, envelope: LiveEnvelope) -> IngestOutcome {
        PipelineCounters::bump(&self.counters.live_received);

        let mut event = match LiveEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(e) => return self.reject(e),
        };

        let check = self.sequences.lock().await.observe(&event.source, event.sequence);
        match check {
            SequenceCheck::Stale { last } => {
                PipelineCounters::bump(&self.counters.live_out_of_order);
                warn!(source = %event.source, sequence = event.sequence, last, "Out-of-order live event rejected");
                return IngestOutcome::OutOfOrder { last };
            }
            SequenceCheck::Gap(missing) => {
                PipelineCounters::add(&self.counters.live_sequence_gaps, missing);
                warn!(source = %event.source, sequence = event.sequence, missing, "Live sequence gap");
            }
            SequenceCheck::First | SequenceCheck::InOrder => {}
        }

        event.priority = self.base_priority(event.kind);
        if let LivePayload::Danmaku(d) = &event.payload {
            let score = self.filter.score(&d.content);
            if !self.filter.accepts(score) {
                PipelineCounters::bump(&self.counters.live_filtered);
                trace!(source = %event.source, score, "Danmaku filtered");
                return IngestOutcome::Filtered { score };
            }
            event.priority += score;
        }

        let delivered = self.fan_out(Arc::new(event)).await;
        IngestOutcome::Accepted { delivered }
    }

    fn reject(&self, e: LiveError) -> IngestOutcome {
        PipelineCounters::bump(&self.counters.live_invalid);
        warn!("Invalid live envelope: {}", e);
        IngestOutcome::Invalid(e)
    }

    fn base_priority(&self, kind: LiveEventKind) -> i32 {
        match kind {
            LiveEventKind::Danmaku => self.priorities.danmaku,
            LiveEventKind::Gift => self.priorities.gift,
            LiveEventKind::SuperChat => self.priorities.super_chat,
            LiveEventKind::Guard => self.priorities.guard,
            LiveEventKind::Heartbeat => self.priorities.heartbeat,
        }
    }

    /// Offer the event to every consumer without waiting on any of them.
    /// Closed consumers are unsubscribed.
    async fn fan_out(&self, event: Arc<LiveEvent>) -> usize {
        let mut consumers = self.consumers.lock().await;
        let mut delivered = 0;

        consumers.retain_mut(|consumer| {
            if consumer.tx.is_closed() {
                debug!(consumer = %consumer.name, "Live consumer gone, unsubscribing");
                return false;
            }
            if !consumer.bucket.try_take() {
                PipelineCounters::bump(&self.counters.live_rate_limited);
                trace!(consumer = %consumer.name, source = %event.source, "Rate limited");
                return true;
            }
            match consumer.tx.offer(Arc::clone(&event)) {
                Offer::Queued => {
                    delivered += 1;
                    true
                }
                Offer::Displaced(old) => {
                    delivered += 1;
                    PipelineCounters::bump(&self.counters.live_consumer_overflow);
                    warn!(
                        consumer = %consumer.name,
                        source = %old.source,
                        priority = old.priority,
                        "Live consumer full, less urgent event dropped"
                    );
                    true
                }
                Offer::Rejected => {
                    PipelineCounters::bump(&self.counters.live_consumer_overflow);
                    warn!(consumer = %consumer.name, source = %event.source, "Live consumer full, event dropped");
                    true
                }
                Offer::Closed => false,
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn line(source: &str, kind: &str, sequence: u64, payload: serde_json::Value) -> String {
        serde_json::json!({
            "source": source,
            "type": kind,
            "sequence": sequence,
            "payload": payload,
        })
        .to_string()
    }

    fn danmaku(seq: u64, content: &str) -> String {
        line("bili", "danmaku", seq, serde_json::json!({"user": "u", "content": content}))
    }

    fn unlimited(capacity: usize) -> ConsumerConfig {
        ConsumerConfig {
            capacity,
            rate_per_sec: 0.0,
            burst: 1,
        }
    }

    fn hub() -> (LiveHub, Arc<PipelineCounters>) {
        let counters = Arc::new(PipelineCounters::default());
        (LiveHub::new(&LiveConfig::default(), counters.clone()), counters)
    }

    #[tokio::test]
    async fn test_fan_out_to_every_consumer() {
        let (hub, counters) = hub();
        let mut a = hub.subscribe("dialogue", &unlimited(8)).await;
        let mut b = hub.subscribe("decision", &unlimited(8)).await;

        let outcome = hub.ingest_line(&danmaku(1, "月璃今天唱歌吗？")).await;
        assert_eq!(outcome, IngestOutcome::Accepted { delivered: 2 });

        let ev_a = a.recv().await.unwrap();
        let ev_b = b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&ev_a, &ev_b));
        // danmaku base 10 plus a score of 70
        assert_eq!(ev_a.priority, 80);
        assert_eq!(counters.snapshot().live_received, 1);
    }

    #[tokio::test]
    async fn test_paid_event_priority() {
        let (hub, _) = hub();
        let mut rx = hub.subscribe("dialogue", &unlimited(8)).await;
        hub.ingest_line(&line("bili", "guard", 1, serde_json::json!({"user": "u", "gift_name": "舰长"})))
            .await;
        assert_eq!(rx.recv().await.unwrap().priority, 100);
    }

    #[tokio::test]
    async fn test_invalid_lines_counted() {
        let (hub, counters) = hub();
        assert!(matches!(hub.ingest_line("garbage").await, IngestOutcome::Invalid(LiveError::Malformed(_))));
        assert!(matches!(
            hub.ingest_line(&line("bili", "like", 1, serde_json::json!({}))).await,
            IngestOutcome::Invalid(LiveError::UnknownType(_))
        ));
        assert!(matches!(
            hub.ingest_line(&line("", "heartbeat", 1, serde_json::Value::Null)).await,
            IngestOutcome::Invalid(LiveError::MissingSource)
        ));
        let snap = counters.snapshot();
        assert_eq!(snap.live_invalid, 3);
        assert_eq!(snap.live_received, 3);
    }

    #[tokio::test]
    async fn test_gap_accepted_and_counted() {
        let (hub, counters) = hub();
        let mut rx = hub.subscribe("dialogue", &unlimited(8)).await;
        hub.ingest_line(&danmaku(1, "晚上好呀大家")).await;
        let outcome = hub.ingest_line(&danmaku(5, "又来看直播了")).await;
        assert_eq!(outcome, IngestOutcome::Accepted { delivered: 1 });
        assert_eq!(counters.snapshot().live_sequence_gaps, 3);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let (hub, counters) = hub();
        let mut rx = hub.subscribe("dialogue", &unlimited(8)).await;
        hub.ingest_line(&danmaku(3, "晚上好呀大家")).await;
        assert_eq!(hub.ingest_line(&danmaku(3, "晚上好呀大家")).await, IngestOutcome::OutOfOrder { last: 3 });
        assert_eq!(hub.ingest_line(&danmaku(2, "晚上好呀大家")).await, IngestOutcome::OutOfOrder { last: 3 });
        assert_eq!(counters.snapshot().live_out_of_order, 2);

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_low_score_danmaku_filtered() {
        let (hub, counters) = hub();
        let mut rx = hub.subscribe("dialogue", &unlimited(8)).await;
        assert_eq!(hub.ingest_line(&danmaku(1, "草")).await, IngestOutcome::Filtered { score: 10 });
        assert_eq!(counters.snapshot().live_filtered, 1);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_drops_are_counted_and_queue_bounded() {
        let (hub, counters) = hub();
        let mut rx = hub
            .subscribe(
                "decision",
                &ConsumerConfig {
                    capacity: 4,
                    rate_per_sec: 2.0,
                    burst: 2,
                },
            )
            .await;

        for seq in 1..=20 {
            hub.ingest_line(&line("bili", "gift", seq, serde_json::json!({"user": "u", "gift_name": "辣条"})))
                .await;
        }
        let snap = counters.snapshot();
        assert_eq!(snap.live_rate_limited, 18);

        assert_eq!(rx.len(), 2);
        while rx.try_recv().is_some() {}

        // Tokens come back with time.
        tokio::time::advance(Duration::from_secs(1)).await;
        hub.ingest_line(&line("bili", "gift", 21, serde_json::json!({"user": "u", "gift_name": "辣条"})))
            .await;
        assert!(rx.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_full_consumer_drops_without_blocking() {
        let (hub, counters) = hub();
        let _slow = hub.subscribe("slow", &unlimited(2)).await;
        let mut fast = hub.subscribe("fast", &unlimited(16)).await;

        for seq in 1..=5 {
            hub.ingest_line(&line("bili", "heartbeat", seq, serde_json::Value::Null)).await;
        }
        assert_eq!(counters.snapshot().live_consumer_overflow, 3);
        assert_eq!(fast.len(), 5);
    }

    #[tokio::test]
    async fn test_gift_overtakes_waiting_danmaku() {
        let (hub, _) = hub();
        let mut rx = hub.subscribe("dialogue", &unlimited(8)).await;

        hub.ingest_line(&danmaku(1, "今天唱什么歌呀")).await;
        hub.ingest_line(&line("bili", "gift", 2, serde_json::json!({"user": "u", "gift_name": "辣条"})))
            .await;
        hub.ingest_line(&line("bili", "super_chat", 3, serde_json::json!({"user": "u", "content": "加油"})))
            .await;

        let order: Vec<_> = std::iter::from_fn(|| rx.try_recv()).map(|e| e.kind).collect();
        assert_eq!(
            order,
            vec![LiveEventKind::SuperChat, LiveEventKind::Gift, LiveEventKind::Danmaku]
        );
    }

    #[tokio::test]
    async fn test_full_consumer_keeps_the_most_urgent() {
        let (hub, counters) = hub();
        let mut rx = hub.subscribe("decision", &unlimited(2)).await;

        hub.ingest_line(&danmaku(1, "今天唱什么歌呀")).await;
        hub.ingest_line(&danmaku(2, "晚上好呀大家")).await;
        let outcome = hub
            .ingest_line(&line("bili", "guard", 3, serde_json::json!({"user": "u", "gift_name": "舰长"})))
            .await;
        assert_eq!(outcome, IngestOutcome::Accepted { delivered: 1 });
        assert_eq!(counters.snapshot().live_consumer_overflow, 1);

        assert_eq!(rx.recv().await.unwrap().kind, LiveEventKind::Guard);
        assert_eq!(rx.recv().await.unwrap().kind, LiveEventKind::Danmaku);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_consumer_unsubscribed() {
        let (hub, _) = hub();
        let rx = hub.subscribe("gone", &unlimited(2)).await;
        drop(rx);
        let outcome = hub.ingest_line(&line("bili", "heartbeat", 1, serde_json::Value::Null)).await;
        assert_eq!(outcome, IngestOutcome::Accepted { delivered: 0 });
        assert_eq!(hub.consumer_count().await, 0);
    }
}
