//! End-to-end turns through the pipeline with a recording avatar and the
//! simulated audio device.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use yueli_core::{
    ActionCatalog, DispatchStatus, EmotionDelta, NoOpReason, SemanticSignal, SessionId, TriggerBinding, YueliConfig,
    YueliError,
};
use yueli_expression::{AvatarControl, AvatarError};
use yueli_live::LiveHub;
use yueli_pipeline::{Pipeline, TurnOutcome};
use yueli_voice::{AudioOutcome, SilentTts, SimulatedOutput};

const CATALOG: &str = r#"
[[action]]
id = "angry"
label = "生气"
group = "face"
affinity = { anger = 1.0 }
triggers = [{ hotkey = "Angry" }]
sound = "sounds/angry.wav"

[[action]]
id = "heart_eyes"
label = "爱心眼"
group = "face"
aliases = ["happy", "thanks"]
affinity = { joy = 1.0 }
triggers = [{ hotkey = "HeartEyes" }]

[[action]]
id = "wave"
label = "挥手"
group = "body"
aliases = ["celebrate"]
triggers = [{ hotkey = "WaveStart" }, { hotkey = "WaveEnd" }]
"#;

#[derive(Default)]
struct RecordingAvatar {
    fired: Mutex<Vec<String>>,
}

#[async_trait]
impl AvatarControl for RecordingAvatar {
    async fn trigger(&self, binding: &TriggerBinding) -> Result<(), AvatarError> {
        self.fired.lock().await.push(binding.hotkey.clone());
        Ok(())
    }
}

struct Rig {
    pipeline: Arc<Pipeline>,
    avatar: Arc<RecordingAvatar>,
    output: Arc<SimulatedOutput>,
    config: YueliConfig,
}

fn rig() -> Rig {
    let config = YueliConfig::default();
    let catalog = ActionCatalog::from_toml_str(CATALOG, &config.catalog_rules()).unwrap();
    let avatar = Arc::new(RecordingAvatar::default());
    let output = Arc::new(SimulatedOutput::new("CABLE Input"));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        catalog,
        avatar.clone(),
        output.clone(),
        Arc::new(SilentTts::default()),
    ));
    Rig {
        pipeline,
        avatar,
        output,
        config,
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_session_is_counted() {
    let rig = rig();
    let session = SessionId::from("nobody");
    let err = rig
        .pipeline
        .handle_turn(&session, &SemanticSignal::new("angry", 1.0))
        .await
        .unwrap_err();
    assert_eq!(err, YueliError::SessionNotFound(session.clone()));
    assert!(rig.pipeline.apply_emotion(&session, &EmotionDelta::new()).await.is_err());
    assert!(rig.pipeline.end_session(&session).await.is_err());
    assert_eq!(rig.pipeline.counters().snapshot().session_not_found, 3);
    assert!(rig.avatar.fired.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_turn_dispatches_and_plays_reaction() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;

    let outcome = rig
        .pipeline
        .handle_turn(&session, &SemanticSignal::new("生气", 1.0))
        .await
        .unwrap();
    match &outcome {
        TurnOutcome::Dispatched { result, sound } => {
            assert_eq!(result.action, "angry");
            assert_eq!(result.status, DispatchStatus::Acked);
            assert!(sound);
        }
        other => panic!("expected dispatch, got {other:?}"),
    }
    assert_eq!(*rig.avatar.fired.lock().await, vec!["Angry"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.output.history().await, vec!["sounds/angry.wav"]);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_blocks_repeat_selection() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;
    let signal = SemanticSignal::new("angry", 1.0);

    rig.pipeline.handle_turn(&session, &signal).await.unwrap();
    let second = rig.pipeline.handle_turn(&session, &signal).await.unwrap();
    assert_ne!(second.action(), Some("angry"));

    tokio::time::sleep(rig.config.dispatch.default_cooldown() + Duration::from_millis(10)).await;
    let third = rig.pipeline.handle_turn(&session, &signal).await.unwrap();
    assert_eq!(third.action(), Some("angry"));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_above_threshold_is_idle() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;

    let outcome = rig
        .pipeline
        .handle_turn(&session, &SemanticSignal::ambient())
        .await
        .unwrap();
    match outcome {
        TurnOutcome::Idle(noop) => assert_eq!(noop.reason, NoOpReason::BelowThreshold),
        other => panic!("expected no-op, got {other:?}"),
    }
    assert_eq!(rig.pipeline.counters().snapshot().decisions_noop, 1);
}

#[tokio::test(start_paused = true)]
async fn test_multi_trigger_action_fires_in_order() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;
    rig.pipeline
        .handle_turn(&session, &SemanticSignal::new("celebrate", 0.9))
        .await
        .unwrap();
    assert_eq!(*rig.avatar.fired.lock().await, vec!["WaveStart", "WaveEnd"]);
}

#[tokio::test(start_paused = true)]
async fn test_reply_feeds_back_into_emotion_and_speaks() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;

    let reply = rig
        .pipeline
        .observe_reply(&session, "哈哈，我好开心！谢谢大家。", None)
        .await
        .unwrap();

    let emotion = reply.emotion.expect("positive reply moves emotion");
    assert!(emotion.get("joy") > 0.0);
    assert_eq!(reply.turn.action(), Some("heart_eyes"));
    assert_eq!(reply.speech.len(), 2);
    for ticket in reply.speech {
        assert_eq!(ticket.outcome().await, AudioOutcome::Played);
    }
}

#[tokio::test(start_paused = true)]
async fn test_suggested_action_drives_neutral_reply() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;

    let reply = rig
        .pipeline
        .observe_reply(&session, "我们下次见", Some("挥手"))
        .await
        .unwrap();
    assert!(reply.emotion.is_none());
    assert_eq!(reply.turn.action(), Some("wave"));
}

#[tokio::test(start_paused = true)]
async fn test_end_session_cancels_and_forgets() {
    let rig = rig();
    let session = SessionId::from("room");
    let token = rig.pipeline.start_session(&session).await;
    rig.pipeline
        .apply_emotion(&session, &EmotionDelta::new().with("anger", 0.8))
        .await
        .unwrap();

    let reply = rig
        .pipeline
        .observe_reply(&session, "第一句。第二句。第三句。", None)
        .await
        .unwrap();
    let teardown = rig.pipeline.end_session(&session).await.unwrap();

    assert!(token.is_cancelled());
    assert!(teardown.had_emotion);
    assert!(teardown.audio_cancelled >= 2);
    assert!(rig.pipeline.emotion(&session).await.is_none());
    for ticket in reply.speech.into_iter().skip(1) {
        assert_eq!(ticket.outcome().await, AudioOutcome::Cancelled);
    }
    assert!(rig.pipeline.handle_turn(&session, &SemanticSignal::ambient()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_undelivered_reaction_counts_as_failure() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;
    rig.output.set_available(false);

    rig.pipeline
        .handle_turn(&session, &SemanticSignal::new("angry", 1.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(rig.pipeline.counters().snapshot().audio_delivery_failed, 1);
    assert_eq!(rig.pipeline.ledger().consecutive_failures(&session, "angry").await, 1);
}

#[tokio::test]
async fn test_reload_catalog_validates_before_swap() {
    let rig = rig();
    assert_eq!(rig.pipeline.catalog().load().len(), 3);

    let mut good = tempfile::NamedTempFile::new().unwrap();
    writeln!(good, "[[action]]\nid = \"nod\"\ntriggers = [{{ hotkey = \"Nod\" }}]").unwrap();
    assert_eq!(rig.pipeline.reload_catalog(good.path()).await.unwrap(), 1);
    assert!(rig.pipeline.catalog().load().get("nod").is_some());

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    writeln!(bad, "[[action]]\nid = \"broken\"\ntriggers = []").unwrap();
    assert!(rig.pipeline.reload_catalog(bad.path()).await.is_err());
    assert!(rig.pipeline.catalog().load().get("nod").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_live_gift_drives_an_action() {
    let rig = rig();
    let hub = LiveHub::new(&rig.config.live, rig.pipeline.counters());
    let decisions = hub.subscribe("decision", &rig.config.live.decision).await;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let worker = rig.pipeline.spawn_live_decisions(decisions, shutdown.clone());

    hub.ingest_line(r#"{"source":"bilibili:1","type":"gift","sequence":1,"payload":{"user":"阿白","gift_name":"辣条","num":3}}"#)
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*rig.avatar.fired.lock().await, vec!["HeartEyes"]);
    assert_eq!(rig.pipeline.sessions().ids().await, vec![SessionId::from("bilibili:1")]);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_end_session_waits_for_a_deciding_turn() {
    let rig = rig();
    let session = SessionId::from("room");
    rig.pipeline.start_session(&session).await;

    // Stall the turn inside evaluation by holding the session's decision lock.
    let book = rig.pipeline.ledger().book(&session).await;
    let held = book.lock().await;

    let turn = tokio::spawn({
        let pipeline = Arc::clone(&rig.pipeline);
        let session = session.clone();
        async move { pipeline.handle_turn(&session, &SemanticSignal::new("angry", 1.0)).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    let teardown = tokio::spawn({
        let pipeline = Arc::clone(&rig.pipeline);
        let session = session.clone();
        async move { pipeline.end_session(&session).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!teardown.is_finished());
    assert!(!turn.is_finished());

    drop(held);
    let teardown = teardown.await.unwrap().unwrap();
    let outcome = turn.await.unwrap().unwrap();
    assert_eq!(outcome.action(), Some("angry"));
    assert_eq!(teardown.intents_cancelled, 0);
    assert!(!rig.pipeline.ledger().has_session(&session).await);

    // Nothing new starts on the ended session.
    let late = rig.pipeline.handle_turn(&session, &SemanticSignal::new("happy", 1.0)).await;
    assert_eq!(late.unwrap_err(), YueliError::SessionNotFound(session.clone()));
    assert!(!rig.pipeline.ledger().has_session(&session).await);
    assert_eq!(*rig.avatar.fired.lock().await, vec!["Angry"]);
}

#[tokio::test(start_paused = true)]
async fn test_quiet_live_room_session_is_ended() {
    let rig = rig();
    let hub = LiveHub::new(&rig.config.live, rig.pipeline.counters());
    let decisions = hub.subscribe("decision", &rig.config.live.decision).await;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let worker = rig.pipeline.spawn_live_decisions(decisions, shutdown.clone());
    let room = SessionId::from("bilibili:1");

    hub.ingest_line(r#"{"source":"bilibili:1","type":"gift","sequence":1,"payload":{"user":"阿白","gift_name":"辣条"}}"#)
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.pipeline.sessions().ids().await, vec![room.clone()]);
    assert!(rig.pipeline.ledger().has_session(&room).await);

    let idle = Duration::from_secs(rig.config.live.session_idle_secs);
    tokio::time::sleep(idle * 2).await;
    assert!(rig.pipeline.sessions().is_empty().await);
    assert!(!rig.pipeline.ledger().has_session(&room).await);
    assert_eq!(rig.pipeline.counters().snapshot().session_not_found, 0);

    shutdown.cancel();
    worker.await.unwrap();
}
