use crate::affect::{secs_to_duration, DimensionSpec};
use crate::catalog::CatalogRules;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YueliConfig {
    /// Path of the action catalog TOML.
    pub catalog_path: String,
    pub emotion: EmotionConfig,
    pub decision: DecisionConfig,
    pub dispatch: DispatchConfig,
    pub audio: AudioConfig,
    pub live: LiveConfig,
    pub vts: Option<VtsConfig>,
}

impl Default for YueliConfig {
    fn default() -> Self {
        Self {
            catalog_path: "config/actions.toml".to_string(),
            emotion: EmotionConfig::default(),
            decision: DecisionConfig::default(),
            dispatch: DispatchConfig::default(),
            audio: AudioConfig::default(),
            live: LiveConfig::default(),
            vts: None,
        }
    }
}

impl YueliConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: YueliConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse as TOML but make no sense as durations or
    /// weights.
    pub fn validate(&self) -> Result<()> {
        for dim in &self.emotion.dimensions {
            check_secs(&format!("emotion dimension `{}` half_life_secs", dim.name), dim.half_life_secs)?;
            if !dim.baseline.is_finite() {
                bail!("emotion dimension `{}` baseline must be finite", dim.name);
            }
        }
        check_secs("decision.novelty_horizon_secs", self.decision.novelty_horizon_secs)?;

        let d = &self.decision;
        let weights = [
            ("emotion_weight", d.emotion_weight),
            ("intent_weight", d.intent_weight),
            ("novelty_weight", d.novelty_weight),
            ("min_score", d.min_score),
            ("failure_penalty", d.failure_penalty),
            ("max_failure_penalty", d.max_failure_penalty),
        ];
        for (name, value) in weights {
            if !value.is_finite() {
                bail!("decision.{} must be finite, got {}", name, value);
            }
        }

        for (name, consumer) in [("dialogue", &self.live.dialogue), ("decision", &self.live.decision)] {
            if !consumer.rate_per_sec.is_finite() {
                bail!("live.{}.rate_per_sec must be finite", name);
            }
        }
        Ok(())
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let exists = path.as_ref().exists();
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                if exists {
                    tracing::warn!("Invalid config ({:#}), using defaults", e);
                } else {
                    tracing::info!("Config file not found ({}), using defaults", e);
                }
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("YUELI_CATALOG") {
            self.catalog_path = v;
        }
        if let Ok(v) = std::env::var("YUELI_AUDIO_DEVICE") {
            self.audio.device = v;
        }
        if let Ok(v) = std::env::var("YUELI_LIVE_LISTEN") {
            self.live.listen = Some(v);
        }
        // VTube Studio env overrides
        if let Ok(url) = std::env::var("YUELI_VTS_URL") {
            let vts = self.vts.get_or_insert_with(VtsConfig::default);
            vts.url = url;
        }
        if let Ok(token) = std::env::var("YUELI_VTS_TOKEN") {
            let vts = self.vts.get_or_insert_with(VtsConfig::default);
            vts.token = Some(token);
        }
    }

    /// Rules the action catalog is validated against.
    pub fn catalog_rules(&self) -> CatalogRules {
        CatalogRules {
            dimensions: self.emotion.dimensions.iter().map(|d| d.name.clone()).collect(),
            default_cooldown: self.dispatch.default_cooldown(),
        }
    }
}

/// Longest duration accepted from configuration: one year.
const MAX_CONFIG_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn check_secs(what: &str, secs: f64) -> Result<()> {
    if !secs.is_finite() || !(0.0..=MAX_CONFIG_SECS).contains(&secs) {
        bail!("{} must be between 0 and {} seconds, got {}", what, MAX_CONFIG_SECS, secs);
    }
    Ok(())
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    pub dimensions: Vec<DimensionSpec>,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            dimensions: DimensionSpec::defaults(),
        }
    }
}

/// Fusion weights and thresholds of the decision engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// w1: emotion/affinity cosine.
    pub emotion_weight: f32,
    /// w2: intent match.
    pub intent_weight: f32,
    /// w3: novelty bonus.
    pub novelty_weight: f32,
    /// Candidates scoring below this produce a no-op.
    pub min_score: f32,
    /// Time constant of the novelty bonus, in seconds.
    pub novelty_horizon_secs: f64,
    /// Subtracted per consecutive failed dispatch of an action.
    pub failure_penalty: f32,
    /// Cap of the accumulated failure penalty.
    pub max_failure_penalty: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            emotion_weight: 0.5,
            intent_weight: 0.4,
            novelty_weight: 0.1,
            min_score: 0.3,
            novelty_horizon_secs: 120.0,
            failure_penalty: 0.15,
            max_failure_penalty: 0.6,
        }
    }
}

impl DecisionConfig {
    pub fn novelty_horizon(&self) -> Duration {
        secs_to_duration(self.novelty_horizon_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long one trigger call may wait for its acknowledgment.
    pub ack_timeout_ms: u64,
    /// Delay after an acknowledged trigger before the next one of the same intent.
    pub inter_trigger_delay_ms: u64,
    /// Pending intents allowed per exclusivity group while one is in flight.
    pub queue_depth: usize,
    /// Cooldown for catalog entries that do not set one.
    pub default_cooldown_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1500,
            inter_trigger_delay_ms: 150,
            queue_depth: 2,
            default_cooldown_ms: 5000,
        }
    }
}

impl DispatchConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn inter_trigger_delay(&self) -> Duration {
        Duration::from_millis(self.inter_trigger_delay_ms)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name (substring match, e.g. a virtual audio cable).
    pub device: String,
    /// Total requests queued across all priority classes.
    pub max_queued: usize,
    /// Budget for stopping a preempted or cancelled playback.
    pub preempt_budget_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: "CABLE Input".to_string(),
            max_queued: 32,
            preempt_budget_ms: 100,
        }
    }
}

impl AudioConfig {
    pub fn preempt_budget(&self) -> Duration {
        Duration::from_millis(self.preempt_budget_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// TCP address accepting newline-delimited JSON envelopes.
    pub listen: Option<String>,
    /// A connection idle for longer than this is closed.
    pub read_timeout_secs: u64,
    pub max_line_bytes: usize,
    /// Sources whose sequence numbers are remembered; the least recently
    /// heard is forgotten first.
    pub max_sources: usize,
    /// A live session with no event for this long is ended.
    pub session_idle_secs: u64,
    /// Danmaku longer than this score zero.
    pub max_content_chars: usize,
    pub min_danmaku_score: i32,
    /// Names that earn a danmaku the mention bonus.
    pub persona_names: Vec<String>,
    pub priorities: EventPriorities,
    /// Fan-out to the dialogue core.
    pub dialogue: ConsumerConfig,
    /// Fan-out to the decision engine.
    pub decision: ConsumerConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            listen: Some("127.0.0.1:7878".to_string()),
            read_timeout_secs: 30,
            max_line_bytes: 16 * 1024,
            max_sources: 1024,
            session_idle_secs: 600,
            max_content_chars: 50,
            min_danmaku_score: 15,
            persona_names: vec!["月璃".to_string(), "YueLi".to_string()],
            priorities: EventPriorities::default(),
            dialogue: ConsumerConfig {
                capacity: 64,
                rate_per_sec: 8.0,
                burst: 16,
            },
            decision: ConsumerConfig {
                capacity: 16,
                rate_per_sec: 1.0,
                burst: 3,
            },
        }
    }
}

impl LiveConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// `None` disables idle cleanup of live sessions.
    pub fn session_idle(&self) -> Option<Duration> {
        (self.session_idle_secs > 0).then(|| Duration::from_secs(self.session_idle_secs))
    }
}

/// Base priority per live event type (higher is more important).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventPriorities {
    pub danmaku: i32,
    pub gift: i32,
    pub super_chat: i32,
    pub guard: i32,
    pub heartbeat: i32,
}

impl Default for EventPriorities {
    fn default() -> Self {
        Self {
            danmaku: 10,
            gift: 50,
            super_chat: 80,
            guard: 100,
            heartbeat: 0,
        }
    }
}

/// Bounded, rate-limited channel to one downstream consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub capacity: usize,
    /// Sustained events per second (token refill rate).
    pub rate_per_sec: f64,
    /// Bucket size.
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VtsConfig {
    pub url: String,
    pub plugin_name: String,
    pub plugin_developer: String,
    /// Authentication token issued by VTube Studio on first connection.
    pub token: Option<String>,
    /// Upper bound of the reconnect backoff.
    pub reconnect_max_secs: u64,
}

impl Default for VtsConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8001".to_string(),
            plugin_name: "YueLi Core".to_string(),
            plugin_developer: "YueLi".to_string(),
            token: None,
            reconnect_max_secs: 30,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
