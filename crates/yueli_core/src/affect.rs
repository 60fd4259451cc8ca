//! Emotion vector over named affect dimensions.
//!
//! Instead of the single valence/arousal point, the avatar tracks one value per
//! named dimension (joy, anger, ...). Every value lives in `[-1.0, 1.0]` and
//! relaxes toward a per-dimension baseline with an exponential half-life.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Dimensions tracked when the configuration does not list any.
pub const DEFAULT_DIMENSIONS: &[&str] = &["joy", "anger", "sorrow", "fear", "surprise", "neutral"];

/// Default half-life: emotions halve every five minutes.
pub const DEFAULT_HALF_LIFE_SECS: f64 = 300.0;

/// Guard against NaN and Infinity: replace with the fallback.
#[inline]
fn sanitize_f32(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        tracing::warn!("NaN/Inf detected in emotion value, resetting to {}", fallback);
        fallback
    }
}

/// Seconds from configuration as a `Duration`. NaN and negatives give zero,
/// values too large to represent saturate.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Configuration of one affect dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    #[serde(default)]
    pub baseline: f32,
    #[serde(default = "default_half_life_secs")]
    pub half_life_secs: f64,
}

fn default_half_life_secs() -> f64 {
    DEFAULT_HALF_LIFE_SECS
}

impl DimensionSpec {
    pub fn new(name: impl Into<String>, baseline: f32, half_life_secs: f64) -> Self {
        Self {
            name: name.into(),
            baseline: baseline.clamp(-1.0, 1.0),
            half_life_secs,
        }
    }

    pub fn half_life(&self) -> Duration {
        secs_to_duration(self.half_life_secs)
    }

    /// The default six dimensions, all resting at zero.
    pub fn defaults() -> Vec<DimensionSpec> {
        DEFAULT_DIMENSIONS
            .iter()
            .map(|name| DimensionSpec::new(*name, 0.0, DEFAULT_HALF_LIFE_SECS))
            .collect()
    }
}

/// Relax `value` toward `baseline` after `elapsed`.
///
/// `v(t) = b + (v0 - b) * 0.5^(t / half_life)`. A zero half-life snaps to the
/// baseline as soon as any time has passed.
pub fn decay_toward(value: f32, baseline: f32, elapsed: Duration, half_life: Duration) -> f32 {
    if elapsed.is_zero() {
        return value;
    }
    if half_life.is_zero() {
        return baseline;
    }
    let factor = 0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64());
    let decayed = baseline as f64 + (value as f64 - baseline as f64) * factor;
    (decayed as f32).clamp(-1.0, 1.0)
}

/// A signed change to some dimensions of an [`EmotionState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionDelta {
    changes: BTreeMap<String, f32>,
}

impl EmotionDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: add `amount` to `dimension` (accumulates on repeats).
    pub fn with(mut self, dimension: impl Into<String>, amount: f32) -> Self {
        *self.changes.entry(dimension.into()).or_insert(0.0) += amount;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, f32)> for EmotionDelta {
    fn from_iter<T: IntoIterator<Item = (String, f32)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |delta, (dim, amount)| delta.with(dim, amount))
    }
}

/// Per-session emotion vector. Values are always within `[-1.0, 1.0]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionState {
    values: BTreeMap<String, f32>,
}

impl EmotionState {
    /// State resting at every dimension's baseline.
    pub fn at_baseline(dimensions: &[DimensionSpec]) -> Self {
        Self {
            values: dimensions
                .iter()
                .map(|d| (d.name.clone(), d.baseline.clamp(-1.0, 1.0)))
                .collect(),
        }
    }

    /// Value of a dimension; untracked dimensions read as 0.
    pub fn get(&self, dimension: &str) -> f32 {
        self.values.get(dimension).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, dimension: &str) -> bool {
        self.values.contains_key(dimension)
    }

    /// Set a tracked dimension, clamped. Returns `false` for unknown dimensions.
    pub fn set(&mut self, dimension: &str, value: f32) -> bool {
        match self.values.get_mut(dimension) {
            Some(slot) => {
                *slot = sanitize_f32(value, 0.0).clamp(-1.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn norm(&self) -> f32 {
        self.values.values().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Strongest dimension by magnitude, if any is non-zero.
    pub fn dominant(&self) -> Option<(&str, f32)> {
        self.iter()
            .filter(|(_, v)| v.abs() > f32::EPSILON)
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
    }

    /// Cosine similarity against a sparse affinity vector.
    ///
    /// Dimensions missing on either side count as zero. Returns 0 when either
    /// vector has zero length.
    pub fn cosine(&self, affinity: &BTreeMap<String, f32>) -> f32 {
        let dot: f32 = affinity.iter().map(|(dim, w)| self.get(dim) * w).sum();
        let affinity_norm = affinity.values().map(|w| w * w).sum::<f32>().sqrt();
        let norm = self.norm();
        if norm <= f32::EPSILON || affinity_norm <= f32::EPSILON {
            return 0.0;
        }
        (dot / (norm * affinity_norm)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EmotionState {
        EmotionState::at_baseline(&DimensionSpec::defaults())
    }

    #[test]
    fn test_baseline_is_zero() {
        let s = state();
        assert_eq!(s.iter().count(), DEFAULT_DIMENSIONS.len());
        assert!(s.iter().all(|(_, v)| v == 0.0));
        assert!(s.dominant().is_none());
    }

    #[test]
    fn test_set_clamps_and_rejects_unknown() {
        let mut s = state();
        assert!(s.set("joy", 3.0));
        assert_eq!(s.get("joy"), 1.0);
        assert!(s.set("anger", -7.0));
        assert_eq!(s.get("anger"), -1.0);
        assert!(!s.set("love", 0.5));
        assert_eq!(s.get("love"), 0.0);
    }

    #[test]
    fn test_set_nan_resets() {
        let mut s = state();
        s.set("fear", f32::NAN);
        assert_eq!(s.get("fear"), 0.0);
    }

    #[test]
    fn test_decay_half_life() {
        let hl = Duration::from_secs(300);
        let v = decay_toward(0.6, 0.0, hl, hl);
        assert!((v - 0.3).abs() < 1e-4);
        let v = decay_toward(0.6, 0.0, hl * 2, hl);
        assert!((v - 0.15).abs() < 1e-4);
    }

    #[test]
    fn test_decay_toward_nonzero_baseline() {
        let hl = Duration::from_secs(10);
        let v = decay_toward(-0.4, 0.2, hl, hl);
        assert!((v - (-0.1)).abs() < 1e-4);
    }

    #[test]
    fn test_decay_zero_elapsed_is_identity() {
        assert_eq!(decay_toward(0.6, 0.0, Duration::ZERO, Duration::from_secs(1)), 0.6);
    }

    #[test]
    fn test_secs_to_duration_never_panics() {
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
        assert_eq!(secs_to_duration(-3.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_to_duration(1e300), Duration::MAX);

        let spec: DimensionSpec = toml::from_str("name = \"joy\"\nhalf_life_secs = inf").unwrap();
        assert_eq!(spec.half_life(), Duration::MAX);
        assert_eq!(decay_toward(0.6, 0.0, Duration::from_secs(60), spec.half_life()), 0.6);
    }

    #[test]
    fn test_decay_zero_half_life_snaps() {
        assert_eq!(
            decay_toward(0.6, 0.1, Duration::from_millis(1), Duration::ZERO),
            0.1
        );
    }

    #[test]
    fn test_cosine() {
        let mut s = state();
        s.set("joy", 0.8);
        let happy: BTreeMap<String, f32> = [("joy".to_string(), 0.8)].into();
        let angry: BTreeMap<String, f32> = [("anger".to_string(), 0.9)].into();
        assert!((s.cosine(&happy) - 1.0).abs() < 1e-5);
        assert_eq!(s.cosine(&angry), 0.0);
        assert_eq!(state().cosine(&happy), 0.0);
    }

    #[test]
    fn test_cosine_opposed() {
        let mut s = state();
        s.set("joy", -0.5);
        let happy: BTreeMap<String, f32> = [("joy".to_string(), 0.8)].into();
        assert!((s.cosine(&happy) + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_delta_accumulates() {
        let d = EmotionDelta::new().with("joy", 0.2).with("joy", 0.3);
        let collected: Vec<_> = d.iter().collect();
        assert_eq!(collected, vec![("joy", 0.5)]);
    }

    #[test]
    fn test_state_json_is_flat_map() {
        let mut s = state();
        s.set("joy", 0.5);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["joy"], serde_json::json!(0.5));
    }
}
