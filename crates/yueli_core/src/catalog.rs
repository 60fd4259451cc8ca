//! Static action catalog.
//!
//! The catalog is a closed, data-driven list of [`ActionDefinition`]s read
//! from TOML. Adding a new avatar cue means adding an `[[action]]` entry; no
//! code is registered at runtime. Registration order is the order in the file
//! and is the final tie-breaker of the decision engine.
//!
//! ```toml
//! [[action]]
//! id = "crying"
//! label = "流泪"
//! kind = "expression"
//! group = "face"
//! cooldown_ms = 8000
//! priority = 1.0
//! aliases = ["cry", "sad"]
//! affinity = { sorrow = 0.9 }
//! triggers = [{ hotkey = "crying" }]
//! ```

use crate::error::YueliError;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Catalog shared between the decision engine and the dispatcher.
///
/// Swapped as a whole by an explicit administrative reload; readers always
/// see one consistent catalog.
pub type SharedCatalog = Arc<ArcSwap<ActionCatalog>>;

pub fn shared_catalog(catalog: ActionCatalog) -> SharedCatalog {
    Arc::new(ArcSwap::from_pointee(catalog))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Expression,
    /// Accessory switched on/off.
    Toggle,
    Pose,
    System,
}

/// One call against the avatar-control target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerBinding {
    /// Hotkey name or id understood by the control target.
    pub hotkey: String,
}

impl TriggerBinding {
    pub fn new(hotkey: impl Into<String>) -> Self {
        Self {
            hotkey: hotkey.into(),
        }
    }
}

/// Raw `[[action]]` entry as written in the catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: ActionKind,
    #[serde(default)]
    pub triggers: Vec<TriggerBinding>,
    #[serde(default)]
    pub affinity: BTreeMap<String, f32>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub cooldown_ms: Option<u64>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: f32,
    pub sound: Option<String>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_priority() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "action")]
    actions: Vec<ActionEntry>,
}

/// Load-time rules an entry is validated against.
#[derive(Debug, Clone)]
pub struct CatalogRules {
    /// Dimensions known to the emotion store.
    pub dimensions: Vec<String>,
    /// Cooldown for entries that do not set `cooldown_ms`.
    pub default_cooldown: Duration,
}

/// Validated, immutable catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDefinition {
    pub id: String,
    pub label: String,
    pub kind: ActionKind,
    /// Sent in this order; never empty.
    pub triggers: Vec<TriggerBinding>,
    pub affinity: BTreeMap<String, f32>,
    pub aliases: Vec<String>,
    pub cooldown: Duration,
    /// Exclusivity group: at most one action of a group is in flight.
    pub group: String,
    pub priority: f32,
    /// Reaction sound played once the action is acknowledged.
    pub sound: Option<String>,
    /// Position in the catalog file.
    pub order: usize,
}

impl ActionDefinition {
    /// Whether an intent tag names this action (id, label or alias, any case).
    pub fn answers_to(&self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() {
            return false;
        }
        self.id.eq_ignore_ascii_case(tag)
            || (!self.label.is_empty() && self.label == tag)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(tag))
    }

    fn from_entry(entry: ActionEntry, order: usize, rules: &CatalogRules) -> Result<Self, YueliError> {
        let id = entry.id.trim().to_string();
        if id.is_empty() {
            return Err(YueliError::validation(format!("#{order}"), "id is empty"));
        }
        if entry.triggers.is_empty() {
            return Err(YueliError::validation(&id, "at least one trigger is required"));
        }
        if entry.triggers.iter().any(|t| t.hotkey.trim().is_empty()) {
            return Err(YueliError::validation(&id, "trigger hotkey is empty"));
        }
        if entry.group.trim().is_empty() {
            return Err(YueliError::validation(&id, "exclusivity group is empty"));
        }
        if !entry.priority.is_finite() {
            return Err(YueliError::validation(&id, "priority must be finite"));
        }
        for (dim, weight) in &entry.affinity {
            if !rules.dimensions.iter().any(|d| d == dim) {
                return Err(YueliError::UnknownDimension(dim.clone()));
            }
            if !weight.is_finite() || !(-1.0..=1.0).contains(weight) {
                return Err(YueliError::validation(
                    &id,
                    format!("affinity `{dim}` = {weight} is outside [-1, 1]"),
                ));
            }
        }

        Ok(Self {
            id,
            label: entry.label,
            kind: entry.kind,
            triggers: entry.triggers,
            affinity: entry.affinity,
            aliases: entry.aliases,
            cooldown: entry
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(rules.default_cooldown),
            group: entry.group.trim().to_string(),
            priority: entry.priority,
            sound: entry.sound.filter(|s| !s.trim().is_empty()),
            order,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: Vec<ActionDefinition>,
    index: HashMap<String, usize>,
}

impl ActionCatalog {
    /// Validate raw entries. Any malformed entry rejects the whole catalog.
    pub fn from_entries(entries: Vec<ActionEntry>, rules: &CatalogRules) -> Result<Self, YueliError> {
        let mut actions = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for (order, entry) in entries.into_iter().enumerate() {
            let def = ActionDefinition::from_entry(entry, order, rules)?;
            if !seen.insert(def.id.to_ascii_lowercase()) {
                return Err(YueliError::validation(&def.id, "duplicate id"));
            }
            actions.push(def);
        }
        let index = actions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Ok(Self { actions, index })
    }

    pub fn from_toml_str(content: &str, rules: &CatalogRules) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content).context("Failed to parse catalog TOML")?;
        let catalog = Self::from_entries(file.actions, rules)?;
        Ok(catalog)
    }

    pub fn load<P: AsRef<Path>>(path: P, rules: &CatalogRules) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read catalog file: {}", path.as_ref().display()))?;
        let catalog = Self::from_toml_str(&content, rules)
            .with_context(|| format!("Invalid catalog: {}", path.as_ref().display()))?;
        tracing::info!("Loaded {} actions from {}", catalog.len(), path.as_ref().display());
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&ActionDefinition> {
        self.index.get(id).map(|&i| &self.actions[i])
    }

    /// Look an action up by id, then by label or alias.
    pub fn resolve(&self, name: &str) -> Option<&ActionDefinition> {
        self.get(name)
            .or_else(|| self.actions.iter().find(|d| d.answers_to(name)))
    }

    /// Actions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::DEFAULT_DIMENSIONS;

    fn rules() -> CatalogRules {
        CatalogRules {
            dimensions: DEFAULT_DIMENSIONS.iter().map(|s| s.to_string()).collect(),
            default_cooldown: Duration::from_secs(5),
        }
    }

    const SAMPLE: &str = r#"
[[action]]
id = "angry"
label = "生气"
group = "face"
cooldown_ms = 8000
affinity = { anger = 0.8 }
triggers = [{ hotkey = "angry" }]

[[action]]
id = "microphone"
label = "麦克风"
kind = "pose"
group = "hands"
aliases = ["singing", "Sing"]
affinity = { joy = 0.5 }
triggers = [{ hotkey = "mic_on" }, { hotkey = "mic_wave" }]
sound = "sounds/la.wav"
"#;

    #[test]
    fn test_parse_sample() {
        let catalog = ActionCatalog::from_toml_str(SAMPLE, &rules()).unwrap();
        assert_eq!(catalog.len(), 2);

        let angry = catalog.get("angry").unwrap();
        assert_eq!(angry.cooldown, Duration::from_millis(8000));
        assert_eq!(angry.kind, ActionKind::Expression);
        assert_eq!(angry.order, 0);
        assert_eq!(angry.priority, 1.0);

        let mic = catalog.get("microphone").unwrap();
        assert_eq!(mic.cooldown, Duration::from_secs(5));
        assert_eq!(mic.triggers.len(), 2);
        assert_eq!(mic.triggers[0].hotkey, "mic_on");
        assert_eq!(mic.sound.as_deref(), Some("sounds/la.wav"));
        assert_eq!(mic.order, 1);
    }

    #[test]
    fn test_resolve_by_alias_and_label() {
        let catalog = ActionCatalog::from_toml_str(SAMPLE, &rules()).unwrap();
        assert_eq!(catalog.resolve("singing").unwrap().id, "microphone");
        assert_eq!(catalog.resolve("SING").unwrap().id, "microphone");
        assert_eq!(catalog.resolve("生气").unwrap().id, "angry");
        assert_eq!(catalog.resolve("ANGRY").unwrap().id, "angry");
        assert!(catalog.resolve("dance").is_none());
        assert!(catalog.resolve("").is_none());
    }

    #[test]
    fn test_rejects_unknown_dimension() {
        let toml = r#"
[[action]]
id = "heart_eyes"
affinity = { love = 1.0 }
triggers = [{ hotkey = "heart" }]
"#;
        let err = ActionCatalog::from_toml_str(toml, &rules()).unwrap_err();
        let inner = err.downcast_ref::<YueliError>().unwrap();
        assert_eq!(inner, &YueliError::UnknownDimension("love".into()));
    }

    #[test]
    fn test_rejects_missing_triggers() {
        let toml = r#"
[[action]]
id = "blush"
"#;
        let err = ActionCatalog::from_toml_str(toml, &rules()).unwrap_err();
        assert!(err.downcast_ref::<YueliError>().unwrap().is_fatal());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let toml = r#"
[[action]]
id = "blush"
triggers = [{ hotkey = "a" }]

[[action]]
id = "Blush"
triggers = [{ hotkey = "b" }]
"#;
        let err = ActionCatalog::from_toml_str(toml, &rules()).unwrap_err();
        match err.downcast_ref::<YueliError>().unwrap() {
            YueliError::Validation { reason, .. } => assert_eq!(reason, "duplicate id"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_out_of_range_affinity() {
        let toml = r#"
[[action]]
id = "blush"
affinity = { joy = 1.5 }
triggers = [{ hotkey = "a" }]
"#;
        assert!(ActionCatalog::from_toml_str(toml, &rules()).is_err());
    }

    #[test]
    fn test_empty_file_is_empty_catalog() {
        let catalog = ActionCatalog::from_toml_str("", &rules()).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(ActionCatalog::load("/nonexistent/actions.toml", &rules()).is_err());
    }

    #[test]
    fn test_shared_catalog_swap() {
        let shared = shared_catalog(ActionCatalog::default());
        assert!(shared.load().is_empty());
        shared.store(Arc::new(ActionCatalog::from_toml_str(SAMPLE, &rules()).unwrap()));
        assert_eq!(shared.load().len(), 2);
    }
}
