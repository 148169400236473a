//! Pipeline configuration: per-model aggregation keys, the materialization
//! policy table, retention and retry budgets.
//!
//! Built once at startup (from TOML or through [`PipelineConfigBuilder`])
//! and shared read-only by every engine.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_GLOBAL_POLICY: &str = "last";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseFold {
    #[default]
    Preserve,
    Lower,
    Upper,
}

/// How key values are normalized before they become correlation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyNormalization {
    pub trim: bool,
    pub case: CaseFold,
}

impl Default for KeyNormalization {
    fn default() -> Self {
        Self {
            trim: true,
            case: CaseFold::Preserve,
        }
    }
}

impl KeyNormalization {
    pub fn apply(&self, raw: &str) -> String {
        let s = if self.trim { raw.trim() } else { raw };
        match self.case {
            CaseFold::Preserve => s.to_string(),
            CaseFold::Lower => s.to_lowercase(),
            CaseFold::Upper => s.to_uppercase(),
        }
    }
}

/// A configured aggregation key. In TOML either a bare path string or a
/// table `{ path = "...", label = "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "KeyPathRepr")]
pub struct KeyPath {
    pub path: String,
    pub label: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyPathRepr {
    Path(String),
    Full { path: String, label: Option<String> },
}

impl From<KeyPathRepr> for KeyPath {
    fn from(repr: KeyPathRepr) -> Self {
        match repr {
            KeyPathRepr::Path(path) => Self { path, label: None },
            KeyPathRepr::Full { path, label } => Self { path, label },
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self {
            path: path.to_string(),
            label: None,
        }
    }
}

impl KeyPath {
    pub fn labeled(path: &str, label: &str) -> Self {
        Self {
            path: path.to_string(),
            label: Some(label.to_string()),
        }
    }

    /// Tag label: the explicit label, else the last path segment.
    pub fn label(&self) -> &str {
        match &self.label {
            Some(label) => label,
            None => self.path.rsplit('.').next().unwrap_or(&self.path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub key_paths: Vec<KeyPath>,
    pub normalization: KeyNormalization,
    pub default_policy: Option<String>,
    pub path_policies: BTreeMap<String, String>,
    pub record_transformer: Option<String>,
}

/// Policy part of a model registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelPolicies {
    pub default_policy: Option<String>,
    pub path_policies: BTreeMap<String, String>,
    pub record_transformer: Option<String>,
}

impl ModelPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_policy(mut self, policy: &str) -> Self {
        self.default_policy = Some(policy.to_string());
        self
    }

    pub fn path(mut self, path: &str, policy: &str) -> Self {
        self.path_policies.insert(path.to_string(), policy.to_string());
        self
    }

    pub fn record_transformer(mut self, name: &str) -> Self {
        self.record_transformer = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Completed intake records older than this are purged.
    pub snapshot_retention_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            snapshot_retention_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transient failures tolerated before an intake record is parked.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Optimistic-concurrency re-runs inside one coalescing decision.
    pub conflict_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            conflict_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub batch_size: usize,
    pub batch_deadline_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            batch_size: 32,
            batch_deadline_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: BTreeMap<String, ModelConfig>,
    pub global_policy: String,
    pub retention: RetentionConfig,
    pub retry: RetryConfig,
    pub workers: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            global_policy: DEFAULT_GLOBAL_POLICY.to_string(),
            retention: RetentionConfig::default(),
            retry: RetryConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        let config: PipelineConfig =
            toml::from_str(s).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn model(&self, model_type: &str) -> Option<&ModelConfig> {
        self.models.get(model_type)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.global_policy.trim().is_empty() {
            return Err(CoreError::InvalidConfig("global_policy is empty".into()));
        }
        if self.workers.count == 0 {
            return Err(CoreError::InvalidConfig("workers.count must be > 0".into()));
        }
        if self.workers.batch_size == 0 {
            return Err(CoreError::InvalidConfig("workers.batch_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("retry.max_attempts must be > 0".into()));
        }
        for (name, model) in &self.models {
            if name.trim().is_empty() {
                return Err(CoreError::InvalidConfig("empty model name".into()));
            }
            for key in &model.key_paths {
                if key.path.trim().is_empty() {
                    return Err(CoreError::InvalidConfig(format!(
                        "model {name}: empty key path"
                    )));
                }
                if key.label().is_empty() || key.label().starts_with('@') {
                    return Err(CoreError::InvalidConfig(format!(
                        "model {name}: invalid tag label for {}",
                        key.path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Explicit startup registration of models, in place of type scanning.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn register_model<K: Into<KeyPath>>(
        mut self,
        model_type: &str,
        key_paths: impl IntoIterator<Item = K>,
        policies: ModelPolicies,
    ) -> Self {
        let entry = self.config.models.entry(model_type.to_string()).or_default();
        entry.key_paths = key_paths.into_iter().map(Into::into).collect();
        entry.default_policy = policies.default_policy;
        entry.path_policies = policies.path_policies;
        entry.record_transformer = policies.record_transformer;
        self
    }

    pub fn normalization(mut self, model_type: &str, normalization: KeyNormalization) -> Self {
        self.config
            .models
            .entry(model_type.to_string())
            .or_default()
            .normalization = normalization;
        self
    }

    pub fn global_policy(mut self, policy: &str) -> Self {
        self.config.global_policy = policy.to_string();
        self
    }

    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn build(self) -> Result<PipelineConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
