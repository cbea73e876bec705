//! Configuration management for sast-triage
//!
//! Settings live in a TOML file passed on the command line. Secrets never do:
//! each model section names the environment variable holding its API key.

use crate::llm::models::ModelFamily;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration value '{key}' is not set or is empty")]
    MissingValue { key: &'static str },

    #[error("configuration value '{key}' points at {path}, which does not exist")]
    MissingFile { key: &'static str, path: PathBuf },

    #[error("configuration value '{key}' is out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub model: ModelConfig,
    pub critique: CritiqueConfig,
    pub embeddings: ModelConfig,
    pub triage: TriageConfig,
}

/// Where the analyzed sources live and how to interpret report paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Local checkout of the analyzed project
    pub root: PathBuf,
    /// Leading path the report puts before repo-relative paths (e.g. `systemd-257/`).
    /// Defaults to the checkout directory name.
    pub report_prefix: Option<String>,
    /// Optional `compile_commands.json`
    pub compile_commands: Option<PathBuf>,
    /// Optional header force-included into every translation unit (usually `config.h`)
    pub forced_include: Option<PathBuf>,
    /// Lines shown on each side of a cited line when no declaration encloses it
    pub context_window: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            report_prefix: None,
            compile_commands: None,
            forced_include: None,
            context_window: 100,
        }
    }
}

impl RepositoryConfig {
    /// The report prefix with a trailing slash, derived from the checkout name when unset.
    pub fn effective_report_prefix(&self) -> String {
        let raw = match &self.report_prefix {
            Some(prefix) => prefix.clone(),
            None => self
                .root
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        if raw.is_empty() || raw.ends_with('/') {
            raw
        } else {
            format!("{}/", raw)
        }
    }
}

/// An OpenAI-compatible endpoint (chat or embeddings).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub url: String,
    pub name: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Structured-output strategy; detected from the URL when unset
    pub family: Option<ModelFamily>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: String::new(),
            api_key_env: "LLM_API_KEY".to_string(),
            family: None,
            max_tokens: 8192,
            temperature: 0.0,
            timeout_secs: 300,
        }
    }
}

impl ModelConfig {
    pub fn family(&self) -> ModelFamily {
        self.family.unwrap_or_else(|| ModelFamily::detect(&self.url))
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Critique endpoint; every unset field falls back to the main model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CritiqueConfig {
    pub url: Option<String>,
    pub name: Option<String>,
    pub api_key_env: Option<String>,
    pub family: Option<ModelFamily>,
    pub temperature: f32,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: None,
            api_key_env: None,
            family: None,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Known false positives corpus; deduplication is skipped when unset
    pub known_false_positives: Option<PathBuf>,
    /// How many same-type candidates the deduplicator retrieves (K)
    pub similarity_candidates: usize,
    /// Extra analyze/recommend rounds allowed when the model asks for more evidence
    pub max_evidence_rounds: usize,
    /// Structural decode retries inside the output guard
    pub structured_max_retries: usize,
    /// Rate-limit retries at the HTTP layer
    pub transport_max_retries: u32,
    pub transport_backoff_secs: u64,
    pub run_with_critique: bool,
    /// Score the critique's result instead of the primary verdict
    pub use_critique_as_final: bool,
    pub calculate_metrics: bool,
    /// Known-issue records longer than this are rejected before embedding
    pub embedding_max_chars: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            known_false_positives: None,
            similarity_candidates: 3,
            max_evidence_rounds: 2,
            structured_max_retries: 3,
            transport_max_retries: 3,
            transport_backoff_secs: 10,
            run_with_critique: false,
            use_critique_as_final: false,
            calculate_metrics: true,
            embedding_max_chars: 24_000,
        }
    }
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Config file {} is not valid TOML", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.url.trim().is_empty() {
            return Err(ConfigError::MissingValue { key: "model.url" });
        }
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::MissingValue { key: "model.name" });
        }
        if !self.repository.root.exists() {
            return Err(ConfigError::MissingFile {
                key: "repository.root",
                path: self.repository.root.clone(),
            });
        }
        for (key, path) in [
            ("repository.compile_commands", &self.repository.compile_commands),
            ("repository.forced_include", &self.repository.forced_include),
            ("triage.known_false_positives", &self.triage.known_false_positives),
        ] {
            if let Some(path) = path {
                if !path.exists() {
                    return Err(ConfigError::MissingFile {
                        key,
                        path: path.clone(),
                    });
                }
            }
        }
        if self.triage.known_false_positives.is_some() {
            if self.embeddings.url.trim().is_empty() {
                return Err(ConfigError::MissingValue { key: "embeddings.url" });
            }
            if self.embeddings.name.trim().is_empty() {
                return Err(ConfigError::MissingValue { key: "embeddings.name" });
            }
        }
        if self.triage.structured_max_retries == 0 {
            return Err(ConfigError::OutOfRange {
                key: "triage.structured_max_retries",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.triage.similarity_candidates == 0 {
            return Err(ConfigError::OutOfRange {
                key: "triage.similarity_candidates",
                reason: "K must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Critique endpoint settings with main-model fallbacks applied.
    pub fn critique_model(&self) -> ModelConfig {
        let mut resolved = self.model.clone();
        if let Some(url) = &self.critique.url {
            resolved.url = url.clone();
            resolved.family = None;
        }
        if let Some(name) = &self.critique.name {
            resolved.name = name.clone();
        }
        if let Some(env) = &self.critique.api_key_env {
            resolved.api_key_env = env.clone();
        }
        if let Some(family) = self.critique.family {
            resolved.family = Some(family);
        }
        resolved.temperature = self.critique.temperature;
        resolved
    }

    /// Log the effective configuration. API keys are never printed, only whether they are set.
    pub fn log_effective(&self) {
        let key_state = |model: &ModelConfig| {
            if model.api_key().is_some() {
                "******"
            } else {
                "<unset>"
            }
        };
        tracing::info!(
            root = %self.repository.root.display(),
            report_prefix = %self.repository.effective_report_prefix(),
            compile_commands = ?self.repository.compile_commands,
            forced_include = ?self.repository.forced_include,
            "repository"
        );
        tracing::info!(
            url = %self.model.url,
            name = %self.model.name,
            family = ?self.model.family(),
            api_key = key_state(&self.model),
            "main model"
        );
        if self.triage.run_with_critique {
            let critique = self.critique_model();
            tracing::info!(
                url = %critique.url,
                name = %critique.name,
                api_key = key_state(&critique),
                "critique model"
            );
        }
        tracing::info!(
            known_false_positives = ?self.triage.known_false_positives,
            k = self.triage.similarity_candidates,
            rounds = self.triage.max_evidence_rounds,
            decode_retries = self.triage.structured_max_retries,
            critique = self.triage.run_with_critique,
            metrics = self.triage.calculate_metrics,
            "triage"
        );
    }
}
