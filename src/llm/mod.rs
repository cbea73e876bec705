//! Model access for the triage pipeline
//!
//! HTTP clients for chat and embeddings, the structured-output guard, result
//! schemas, and the prompts. Clients are built once per role by
//! [`ModelClients`] and shared by every finding in a run.

pub mod client;
pub mod embeddings;
pub mod guard;
pub mod models;
mod parse;
pub mod prompts;
pub mod schema;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ChatModel, ChatRequest, HttpChatModel, LlmResponse, TransportRetry};
pub use embeddings::{EmbeddingModel, HttpEmbeddingModel};
pub use guard::{DecodeError, OutputGuard};
pub use models::{ModelFamily, ModelRole, Usage};
pub use schema::StructuredOutput;

use crate::config::{Config, ModelConfig};
use anyhow::Context;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One lazily built client per role, reused for the whole run.
///
/// Construction failures (missing key, bad endpoint) surface on first use and
/// are fatal to the run.
pub struct ModelClients {
    main_config: ModelConfig,
    critique_config: ModelConfig,
    embedding_config: ModelConfig,
    retry: TransportRetry,
    main: OnceLock<Arc<dyn ChatModel>>,
    critique: OnceLock<Arc<dyn ChatModel>>,
    embedding: OnceLock<Arc<dyn EmbeddingModel>>,
}

impl ModelClients {
    pub fn new(config: &Config) -> Self {
        Self {
            main_config: config.model.clone(),
            critique_config: config.critique_model(),
            embedding_config: config.embeddings.clone(),
            retry: TransportRetry {
                max_retries: config.triage.transport_max_retries,
                backoff: Duration::from_secs(config.triage.transport_backoff_secs),
            },
            main: OnceLock::new(),
            critique: OnceLock::new(),
            embedding: OnceLock::new(),
        }
    }

    /// Pre-built clients, for tests and embedders of the library.
    pub fn from_parts(
        main: Arc<dyn ChatModel>,
        critique: Option<Arc<dyn ChatModel>>,
        embedding: Option<Arc<dyn EmbeddingModel>>,
    ) -> Self {
        let clients = Self {
            main_config: ModelConfig::default(),
            critique_config: ModelConfig::default(),
            embedding_config: ModelConfig::default(),
            retry: TransportRetry::default(),
            main: OnceLock::new(),
            critique: OnceLock::new(),
            embedding: OnceLock::new(),
        };
        let _ = clients.critique.set(critique.unwrap_or_else(|| main.clone()));
        let _ = clients.main.set(main);
        if let Some(embedding) = embedding {
            let _ = clients.embedding.set(embedding);
        }
        clients
    }

    pub fn main(&self) -> anyhow::Result<Arc<dyn ChatModel>> {
        Self::chat_for(&self.main, &self.main_config, self.retry, ModelRole::Main)
    }

    pub fn critique(&self) -> anyhow::Result<Arc<dyn ChatModel>> {
        Self::chat_for(&self.critique, &self.critique_config, self.retry, ModelRole::Critique)
    }

    pub fn embedding(&self) -> anyhow::Result<Arc<dyn EmbeddingModel>> {
        if let Some(model) = self.embedding.get() {
            return Ok(model.clone());
        }
        let built: Arc<dyn EmbeddingModel> = Arc::new(
            HttpEmbeddingModel::from_config(&self.embedding_config, self.retry)
                .with_context(|| format!("Failed to create the {} client", ModelRole::Embedding.label()))?,
        );
        tracing::debug!(model = %self.embedding_config.name, "Created embedding client");
        Ok(self.embedding.get_or_init(|| built).clone())
    }

    fn chat_for(
        slot: &OnceLock<Arc<dyn ChatModel>>,
        config: &ModelConfig,
        retry: TransportRetry,
        role: ModelRole,
    ) -> anyhow::Result<Arc<dyn ChatModel>> {
        if let Some(model) = slot.get() {
            return Ok(model.clone());
        }
        let built: Arc<dyn ChatModel> = Arc::new(
            HttpChatModel::from_config(config, retry)
                .with_context(|| format!("Failed to create the {} model client", role.label()))?,
        );
        tracing::debug!(role = role.label(), model = %config.name, "Created chat client");
        Ok(slot.get_or_init(|| built).clone())
    }
}
