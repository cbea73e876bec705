//! Structured-output guard
//!
//! Every model call that expects a result schema goes through [`OutputGuard`].
//! Decoding is two-phase: a strict local parse first, then a bounded recovery
//! whose shape depends on the model family:
//!
//! - OpenAI-compatible models hand back their raw text, so a failed parse is
//!   sent to a repair pass that fixes structure and types only.
//! - NVIDIA-hosted models return nothing on a parse miss, so the identical
//!   request is reissued.
//!
//! A terminal [`DecodeError`] is returned only after the bound is exhausted.
//! Callers catch it; a single finding must never abort the batch.

use super::client::{truncate_str, ChatModel, ChatRequest, LlmResponse};
use super::models::{ModelFamily, Usage};
use super::parse::parse_json_strict;
use super::prompts::json_repair_request;
use super::schema::StructuredOutput;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{schema}: output still invalid after {attempts} repair attempts: {last_error}")]
    RepairExhausted {
        schema: &'static str,
        attempts: usize,
        last_error: String,
    },

    #[error("{schema}: no usable response after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        schema: &'static str,
        attempts: usize,
        last_error: String,
    },

    #[error("{schema}: model request failed: {source}")]
    Transport {
        schema: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Wraps one chat model with schema-validated decoding and usage accounting.
pub struct OutputGuard {
    model: Arc<dyn ChatModel>,
    max_retries: usize,
    usage: Mutex<Usage>,
}

impl OutputGuard {
    pub fn new(model: Arc<dyn ChatModel>, max_retries: usize) -> Self {
        Self {
            model,
            max_retries: max_retries.max(1),
            usage: Mutex::new(Usage::default()),
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.model.family()
    }

    /// Tokens spent through this guard so far.
    pub fn total_usage(&self) -> Usage {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    /// Send `request` and decode the reply as `T`.
    pub async fn decode<T: StructuredOutput>(&self, request: &ChatRequest) -> Result<T, DecodeError> {
        match self.model.family() {
            ModelFamily::OpenAi => self.decode_with_repair(request).await,
            ModelFamily::Nvidia => self.decode_with_reissue(request).await,
        }
    }

    async fn call(&self, request: &ChatRequest) -> anyhow::Result<LlmResponse> {
        let response = self.model.complete(request).await?;
        if let Some(usage) = &response.usage {
            if let Ok(mut total) = self.usage.lock() {
                total.add(usage);
            }
        }
        Ok(response)
    }

    async fn decode_with_repair<T: StructuredOutput>(
        &self,
        request: &ChatRequest,
    ) -> Result<T, DecodeError> {
        let response = self
            .call(request)
            .await
            .map_err(|source| DecodeError::Transport {
                schema: T::NAME,
                source,
            })?;

        let mut raw = response.content;
        let mut last_error = match parse_json_strict::<T>(&raw) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => e,
        };

        for attempt in 1..=self.max_retries {
            tracing::warn!(
                schema = T::NAME,
                "Model output did not match the schema ({}). Repair attempt {}/{}",
                last_error,
                attempt,
                self.max_retries
            );
            let repair = json_repair_request(T::NAME, T::SCHEMA, &raw, &last_error);
            match self.call(&repair).await {
                Ok(fixed) => match parse_json_strict::<T>(&fixed.content) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => {
                        last_error = e;
                        if !fixed.content.trim().is_empty() {
                            raw = fixed.content;
                        }
                    }
                },
                Err(e) => last_error = e.to_string(),
            }
        }

        tracing::debug!(schema = T::NAME, "Unrepairable output: {}", truncate_str(&raw, 500));
        Err(DecodeError::RepairExhausted {
            schema: T::NAME,
            attempts: self.max_retries,
            last_error,
        })
    }

    async fn decode_with_reissue<T: StructuredOutput>(
        &self,
        request: &ChatRequest,
    ) -> Result<T, DecodeError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self.call(request).await {
                Ok(response) => match parse_json_strict::<T>(&response.content) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => last_error = format!("response did not decode: {}", e),
                },
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(
                schema = T::NAME,
                "No structured result ({}). Attempt {}/{}",
                last_error,
                attempt,
                self.max_retries
            );
        }
        Err(DecodeError::AttemptsExhausted {
            schema: T::NAME,
            attempts: self.max_retries,
            last_error,
        })
    }
}
