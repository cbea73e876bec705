//! Embedding capability used by the known-issue similarity index.

use super::client::{endpoint_url, post_json_with_retry, truncate_str, TransportRetry};
use crate::config::ModelConfig;
use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Texts per embeddings request
const EMBEDDING_BATCH_SIZE: usize = 64;

pub trait EmbeddingModel: Send + Sync {
    /// Embed every text, returning vectors in input order.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbeddingModel {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    retry: TransportRetry,
}

impl HttpEmbeddingModel {
    pub fn from_config(config: &ModelConfig, retry: TransportRetry) -> anyhow::Result<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            anyhow::anyhow!(
                "Environment variable {} is not set or is empty",
                config.api_key_env
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint_url(&config.url, "embeddings"),
            api_key,
            model: config.name.clone(),
            retry,
        })
    }

    async fn embed_all(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
            let body = EmbeddingRequest {
                model: &self.model,
                input: batch,
            };
            let text =
                post_json_with_retry(&self.http, &self.endpoint, &self.api_key, &body, self.retry)
                    .await?;
            vectors.extend(parse_embedding_response(&text, batch.len())?);
        }
        Ok(vectors)
    }
}

impl EmbeddingModel for HttpEmbeddingModel {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>> {
        self.embed_all(texts).boxed()
    }
}

fn parse_embedding_response(text: &str, expected: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut parsed: EmbeddingResponse = serde_json::from_str(text).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse embeddings response: {}\n{}",
            e,
            truncate_str(text, 300)
        )
    })?;
    if parsed.data.len() != expected {
        anyhow::bail!(
            "Embeddings endpoint returned {} vectors for {} inputs",
            parsed.data.len(),
            expected
        );
    }
    parsed.data.sort_by_key(|d| d.index);
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}
