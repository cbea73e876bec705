use super::models::{ModelFamily, Usage};
use crate::config::ModelConfig;
use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One chat turn: a system prompt plus a single user message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_mode: true,
        }
    }

    /// The request as a single transcript, for logs and downstream review prompts.
    pub fn render(&self) -> String {
        format!("System: {}\nHuman: {}", self.system, self.user)
    }
}

/// Response from LLM including content and usage stats
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

/// A chat-completion capability. Implemented over HTTP in production and by
/// scripted stubs in tests.
pub trait ChatModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>>;
}

/// Rate-limit retry policy for the transport layer. Independent of the
/// structural decode retries in the output guard.
#[derive(Debug, Clone, Copy)]
pub struct TransportRetry {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat client.
pub struct HttpChatModel {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    family: ModelFamily,
    retry: TransportRetry,
}

impl HttpChatModel {
    /// Build a client from a model section. Fails when the API key is missing,
    /// which is fatal for the run.
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
            endpoint: endpoint_url(&config.url, "chat/completions"),
            api_key,
            model: config.name.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            family: config.family(),
            retry,
        })
    }

    async fn call(&self, request: &ChatRequest) -> anyhow::Result<LlmResponse> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
            response_format: request.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let text = post_json_with_retry(&self.http, &self.endpoint, &self.api_key, &body, self.retry)
            .await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse chat completion response: {}\n{}",
                e,
                truncate_str(&text, 500)
            )
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage: parsed.usage,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

impl ChatModel for HttpChatModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>> {
        self.call(request).boxed()
    }
}

/// Join a base URL and an API path, tolerating bases that already include the path.
pub(crate) fn endpoint_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(path) {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503)
}

/// POST a JSON body, retrying rate-limit responses with a fixed backoff.
pub(crate) async fn post_json_with_retry<B: Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &B,
    retry: TransportRetry,
) -> anyhow::Result<String> {
    let mut attempt = 0u32;
    loop {
        let response = http
            .post(url)
            .header("Content-Type", "application/json")
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }

        if is_retryable(status) && attempt < retry.max_retries {
            attempt += 1;
            tracing::warn!(
                "{} returned {}. Retrying in {}s (attempt {}/{})",
                url,
                status,
                retry.backoff.as_secs(),
                attempt,
                retry.max_retries
            );
            tokio::time::sleep(retry.backoff).await;
            continue;
        }

        let error_msg = match status.as_u16() {
            401 | 403 => format!("Endpoint {} rejected the API key ({})", url, status),
            429 => format!("Rate limited by {} after {} retries", url, attempt),
            500..=599 => format!(
                "Server error ({}) from {}. The service may be temporarily unavailable.",
                status, url
            ),
            _ => format!("API error {}: {}", status, truncate_str(&text, 200)),
        };
        return Err(anyhow::anyhow!("{}", error_msg));
    }
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
