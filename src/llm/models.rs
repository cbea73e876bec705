use serde::{Deserialize, Serialize};

/// Model families differ in how they report a structured-output miss, which
/// decides the decode strategy the output guard uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// OpenAI-compatible endpoints: the raw text is always returned, so a
    /// failed parse can be repaired.
    #[serde(alias = "openai-compatible")]
    OpenAi,
    /// NVIDIA-hosted endpoints: a parse miss comes back empty, so the only
    /// remedy is to ask again.
    Nvidia,
}

impl ModelFamily {
    /// Infer the family from the endpoint URL.
    pub fn detect(url: &str) -> Self {
        if url.to_lowercase().contains("nvidia") {
            ModelFamily::Nvidia
        } else {
            ModelFamily::OpenAi
        }
    }
}

/// The three client roles the pipeline constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Main,
    Critique,
    Embedding,
}

impl ModelRole {
    pub fn label(&self) -> &'static str {
        match self {
            ModelRole::Main => "main",
            ModelRole::Critique => "critique",
            ModelRole::Embedding => "embedding",
        }
    }
}

/// API usage information reported by the endpoint
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}
