//! Known-issue deduplication: ask the model whether a finding repeats a
//! confirmed false positive of the same issue type.

use super::index::{Candidate, SimilarityIndex};
use crate::finding::Finding;
use crate::llm::prompts::known_issue_filter_request;
use crate::llm::schema::{list_or_string, string_or_list};
use crate::llm::{EmbeddingModel, OutputGuard, StructuredOutput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The model's answer to "is this trace a known false positive?"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterResponse {
    #[serde(default, deserialize_with = "string_or_list")]
    pub equal_error_trace: Vec<String>,
    #[serde(default, deserialize_with = "list_or_string")]
    pub justifications: String,
    pub result: String,
}

impl StructuredOutput for FilterResponse {
    const NAME: &'static str = "known_issue_filter";
    const SCHEMA: &'static str =
        r#"{"equal_error_trace": ["string"], "justifications": "string", "result": "YES or NO"}"#;
}

impl FilterResponse {
    pub fn no(justification: impl Into<String>) -> Self {
        Self {
            equal_error_trace: Vec::new(),
            justifications: justification.into(),
            result: "NO".to_string(),
        }
    }

    /// Lenient: any answer mentioning "yes" counts.
    pub fn is_match(&self) -> bool {
        self.result.trim().to_lowercase().contains("yes")
    }
}

/// Outcome of the known-issue check for one finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownIssueMatch {
    pub response: FilterResponse,
    /// Retrieved candidates rendered as numbered examples; empty when the
    /// issue type has no known false positives
    pub examples: String,
    pub candidates: usize,
}

impl KnownIssueMatch {
    pub fn is_match(&self) -> bool {
        self.response.is_match()
    }
}

/// Render candidates as numbered known-false-positive examples.
pub fn render_examples(candidates: &[Candidate<'_>]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let n = i + 1;
            format!(
                "** Example {n} **\n(Example {n}) Known false positive:\n{}\n(Example {n}) Reason it was marked a false positive:\n{}",
                c.record.trace, c.record.reason
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct Deduplicator {
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn EmbeddingModel>,
    guard: Arc<OutputGuard>,
    k: usize,
}

impl Deduplicator {
    pub fn new(
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn EmbeddingModel>,
        guard: Arc<OutputGuard>,
        k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            guard,
            k: k.max(1),
        }
    }

    /// Check `finding` against the known false positives of its issue type.
    ///
    /// Never fails: an empty partition short-circuits to NO without touching
    /// any model, and embedding or decode failures degrade to NO.
    pub async fn check(&self, finding: &Finding) -> KnownIssueMatch {
        if self.index.partition_len(&finding.issue_type) == 0 {
            tracing::debug!(finding = %finding.id, "No known false positives of type {}", finding.issue_type);
            return KnownIssueMatch {
                response: FilterResponse::no(format!(
                    "No identical error trace found: there are no known false positives of type {}",
                    finding.issue_type
                )),
                examples: String::new(),
                candidates: 0,
            };
        }

        let query = match self.embedder.embed(std::slice::from_ref(&finding.trace)).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                tracing::warn!(finding = %finding.id, "Embedding endpoint returned no vector");
                return Self::unchecked(finding, "embedding endpoint returned no vector");
            }
            Err(e) => {
                tracing::warn!(finding = %finding.id, "Failed to embed trace: {:#}", e);
                return Self::unchecked(finding, &format!("{:#}", e));
            }
        };

        let candidates = self.index.top_k(&finding.issue_type, &query, self.k);
        let examples = render_examples(&candidates);
        let request = known_issue_filter_request(&finding.trace, &examples);
        let response = match self.guard.decode::<FilterResponse>(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(finding = %finding.id, "Known-issue check failed: {}", e);
                FilterResponse::no(format!("Known-issue check failed, treating as not known: {}", e))
            }
        };
        tracing::info!(
            finding = %finding.id,
            candidates = candidates.len(),
            known = response.is_match(),
            "Known-issue check done"
        );

        KnownIssueMatch {
            response,
            examples,
            candidates: candidates.len(),
        }
    }

    fn unchecked(finding: &Finding, reason: &str) -> KnownIssueMatch {
        KnownIssueMatch {
            response: FilterResponse::no(format!(
                "Known false positives of type {} could not be searched: {}",
                finding.issue_type, reason
            )),
            examples: String::new(),
            candidates: 0,
        }
    }
}
