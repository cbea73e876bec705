//! Known false positives
//!
//! A plain-text corpus of findings engineers already confirmed as false
//! alarms. Records are separated by blank lines; the first line carries an
//! `Error: <TYPE>` token and the last line is the engineer's reason. Any
//! malformed record aborts loading, since a damaged corpus would skew every
//! later decision.

pub mod filter;
pub mod index;

pub use filter::{Deduplicator, FilterResponse, KnownIssueMatch};
pub use index::{cosine_similarity, Candidate, SimilarityIndex};

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeBaseError {
    #[error("failed to read known false positives from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("known false positive #{index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },

    #[error("known false positive #{index} has {chars} characters, over the embedding limit of {limit}")]
    TooLarge { index: usize, chars: usize, limit: usize },

    #[error("failed to embed known false positives: {0:#}")]
    Embedding(anyhow::Error),
}

/// One confirmed false positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownFalsePositiveRecord {
    /// The reported trace, without the reason line
    pub trace: String,
    pub reason: String,
    pub issue_type: String,
}

impl KnownFalsePositiveRecord {
    /// Parse one record. `index` is 1-based, for error messages.
    pub fn parse(index: usize, text: &str) -> Result<Self, KnowledgeBaseError> {
        let malformed = |reason: &str| KnowledgeBaseError::Malformed {
            index,
            reason: reason.to_string(),
        };
        let lines: Vec<&str> = text.trim().lines().collect();
        let (Some(first), Some(last)) = (lines.first(), lines.last()) else {
            return Err(malformed("record is empty"));
        };
        if lines.len() < 2 {
            return Err(malformed("a record needs at least a trace line and a reason line"));
        }
        let issue_type = first
            .split_once("Error:")
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|word| word.trim_end_matches(':').to_string())
            .filter(|word| !word.is_empty())
            .ok_or_else(|| malformed("first line has no 'Error: <TYPE>' token"))?;
        let reason = last.trim();
        if reason.is_empty() {
            return Err(malformed("reason line is empty"));
        }

        Ok(Self {
            trace: lines[..lines.len() - 1].join("\n"),
            reason: reason.to_string(),
            issue_type,
        })
    }
}

/// Split a corpus into records and validate each one.
pub fn parse_knowledge_base(
    text: &str,
    embedding_max_chars: usize,
) -> Result<Vec<KnownFalsePositiveRecord>, KnowledgeBaseError> {
    let normalized = text.replace("\r\n", "\n");
    let mut records = Vec::new();
    for (i, chunk) in split_records(&normalized).into_iter().enumerate() {
        let record = KnownFalsePositiveRecord::parse(i + 1, chunk)?;
        let chars = record.trace.chars().count();
        if chars > embedding_max_chars {
            return Err(KnowledgeBaseError::TooLarge {
                index: i + 1,
                chars,
                limit: embedding_max_chars,
            });
        }
        records.push(record);
    }
    Ok(records)
}

/// Blank-line separated chunks; whitespace-only lines count as blank.
fn split_records(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                chunks.push(&text[s..end]);
            }
        } else {
            start.get_or_insert(offset);
            end = offset + line.len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        chunks.push(&text[s..end]);
    }
    chunks
}

pub fn load_knowledge_base(
    path: &Path,
    embedding_max_chars: usize,
) -> Result<Vec<KnownFalsePositiveRecord>, KnowledgeBaseError> {
    let text = fs::read_to_string(path).map_err(|source| KnowledgeBaseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let records = parse_knowledge_base(&text, embedding_max_chars)?;
    tracing::info!(records = records.len(), "Loaded known false positives from {}", path.display());
    Ok(records)
}
