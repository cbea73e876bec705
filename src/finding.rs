//! Findings reported by the static analyzer and their human labels.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// One reported issue, as normalized by the report-ingestion step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    /// Checker tag, e.g. `RESOURCE_LEAK` or `OVERRUN`
    pub issue_type: String,
    /// Raw multi-line error trace with `file:line:` frames
    pub trace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weakness_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weakness_link: Option<String>,
}

impl Finding {
    pub fn new(id: impl Into<String>, issue_type: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            issue_type: issue_type.into(),
            trace: trace.into(),
            weakness_id: None,
            weakness_link: None,
        }
    }
}

/// Load findings from a JSON array, rejecting duplicate ids.
pub fn load_findings(path: &Path) -> anyhow::Result<Vec<Finding>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read findings from {}", path.display()))?;
    let findings: Vec<Finding> = serde_json::from_str(&content)
        .with_context(|| format!("Findings file {} is not a JSON array of findings", path.display()))?;
    ensure_unique_ids(&findings)?;
    Ok(findings)
}

pub(crate) fn ensure_unique_ids(findings: &[Finding]) -> anyhow::Result<()> {
    let mut seen = HashSet::with_capacity(findings.len());
    for finding in findings {
        if !seen.insert(finding.id.as_str()) {
            anyhow::bail!("Duplicate finding id '{}' in input", finding.id);
        }
    }
    Ok(())
}

/// Human answer to "is this finding a false positive?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroundTruthLabel {
    RealIssue,
    FalsePositive,
}

impl GroundTruthLabel {
    /// Parse a spreadsheet-style label. Returns `None` for anything unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "false positive" | "fp" => Some(GroundTruthLabel::FalsePositive),
            "no" | "n" | "false" | "real" | "real issue" | "true positive" | "tp"
            | "not a false positive" => Some(GroundTruthLabel::RealIssue),
            _ => None,
        }
    }
}

/// Raw ground truth as read from disk: finding id -> label text.
pub type RawGroundTruth = BTreeMap<String, String>;

pub fn load_ground_truth(path: &Path) -> anyhow::Result<RawGroundTruth> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read ground truth from {}", path.display()))?;
    let parsed: RawGroundTruth = serde_json::from_str(&content).with_context(|| {
        format!(
            "Ground truth file {} must be a JSON object of id -> label",
            path.display()
        )
    })?;
    tracing::info!(labels = parsed.len(), "Loaded ground truth from {}", path.display());
    Ok(parsed)
}
