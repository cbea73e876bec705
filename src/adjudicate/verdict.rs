//! Verdict types and the result schemas each adjudication step decodes into.

use crate::evidence::MissingSymbolRequest;
use crate::known_issues::FilterResponse;
use crate::llm::schema::{flexible_bool, list_or_string, score_0_to_2, string_or_list};
use crate::llm::StructuredOutput;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Justification carried by a verdict that could not be produced normally.
pub const FALLBACK_JUSTIFICATION: &str =
    "The investigation failed before a verdict was reached. Defaulting to TRUE POSITIVE so the finding gets a manual review.";

/// Two-valued outcome. Models phrase it several ways, so parsing is lenient:
/// `FALSE POSITIVE` is a false alarm, `TRUE POSITIVE` and `NOT A FALSE POSITIVE`
/// are real issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InvestigationResult {
    TruePositive,
    FalsePositive,
}

impl InvestigationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationResult::TruePositive => "TRUE_POSITIVE",
            InvestigationResult::FalsePositive => "FALSE_POSITIVE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        if normalized.contains("NOT A FALSE POSITIVE") || normalized.contains("TRUE POSITIVE") {
            Some(InvestigationResult::TruePositive)
        } else if normalized.contains("FALSE POSITIVE") {
            Some(InvestigationResult::FalsePositive)
        } else {
            None
        }
    }
}

impl fmt::Display for InvestigationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl TryFrom<String> for InvestigationResult {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| {
            format!(
                "expected FALSE POSITIVE or TRUE POSITIVE, got '{}'",
                value
            )
        })
    }
}

impl From<InvestigationResult> for String {
    fn from(value: InvestigationResult) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJson {
    pub investigation_result: InvestigationResult,
    #[serde(default, deserialize_with = "string_or_list")]
    pub justifications: Vec<String>,
}

impl StructuredOutput for AnalysisJson {
    const NAME: &'static str = "analysis";
    const SCHEMA: &'static str =
        r#"{"investigation_result": "FALSE POSITIVE or TRUE POSITIVE", "justifications": ["string"]}"#;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecommendationJson {
    #[serde(deserialize_with = "flexible_bool")]
    pub is_final: bool,
    #[serde(default, deserialize_with = "string_or_list")]
    pub justifications: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<MissingSymbolRequest>,
}

impl StructuredOutput for RecommendationJson {
    const NAME: &'static str = "recommendation";
    const SCHEMA: &'static str = r#"{"is_final": "TRUE or FALSE", "justifications": ["string"], "recommendations": ["string"], "instructions": [{"expression_name": "string", "referring_source_code_path": "string", "recommendation": "string"}]}"#;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SummaryJson {
    #[serde(deserialize_with = "list_or_string")]
    pub short_justifications: String,
}

impl StructuredOutput for SummaryJson {
    const NAME: &'static str = "summary";
    const SCHEMA: &'static str = r#"{"short_justifications": "string"}"#;
}

/// Critique scores, each 0 to 2 (2 is best). `None` when the model omitted one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueScores {
    #[serde(default, deserialize_with = "score_0_to_2")]
    pub justifications: Option<u8>,
    #[serde(default, deserialize_with = "score_0_to_2")]
    pub recommendations: Option<u8>,
    #[serde(default, deserialize_with = "score_0_to_2")]
    pub factual_accuracy: Option<u8>,
    #[serde(default, deserialize_with = "score_0_to_2")]
    pub completeness: Option<u8>,
    #[serde(default, deserialize_with = "score_0_to_2")]
    pub confidence: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CritiqueJson {
    pub critique_result: InvestigationResult,
    #[serde(default, deserialize_with = "string_or_list")]
    pub justifications: Vec<String>,
    #[serde(default)]
    pub scores: CritiqueScores,
}

impl StructuredOutput for CritiqueJson {
    const NAME: &'static str = "critique";
    const SCHEMA: &'static str = r#"{"critique_result": "FALSE POSITIVE or NOT A FALSE POSITIVE", "justifications": ["string"], "scores": {"justifications": 0, "recommendations": 0, "factual_accuracy": 0, "completeness": 0, "confidence": 0}}"#;
}

/// The independent second opinion. Stored next to the primary verdict and
/// never merged into it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CritiqueVerdict {
    pub result: InvestigationResult,
    pub justifications: Vec<String>,
    pub scores: CritiqueScores,
    /// The critique pass failed; `result` is copied from the primary verdict
    pub failed: bool,
}

impl From<CritiqueJson> for CritiqueVerdict {
    fn from(json: CritiqueJson) -> Self {
        Self {
            result: json.critique_result,
            justifications: json.justifications,
            scores: json.scores,
            failed: false,
        }
    }
}

impl CritiqueVerdict {
    pub fn failed(primary: InvestigationResult, reason: &str) -> Self {
        Self {
            result: primary,
            justifications: vec![format!("Critique failed, keeping the primary result: {}", reason)],
            scores: CritiqueScores::default(),
            failed: true,
        }
    }
}

/// The engine's decision on one finding. The latest instance is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub result: InvestigationResult,
    pub justifications: Vec<String>,
    pub is_final: bool,
    /// Symbols the reviewer still wanted to see when the loop stopped
    pub instructions: Vec<MissingSymbolRequest>,
    pub short_justification: String,
    /// The reviewer's notes on the analysis
    pub evaluation: Vec<String>,
    pub recommendations: Vec<String>,
    /// Evidence-extension rounds used
    pub rounds: usize,
    /// Rendered analysis prompt of the last round
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    /// Sentinel produced after an unrecoverable failure; excluded from metrics
    pub fallback: bool,
}

impl Verdict {
    /// Combine one ANALYZE and one RECOMMEND result.
    pub fn from_round(
        analysis: AnalysisJson,
        recommendation: RecommendationJson,
        rounds: usize,
        prompt: String,
    ) -> Self {
        let instructions = recommendation
            .instructions
            .into_iter()
            .filter(|i| !i.name.trim().is_empty())
            .collect();
        Self {
            result: analysis.investigation_result,
            justifications: analysis.justifications,
            is_final: recommendation.is_final,
            instructions,
            short_justification: String::new(),
            evaluation: recommendation.justifications,
            recommendations: recommendation.recommendations,
            rounds,
            prompt,
            fallback: false,
        }
    }

    /// Sentinel for a finding whose adjudication failed at `stage`.
    pub fn fallback(stage: &str, prompt: String) -> Self {
        let failed = format!("Failed during {}", stage);
        Self {
            result: InvestigationResult::TruePositive,
            justifications: vec![FALLBACK_JUSTIFICATION.to_string()],
            is_final: true,
            instructions: Vec::new(),
            short_justification: format!("{}. Please check the full justifications.", failed),
            evaluation: vec![failed.clone()],
            recommendations: vec![failed],
            rounds: 0,
            prompt,
            fallback: true,
        }
    }

    /// Verdict for a finding the deduplicator matched to a known false positive.
    pub fn known_false_positive(response: &FilterResponse) -> Self {
        let mut justifications = vec![response.justifications.clone()];
        justifications.extend(
            response
                .equal_error_trace
                .iter()
                .map(|line| format!("Matching known trace: {}", line)),
        );
        Self {
            result: InvestigationResult::FalsePositive,
            justifications,
            is_final: true,
            instructions: Vec::new(),
            short_justification: format!("Known false positive: {}", response.justifications),
            evaluation: Vec::new(),
            recommendations: Vec::new(),
            rounds: 0,
            prompt: String::new(),
            fallback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_phrasings() {
        assert_eq!(InvestigationResult::parse("FALSE POSITIVE"), Some(InvestigationResult::FalsePositive));
        assert_eq!(InvestigationResult::parse("false_positive"), Some(InvestigationResult::FalsePositive));
        assert_eq!(InvestigationResult::parse("TRUE POSITIVE"), Some(InvestigationResult::TruePositive));
        assert_eq!(
            InvestigationResult::parse("Not a  false-positive"),
            Some(InvestigationResult::TruePositive)
        );
        assert_eq!(InvestigationResult::parse("unsure"), None);
    }

    #[test]
    fn test_result_serializes_canonically() {
        let json = serde_json::to_string(&InvestigationResult::FalsePositive).unwrap();
        assert_eq!(json, "\"FALSE_POSITIVE\"");
        let back: InvestigationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InvestigationResult::FalsePositive);
        assert!(serde_json::from_str::<InvestigationResult>("\"maybe\"").is_err());
    }

    #[test]
    fn test_recommendation_decodes_loose_shapes() {
        let rec: RecommendationJson = serde_json::from_str(
            r#"{"is_final": "FALSE", "justifications": "needs the macro",
                "instructions": [{"expression_name": "CLAMP", "referring_source_code_path": "src/a.c"}]}"#,
        )
        .unwrap();
        assert!(!rec.is_final);
        assert_eq!(rec.justifications, vec!["needs the macro"]);
        assert!(rec.recommendations.is_empty());
        assert_eq!(rec.instructions[0].name, "CLAMP");
        assert!(rec.instructions[0].rationale.is_empty());
    }

    #[test]
    fn test_blank_instructions_dropped() {
        let analysis = AnalysisJson {
            investigation_result: InvestigationResult::TruePositive,
            justifications: vec!["x".to_string()],
        };
        let rec: RecommendationJson = serde_json::from_str(
            r#"{"is_final": false, "instructions": [{"expression_name": " "}, {"expression_name": "xmalloc"}]}"#,
        )
        .unwrap();
        let verdict = Verdict::from_round(analysis, rec, 0, String::new());
        assert_eq!(verdict.instructions.len(), 1);
        assert_eq!(verdict.instructions[0].name, "xmalloc");
    }

    #[test]
    fn test_fallback_is_true_positive() {
        let verdict = Verdict::fallback("analyze", String::new());
        assert!(verdict.fallback);
        assert_eq!(verdict.result, InvestigationResult::TruePositive);
        assert_eq!(verdict.justifications, vec![FALLBACK_JUSTIFICATION]);
        assert!(verdict.short_justification.starts_with("Failed during analyze"));
    }

    #[test]
    fn test_critique_scores_clamped() {
        let critique: CritiqueJson = serde_json::from_str(
            r#"{"critique_result": "NOT A FALSE POSITIVE", "justifications": ["ok"],
                "scores": {"justifications": 3, "recommendations": "1", "confidence": 2}}"#,
        )
        .unwrap();
        let verdict = CritiqueVerdict::from(critique);
        assert_eq!(verdict.result, InvestigationResult::TruePositive);
        assert_eq!(verdict.scores.justifications, Some(2));
        assert_eq!(verdict.scores.recommendations, Some(1));
        assert_eq!(verdict.scores.completeness, None);
    }
}
