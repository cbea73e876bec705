//! Adjudication engine
//!
//! Per finding: ANALYZE the trace against the gathered evidence, have a
//! reviewer pass RECOMMEND whether the analysis is final, and while it is not
//! (and asks for specific functions or macros) resolve those symbols and go
//! around again, up to a configured number of extra rounds. The final verdict
//! is then SUMMARIZED into an engineer-style comment and, when enabled,
//! audited by an independent CRITIQUE pass.
//!
//! Failures never escape: an unrecoverable step yields the fallback verdict.

pub mod verdict;

pub use verdict::{
    AnalysisJson, CritiqueJson, CritiqueScores, CritiqueVerdict, InvestigationResult, RecommendationJson,
    SummaryJson, Verdict, FALLBACK_JUSTIFICATION,
};

use crate::evidence::{EvidenceExtractor, EvidenceSet};
use crate::finding::Finding;
use crate::llm::prompts::{analysis_request, critique_request, recommendation_request, summary_request};
use crate::llm::OutputGuard;
use std::sync::Arc;

/// Everything the engine produced for one finding.
#[derive(Debug, Clone)]
pub struct Adjudication {
    pub verdict: Verdict,
    pub critique: Option<CritiqueVerdict>,
    /// Evidence accumulated over all rounds
    pub evidence: EvidenceSet,
    /// The context block of the last analysis prompt
    pub context: String,
}

pub struct Adjudicator {
    guard: Arc<OutputGuard>,
    critique: Option<Arc<OutputGuard>>,
    extractor: Arc<EvidenceExtractor>,
    max_evidence_rounds: usize,
}

/// Evidence plus known-issue examples, as shown to the model.
pub fn render_context(evidence: &EvidenceSet, known_examples: &str) -> String {
    let mut context = evidence.render();
    if !known_examples.trim().is_empty() {
        if !context.is_empty() {
            context.push_str("\n\n");
        }
        context.push_str("Known false positives of the same issue type:\n");
        context.push_str(known_examples.trim());
    }
    context
}

impl Adjudicator {
    pub fn new(guard: Arc<OutputGuard>, extractor: Arc<EvidenceExtractor>, max_evidence_rounds: usize) -> Self {
        Self {
            guard,
            critique: None,
            extractor,
            max_evidence_rounds,
        }
    }

    /// Enable the critique pass, usually on a separate model.
    pub fn with_critique(mut self, critique: Arc<OutputGuard>) -> Self {
        self.critique = Some(critique);
        self
    }

    pub async fn adjudicate(&self, finding: &Finding, known_examples: &str) -> Adjudication {
        let mut evidence = self.extractor.extract_from_trace(&finding.trace);
        tracing::debug!(
            finding = %finding.id,
            files = evidence.file_count(),
            excerpts = evidence.excerpt_count(),
            "Extracted trace evidence"
        );

        let mut rounds = 0;
        let (verdict, context, analysis) = loop {
            let context = render_context(&evidence, known_examples);
            let request = analysis_request(&finding.trace, &context);
            let prompt = request.render();
            tracing::debug!(finding = %finding.id, round = rounds, "Analysis prompt:\n{}", prompt);

            let analysis = match self.guard.decode::<AnalysisJson>(&request).await {
                Ok(analysis) => analysis,
                Err(e) => {
                    tracing::error!(finding = %finding.id, "Analysis failed: {}", e);
                    return self.fallback(finding, "analyze", prompt, evidence, context);
                }
            };
            let recommend = recommendation_request(&finding.trace, &analysis.justifications, &context);
            let recommendation = match self.guard.decode::<RecommendationJson>(&recommend).await {
                Ok(recommendation) => recommendation,
                Err(e) => {
                    tracing::error!(finding = %finding.id, "Recommendation failed: {}", e);
                    return self.fallback(finding, "recommend", prompt, evidence, context);
                }
            };

            let verdict = Verdict::from_round(analysis.clone(), recommendation, rounds, prompt);
            tracing::info!(
                finding = %finding.id,
                round = rounds,
                result = %verdict.result,
                is_final = verdict.is_final,
                requested = verdict.instructions.len(),
                "Analysis round done"
            );
            if self.is_settled(&verdict, rounds) {
                break (verdict, context, analysis);
            }

            let added = evidence.extend(self.extractor.resolve_missing(&verdict.instructions));
            rounds += 1;
            tracing::info!(finding = %finding.id, added, "Extended evidence for round {}", rounds);
        };

        let verdict = match self.summarize(finding, verdict, &analysis).await {
            Ok(verdict) => verdict,
            Err(prompt) => return self.fallback(finding, "summarize", prompt, evidence, context),
        };
        let critique = self.critique(finding, &verdict).await;

        Adjudication {
            verdict,
            critique,
            evidence,
            context,
        }
    }

    fn is_settled(&self, verdict: &Verdict, rounds: usize) -> bool {
        verdict.is_final
            || verdict.instructions.is_empty()
            || verdict.result == InvestigationResult::FalsePositive
            || rounds >= self.max_evidence_rounds
    }

    /// Attach the short justification. On failure the prompt is handed back
    /// for the fallback verdict.
    async fn summarize(&self, finding: &Finding, mut verdict: Verdict, analysis: &AnalysisJson) -> Result<Verdict, String> {
        let response = serde_json::to_string(analysis).unwrap_or_default();
        let request = summary_request(&verdict.prompt, &response);
        match self.guard.decode::<SummaryJson>(&request).await {
            Ok(summary) => {
                verdict.short_justification = summary.short_justifications.trim().to_string();
                Ok(verdict)
            }
            Err(e) => {
                tracing::error!(finding = %finding.id, "Summary failed: {}", e);
                Err(std::mem::take(&mut verdict.prompt))
            }
        }
    }

    async fn critique(&self, finding: &Finding, verdict: &Verdict) -> Option<CritiqueVerdict> {
        let guard = self.critique.as_ref()?;
        let verdict_json = match serde_json::to_string(verdict) {
            Ok(json) => json,
            Err(e) => return Some(CritiqueVerdict::failed(verdict.result, &e.to_string())),
        };
        let request = critique_request(&verdict.prompt, &verdict_json);
        let critique = match guard.decode::<CritiqueJson>(&request).await {
            Ok(json) => CritiqueVerdict::from(json),
            Err(e) => {
                tracing::warn!(finding = %finding.id, "Critique failed: {}", e);
                CritiqueVerdict::failed(verdict.result, &e.to_string())
            }
        };
        if critique.result != verdict.result {
            tracing::info!(
                finding = %finding.id,
                primary = %verdict.result,
                critique = %critique.result,
                "Critique disagrees with the primary verdict"
            );
        }
        Some(critique)
    }

    fn fallback(
        &self,
        finding: &Finding,
        stage: &str,
        prompt: String,
        evidence: EvidenceSet,
        context: String,
    ) -> Adjudication {
        tracing::warn!(finding = %finding.id, "Using fallback verdict after {} failure", stage);
        Adjudication {
            verdict: Verdict::fallback(stage, prompt),
            critique: None,
            evidence,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::llm::testing::{RoutedModel, ScriptedModel};
    use crate::llm::ModelFamily;
    use std::fs;

    const ANALYZE: &str = "You are a security analyst deciding";
    const RECOMMEND: &str = "You are reviewing another analyst";
    const SUMMARIZE: &str = "You condense an investigation";
    const CRITIQUE: &str = "You are a C developer auditing";

    const TRUE_POSITIVE: &str = r#"{"investigation_result": "TRUE POSITIVE", "justifications": ["len is never checked"]}"#;
    const FALSE_POSITIVE: &str = r#"{"investigation_result": "FALSE POSITIVE", "justifications": ["p is freed on line 4"]}"#;
    const WANTS_MORE: &str = r#"{"is_final": "FALSE", "justifications": ["CLAMP is not shown"], "recommendations": ["read CLAMP"],
        "instructions": [{"expression_name": "CLAMP", "referring_source_code_path": "src/a.c", "recommendation": "check bounds"}]}"#;
    const FINAL: &str = r#"{"is_final": "TRUE", "justifications": ["conclusive"], "recommendations": [], "instructions": []}"#;
    const SUMMARY: &str = r#"{"short_justifications": "len is unchecked"}"#;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/a.c"),
            "#include \"util.h\"\n\nint get(int *buf, int len)\n{\n    return buf[CLAMP(len)];\n}\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/util.h"), "#define CLAMP(x) \\\n    ((x) < 0 ? 0 : (x))\n").unwrap();
        dir
    }

    fn extractor(root: &std::path::Path) -> Arc<EvidenceExtractor> {
        let config = RepositoryConfig {
            root: root.to_path_buf(),
            ..RepositoryConfig::default()
        };
        Arc::new(EvidenceExtractor::new(&config).unwrap())
    }

    fn routes(
        analyze: Arc<ScriptedModel>,
        recommend: Arc<ScriptedModel>,
        summarize: Arc<ScriptedModel>,
    ) -> Arc<OutputGuard> {
        let model = RoutedModel::new(
            ModelFamily::OpenAi,
            vec![(ANALYZE, analyze), (RECOMMEND, recommend), (SUMMARIZE, summarize)],
        );
        Arc::new(OutputGuard::new(model, 2))
    }

    fn finding() -> Finding {
        Finding::new("def1", "OVERRUN", "Error: OVERRUN:\nsrc/a.c:5: overrun-local: Overrunning array buf")
    }

    #[tokio::test]
    async fn test_evidence_requests_are_bounded() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [TRUE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [WANTS_MORE]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let engine = Adjudicator::new(
            routes(analyze.clone(), recommend.clone(), summarize.clone()),
            extractor(dir.path()),
            2,
        );

        let outcome = engine.adjudicate(&finding(), "").await;
        assert_eq!(analyze.calls(), 3);
        assert_eq!(recommend.calls(), 3);
        assert_eq!(summarize.calls(), 1);
        assert_eq!(outcome.verdict.rounds, 2);
        assert!(!outcome.verdict.fallback);
        assert_eq!(outcome.verdict.short_justification, "len is unchecked");
        assert!(outcome.evidence.excerpts("src/util.h").is_some());
        assert!(analyze.requests()[1].user.contains("#define CLAMP(x)"));
    }

    #[tokio::test]
    async fn test_false_positive_ends_the_loop() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [FALSE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [WANTS_MORE]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let engine = Adjudicator::new(routes(analyze.clone(), recommend, summarize), extractor(dir.path()), 2);

        let outcome = engine.adjudicate(&finding(), "").await;
        assert_eq!(analyze.calls(), 1);
        assert_eq!(outcome.verdict.result, InvestigationResult::FalsePositive);
        assert_eq!(outcome.verdict.instructions.len(), 1);
    }

    #[tokio::test]
    async fn test_final_recommendation_ends_the_loop() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [TRUE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [FINAL]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let engine = Adjudicator::new(routes(analyze.clone(), recommend, summarize), extractor(dir.path()), 2);

        let outcome = engine.adjudicate(&finding(), "** Example 1 **\nknown").await;
        assert_eq!(analyze.calls(), 1);
        assert!(outcome.verdict.is_final);
        assert_eq!(outcome.verdict.evaluation, vec!["conclusive"]);
        assert!(outcome.context.contains("code of src/a.c file:"));
        assert!(outcome.context.contains("Known false positives of the same issue type:\n** Example 1 **"));
    }

    #[tokio::test]
    async fn test_unparsable_analysis_falls_back() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, ["I think it is fine"]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [FINAL]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let engine = Adjudicator::new(routes(analyze, recommend.clone(), summarize), extractor(dir.path()), 2);

        let outcome = engine.adjudicate(&finding(), "").await;
        assert!(outcome.verdict.fallback);
        assert_eq!(outcome.verdict.result, InvestigationResult::TruePositive);
        assert_eq!(outcome.verdict.justifications, vec![FALLBACK_JUSTIFICATION]);
        assert_eq!(recommend.calls(), 0);
        assert!(!outcome.evidence.is_empty());
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [TRUE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [FINAL]);
        let summarize = ScriptedModel::failing(ModelFamily::OpenAi);
        let engine = Adjudicator::new(routes(analyze, recommend, summarize), extractor(dir.path()), 2);

        let outcome = engine.adjudicate(&finding(), "").await;
        assert!(outcome.verdict.fallback);
        assert!(outcome.verdict.short_justification.starts_with("Failed during summarize"));
        assert!(outcome.verdict.prompt.contains("FINDING:"));
    }

    #[tokio::test]
    async fn test_critique_never_overrides_verdict() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [TRUE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [FINAL]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let critic = ScriptedModel::new(
            ModelFamily::Nvidia,
            [r#"{"critique_result": "FALSE POSITIVE", "justifications": ["bounds are clamped"], "scores": {"justifications": 1, "confidence": 2}}"#],
        );
        let critique_model = RoutedModel::new(ModelFamily::Nvidia, vec![(CRITIQUE, critic.clone())]);
        let engine = Adjudicator::new(routes(analyze, recommend, summarize), extractor(dir.path()), 2)
            .with_critique(Arc::new(OutputGuard::new(critique_model, 2)));

        let outcome = engine.adjudicate(&finding(), "").await;
        assert_eq!(critic.calls(), 1);
        assert_eq!(outcome.verdict.result, InvestigationResult::TruePositive);
        let critique = outcome.critique.unwrap();
        assert_eq!(critique.result, InvestigationResult::FalsePositive);
        assert_eq!(critique.scores.confidence, Some(2));
        assert!(!critique.failed);
    }

    #[tokio::test]
    async fn test_critique_failure_keeps_primary_result() {
        let dir = repo();
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [TRUE_POSITIVE]);
        let recommend = ScriptedModel::new(ModelFamily::OpenAi, [FINAL]);
        let summarize = ScriptedModel::new(ModelFamily::OpenAi, [SUMMARY]);
        let engine = Adjudicator::new(routes(analyze, recommend, summarize), extractor(dir.path()), 2)
            .with_critique(Arc::new(OutputGuard::new(ScriptedModel::failing(ModelFamily::OpenAi), 2)));

        let outcome = engine.adjudicate(&finding(), "").await;
        assert!(!outcome.verdict.fallback);
        let critique = outcome.critique.unwrap();
        assert!(critique.failed);
        assert_eq!(critique.result, InvestigationResult::TruePositive);
    }
}
