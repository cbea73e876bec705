//! Batch driver: known-issue check, adjudication, then evaluation.
//!
//! Findings are processed one at a time. Nothing a single finding does can
//! stop the batch; only setup (config, knowledge base, clients) is fatal.

use crate::adjudicate::{Adjudicator, CritiqueVerdict, Verdict};
use crate::config::Config;
use crate::evaluation::{EvaluationSummary, ScoredVerdict};
use crate::evidence::{EvidenceExtractor, EvidenceSet};
use crate::finding::{Finding, RawGroundTruth};
use crate::known_issues::{load_knowledge_base, Deduplicator, KnownIssueMatch, SimilarityIndex};
use crate::llm::{ModelClients, OutputGuard, Usage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Everything recorded about one finding.
#[derive(Debug, Clone, Serialize)]
pub struct TriageRecord {
    pub finding: Finding,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critique: Option<CritiqueVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_issue: Option<KnownIssueMatch>,
    pub evidence: EvidenceSet,
    /// Context block shown to the model in the last analysis round
    pub context: String,
}

impl TriageRecord {
    /// The result the aggregator scores, per the configured policy.
    pub fn scored(&self, use_critique_as_final: bool) -> ScoredVerdict {
        let result = match (&self.critique, use_critique_as_final) {
            (Some(critique), true) => critique.result,
            _ => self.verdict.result,
        };
        ScoredVerdict {
            id: self.finding.id.clone(),
            result,
            fallback: self.verdict.fallback,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub use_critique_as_final: bool,
    pub usage: Usage,
    pub findings: Vec<TriageRecord>,
    pub evaluation: EvaluationSummary,
}

pub struct TriagePipeline {
    adjudicator: Adjudicator,
    deduplicator: Option<Deduplicator>,
    guards: Vec<Arc<OutputGuard>>,
    use_critique_as_final: bool,
}

impl TriagePipeline {
    pub fn new(
        adjudicator: Adjudicator,
        deduplicator: Option<Deduplicator>,
        guards: Vec<Arc<OutputGuard>>,
        use_critique_as_final: bool,
    ) -> Self {
        Self {
            adjudicator,
            deduplicator,
            guards,
            use_critique_as_final,
        }
    }

    /// Wire up every stage from configuration. Loads and embeds the known
    /// false positives up front; any failure here aborts the run.
    pub async fn build(config: &Config, clients: &ModelClients) -> anyhow::Result<Self> {
        let retries = config.triage.structured_max_retries;
        let guard = Arc::new(OutputGuard::new(clients.main()?, retries));
        let extractor = Arc::new(EvidenceExtractor::new(&config.repository)?);
        let mut adjudicator = Adjudicator::new(guard.clone(), extractor, config.triage.max_evidence_rounds);
        let mut guards = vec![guard.clone()];

        if config.triage.run_with_critique {
            let critique = Arc::new(OutputGuard::new(clients.critique()?, retries));
            guards.push(critique.clone());
            adjudicator = adjudicator.with_critique(critique);
        }

        let deduplicator = match &config.triage.known_false_positives {
            Some(path) => {
                let records = load_knowledge_base(path, config.triage.embedding_max_chars)?;
                let embedder = clients.embedding()?;
                let index = SimilarityIndex::build(records, embedder.as_ref()).await?;
                Some(Deduplicator::new(
                    Arc::new(index),
                    embedder,
                    guard,
                    config.triage.similarity_candidates,
                ))
            }
            None => {
                tracing::info!("No known false positives configured; skipping deduplication");
                None
            }
        };

        Ok(Self::new(
            adjudicator,
            deduplicator,
            guards,
            config.triage.use_critique_as_final,
        ))
    }

    pub async fn triage(&self, finding: &Finding) -> TriageRecord {
        let known_issue = match &self.deduplicator {
            Some(dedup) => Some(dedup.check(finding).await),
            None => None,
        };

        if let Some(known) = known_issue.as_ref().filter(|k| k.is_match()) {
            tracing::info!(finding = %finding.id, "Matches a known false positive");
            return TriageRecord {
                finding: finding.clone(),
                verdict: Verdict::known_false_positive(&known.response),
                critique: None,
                known_issue,
                evidence: EvidenceSet::new(),
                context: String::new(),
            };
        }

        let examples = known_issue.as_ref().map_or("", |k| k.examples.as_str());
        let outcome = self.adjudicator.adjudicate(finding, examples).await;
        TriageRecord {
            finding: finding.clone(),
            verdict: outcome.verdict,
            critique: outcome.critique,
            known_issue,
            evidence: outcome.evidence,
            context: outcome.context,
        }
    }

    pub async fn run(&self, findings: &[Finding], ground_truth: Option<&RawGroundTruth>) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, findings = findings.len(), "Starting triage");

        let mut records = Vec::with_capacity(findings.len());
        for (i, finding) in findings.iter().enumerate() {
            tracing::info!(finding = %finding.id, "Triaging {}/{}", i + 1, findings.len());
            let record = self.triage(finding).await;
            tracing::info!(
                finding = %finding.id,
                result = %record.verdict.result,
                fallback = record.verdict.fallback,
                "Verdict"
            );
            records.push(record);
        }

        let scored: Vec<ScoredVerdict> = records
            .iter()
            .map(|r| r.scored(self.use_critique_as_final))
            .collect();
        let evaluation = EvaluationSummary::compute(&scored, ground_truth);

        let mut usage = Usage::default();
        for guard in &self.guards {
            usage.add(&guard.total_usage());
        }

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            use_critique_as_final: self.use_critique_as_final,
            usage,
            findings: records,
            evaluation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjudicate::InvestigationResult;
    use crate::config::RepositoryConfig;
    use crate::known_issues::KnownFalsePositiveRecord;
    use crate::llm::testing::{HashingEmbedder, RoutedModel, ScriptedModel};
    use crate::llm::ModelFamily;
    use std::fs;

    const FILTER: &str = "You compare static-analysis error traces";
    const ANALYZE: &str = "You are a security analyst deciding";
    const RECOMMEND: &str = "You are reviewing another analyst";
    const SUMMARIZE: &str = "You condense an investigation";

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/a.c"),
            "void f(void)\n{\n    char *p = malloc(4);\n}\n",
        )
        .unwrap();
        dir
    }

    fn known_record() -> KnownFalsePositiveRecord {
        KnownFalsePositiveRecord {
            trace: "Error: RESOURCE_LEAK:\nsrc/a.c:3: leaked_storage p".to_string(),
            reason: "p is released by the arena".to_string(),
            issue_type: "RESOURCE_LEAK".to_string(),
        }
    }

    async fn pipeline(root: &std::path::Path, filter: Arc<ScriptedModel>, analyze: Arc<ScriptedModel>) -> TriagePipeline {
        let model = RoutedModel::new(
            ModelFamily::OpenAi,
            vec![
                (FILTER, filter),
                (ANALYZE, analyze),
                (
                    RECOMMEND,
                    ScriptedModel::new(ModelFamily::OpenAi, [r#"{"is_final": "TRUE", "instructions": []}"#]),
                ),
                (
                    SUMMARIZE,
                    ScriptedModel::new(ModelFamily::OpenAi, [r#"{"short_justifications": "p leaks"}"#]),
                ),
            ],
        );
        let guard = Arc::new(OutputGuard::new(model, 2));
        let config = RepositoryConfig {
            root: root.to_path_buf(),
            ..RepositoryConfig::default()
        };
        let extractor = Arc::new(EvidenceExtractor::new(&config).unwrap());
        let embedder = HashingEmbedder::new(64);
        let index = SimilarityIndex::build(vec![known_record()], embedder.as_ref()).await.unwrap();
        let dedup = Deduplicator::new(Arc::new(index), embedder, guard.clone(), 3);
        TriagePipeline::new(Adjudicator::new(guard.clone(), extractor, 2), Some(dedup), vec![guard], false)
    }

    #[tokio::test]
    async fn test_known_match_skips_adjudication() {
        let dir = repo();
        let filter = ScriptedModel::new(
            ModelFamily::OpenAi,
            [r#"{"equal_error_trace": [], "justifications": "identical calls", "result": "YES"}"#],
        );
        let analyze = ScriptedModel::new(ModelFamily::OpenAi, [r#"{"investigation_result": "TRUE POSITIVE"}"#]);
        let pipeline = pipeline(dir.path(), filter.clone(), analyze.clone()).await;

        let record = pipeline
            .triage(&Finding::new("def1", "RESOURCE_LEAK", "Error: RESOURCE_LEAK:\nsrc/a.c:3: leaked_storage p"))
            .await;
        assert_eq!(record.verdict.result, InvestigationResult::FalsePositive);
        assert!(record.known_issue.unwrap().is_match());
        assert_eq!(filter.calls(), 1);
        assert_eq!(analyze.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_scores_and_reports_usage() {
        let dir = repo();
        let filter = ScriptedModel::new(
            ModelFamily::OpenAi,
            [r#"{"equal_error_trace": [], "justifications": "different", "result": "NO"}"#],
        );
        let analyze = ScriptedModel::new(
            ModelFamily::OpenAi,
            [r#"{"investigation_result": "TRUE POSITIVE", "justifications": ["p is never freed"]}"#],
        );
        let pipeline = pipeline(dir.path(), filter.clone(), analyze.clone()).await;
        let findings = vec![
            Finding::new("def1", "RESOURCE_LEAK", "Error: RESOURCE_LEAK:\nsrc/a.c:3: leaked_storage p"),
            Finding::new("def2", "OVERRUN", "Error: OVERRUN:\nsrc/a.c:3: overrun"),
        ];
        let gt: RawGroundTruth = [("def1".to_string(), "no".to_string()), ("def2".to_string(), "yes".to_string())]
            .into_iter()
            .collect();

        let report = pipeline.run(&findings, Some(&gt)).await;
        assert_eq!(report.findings.len(), 2);
        // def2 has no known false positives of its type, so only def1 reaches the filter
        assert_eq!(filter.calls(), 1);
        assert_eq!(analyze.calls(), 2);
        assert!(report.findings[0].context.contains("** Example 1 **"));
        assert!(report.findings[1].context.contains("code of src/a.c file:"));
        assert_eq!(report.evaluation.matrix.tn, 1);
        assert_eq!(report.evaluation.matrix.fn_, 1);
        assert!(report.usage.total_tokens > 0);
        assert!(Uuid::parse_str(&report.run_id).is_ok());
    }

    #[test]
    fn test_critique_policy_decides_scored_result() {
        let mut verdict = Verdict::known_false_positive(&crate::known_issues::FilterResponse::no("x"));
        verdict.result = InvestigationResult::TruePositive;
        let record = TriageRecord {
            finding: Finding::new("def1", "OVERRUN", "a.c:1:"),
            verdict,
            critique: Some(CritiqueVerdict::failed(InvestigationResult::FalsePositive, "stub")),
            known_issue: None,
            evidence: EvidenceSet::new(),
            context: String::new(),
        };
        assert_eq!(record.scored(false).result, InvestigationResult::TruePositive);
        assert_eq!(record.scored(true).result, InvestigationResult::FalsePositive);
    }

    #[tokio::test]
    async fn test_malformed_knowledge_base_is_fatal() {
        let dir = repo();
        let kb = dir.path().join("known.txt");
        fs::write(&kb, "no error token here\nreason\n").unwrap();
        let mut config = Config::default();
        config.repository.root = dir.path().to_path_buf();
        config.triage.known_false_positives = Some(kb);
        let clients = ModelClients::from_parts(
            ScriptedModel::new(ModelFamily::OpenAi, ["{}"]),
            None,
            Some(HashingEmbedder::new(8)),
        );

        let err = TriagePipeline::build(&config, &clients).await.err().unwrap();
        assert!(format!("{:#}", err).contains("malformed"));
    }
}
