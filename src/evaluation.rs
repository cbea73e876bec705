//! Scoring verdicts against human labels.
//!
//! "Positive" means *classified as a false alarm*. Counts use set semantics
//! over finding ids, restricted to the findings of this run that carry a
//! recognized label and a non-fallback verdict.

use crate::adjudicate::InvestigationResult;
use crate::finding::{GroundTruthLabel, RawGroundTruth};
use serde::Serialize;
use std::collections::BTreeSet;

/// Keeps every ratio defined when its denominator is zero.
pub const EPSILON: f64 = 1e-11;

/// One finding's scored outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredVerdict {
    pub id: String,
    pub result: InvestigationResult,
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
}

impl Metrics {
    pub fn from_matrix(m: &ConfusionMatrix) -> Self {
        let (tp, tn, fp, fn_) = (m.tp as f64, m.tn as f64, m.fp as f64, m.fn_ as f64);
        let accuracy = (tp + tn) / (tp + tn + fp + fn_ + EPSILON);
        let recall = tp / (tp + fn_ + EPSILON);
        let precision = tp / (tp + fp + EPSILON);
        let f1 = 2.0 * precision * recall / (precision + recall + EPSILON);
        Self {
            accuracy,
            recall,
            precision,
            f1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub matrix: ConfusionMatrix,
    /// `None` when no ground truth was supplied
    pub metrics: Option<Metrics>,
    pub predicted_false_positives: usize,
    pub predicted_true_positives: usize,
    /// Findings with a fallback verdict, left out of every count
    pub excluded: Vec<String>,
    /// Findings without a recognized label
    pub unlabeled: Vec<String>,
}

impl EvaluationSummary {
    pub fn compute(verdicts: &[ScoredVerdict], ground_truth: Option<&RawGroundTruth>) -> Self {
        let mut summary = EvaluationSummary::default();
        let mut actual_tp = BTreeSet::new();
        let mut actual_fp = BTreeSet::new();
        let mut predicted_tp = BTreeSet::new();
        let mut predicted_fp = BTreeSet::new();

        for verdict in verdicts {
            if verdict.fallback {
                summary.excluded.push(verdict.id.clone());
                continue;
            }
            match verdict.result {
                InvestigationResult::TruePositive => summary.predicted_true_positives += 1,
                InvestigationResult::FalsePositive => summary.predicted_false_positives += 1,
            }
            let Some(ground_truth) = ground_truth else {
                continue;
            };
            let label = match ground_truth.get(&verdict.id) {
                Some(raw) => match GroundTruthLabel::parse(raw) {
                    Some(label) => label,
                    None => {
                        tracing::warn!(finding = %verdict.id, "Unrecognized ground truth label '{}'", raw);
                        summary.unlabeled.push(verdict.id.clone());
                        continue;
                    }
                },
                None => {
                    summary.unlabeled.push(verdict.id.clone());
                    continue;
                }
            };
            match label {
                GroundTruthLabel::RealIssue => actual_tp.insert(verdict.id.as_str()),
                GroundTruthLabel::FalsePositive => actual_fp.insert(verdict.id.as_str()),
            };
            match verdict.result {
                InvestigationResult::TruePositive => predicted_tp.insert(verdict.id.as_str()),
                InvestigationResult::FalsePositive => predicted_fp.insert(verdict.id.as_str()),
            };
        }

        if ground_truth.is_none() {
            tracing::info!("No ground truth supplied; skipping metrics");
            return summary;
        }

        summary.matrix = ConfusionMatrix {
            tp: actual_fp.intersection(&predicted_fp).count(),
            tn: actual_tp.intersection(&predicted_tp).count(),
            fp: actual_tp.difference(&predicted_tp).count(),
            fn_: predicted_tp.difference(&actual_tp).count(),
        };
        summary.metrics = Some(Metrics::from_matrix(&summary.matrix));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(id: &str, result: InvestigationResult) -> ScoredVerdict {
        ScoredVerdict {
            id: id.to_string(),
            result,
            fallback: false,
        }
    }

    fn truth(pairs: &[(&str, &str)]) -> RawGroundTruth {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_four_finding_scenario() {
        use InvestigationResult::*;
        let verdicts = vec![
            scored("def1", TruePositive),
            scored("def2", FalsePositive),
            scored("def3", TruePositive),
            scored("def4", TruePositive),
        ];
        let gt = truth(&[("def1", "no"), ("def2", "yes"), ("def3", "yes"), ("def4", "no")]);
        let summary = EvaluationSummary::compute(&verdicts, Some(&gt));
        assert_eq!(summary.matrix, ConfusionMatrix { tp: 1, tn: 2, fp: 0, fn_: 1 });
        let metrics = summary.metrics.unwrap();
        assert!((metrics.accuracy - 0.75).abs() < 1e-6);
        assert!((metrics.recall - 0.5).abs() < 1e-6);
        assert!((metrics.precision - 1.0).abs() < 1e-6);
        assert!((metrics.f1 - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_zero_counts_stay_in_range() {
        let metrics = Metrics::from_matrix(&ConfusionMatrix::default());
        for value in [metrics.accuracy, metrics.recall, metrics.precision, metrics.f1] {
            assert!(value.is_finite());
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_metrics_bounded_for_any_counts() {
        for tp in 0..4 {
            for tn in 0..4 {
                for fp in 0..4 {
                    for fn_ in 0..4 {
                        let m = Metrics::from_matrix(&ConfusionMatrix { tp, tn, fp, fn_ });
                        for value in [m.accuracy, m.recall, m.precision, m.f1] {
                            assert!((0.0..=1.0).contains(&value), "{:?}", (tp, tn, fp, fn_));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_counts_bounded_by_actual_sets() {
        use InvestigationResult::*;
        let verdicts = vec![
            scored("a", FalsePositive),
            scored("b", FalsePositive),
            scored("c", TruePositive),
            scored("d", FalsePositive),
        ];
        let gt = truth(&[("a", "fp"), ("b", "real"), ("c", "real"), ("d", "real")]);
        let summary = EvaluationSummary::compute(&verdicts, Some(&gt));
        assert!(summary.matrix.tp <= 1);
        assert!(summary.matrix.tn <= 3);
        assert_eq!(summary.matrix.fp, 2);
        assert_eq!(summary.matrix.total(), 4);
    }

    #[test]
    fn test_fallbacks_and_unlabeled_are_listed_not_scored() {
        use InvestigationResult::*;
        let mut failed = scored("def2", TruePositive);
        failed.fallback = true;
        let verdicts = vec![
            scored("def1", TruePositive),
            failed,
            scored("def3", FalsePositive),
            scored("def4", FalsePositive),
        ];
        let gt = truth(&[("def1", "no"), ("def2", "yes"), ("def3", "maybe")]);
        let summary = EvaluationSummary::compute(&verdicts, Some(&gt));
        assert_eq!(summary.excluded, vec!["def2"]);
        assert_eq!(summary.unlabeled, vec!["def3", "def4"]);
        assert_eq!(summary.matrix, ConfusionMatrix { tp: 0, tn: 1, fp: 0, fn_: 0 });
        assert_eq!(summary.predicted_false_positives, 2);
    }

    #[test]
    fn test_no_ground_truth_skips_metrics() {
        let verdicts = vec![scored("def1", InvestigationResult::FalsePositive)];
        let summary = EvaluationSummary::compute(&verdicts, None);
        assert!(summary.metrics.is_none());
        assert!(summary.unlabeled.is_empty());
        assert_eq!(summary.predicted_false_positives, 1);
    }
}
