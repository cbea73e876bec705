//! Run output: the JSON result file and the terminal conclusion.

use crate::evaluation::EvaluationSummary;
use crate::pipeline::RunReport;
use anyhow::Context;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

pub fn write_report_json<T: Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory '{}'", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report '{}'", path.display()))?;
    Ok(())
}

fn table(title: &str, header: (&str, &str), rows: &[(String, String)]) -> String {
    let left = rows
        .iter()
        .map(|(k, _)| k.chars().count())
        .chain(std::iter::once(header.0.chars().count()))
        .max()
        .unwrap_or(0);
    let right = rows
        .iter()
        .map(|(_, v)| v.chars().count())
        .chain(std::iter::once(header.1.chars().count()))
        .max()
        .unwrap_or(0);
    let rule = format!("+-{}-+-{}-+", "-".repeat(left), "-".repeat(right));

    let mut out = String::new();
    let _ = writeln!(out, "\n--- {} ---", title);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "| {:<left$} | {:<right$} |", header.0, header.1);
    let _ = writeln!(out, "{}", rule);
    for (k, v) in rows {
        let _ = writeln!(out, "| {:<left$} | {:>right$} |", k, v);
    }
    let _ = writeln!(out, "{}", rule);
    out
}

/// The confusion-matrix and performance tables plus the excluded ids.
pub fn render_conclusion(summary: &EvaluationSummary) -> String {
    let mut out = String::new();
    if !summary.excluded.is_empty() {
        let _ = writeln!(
            out,
            "\nNOTE: failed findings excluded from evaluation: {}",
            summary.excluded.join(", ")
        );
    }
    if !summary.unlabeled.is_empty() {
        let _ = writeln!(
            out,
            "NOTE: findings without a ground truth label: {}",
            summary.unlabeled.join(", ")
        );
    }

    let _ = writeln!(
        out,
        "\nPredicted false positives: {}  Predicted true positives: {}",
        summary.predicted_false_positives, summary.predicted_true_positives
    );

    let Some(metrics) = summary.metrics else {
        out.push_str("No ground truth supplied; metrics were not calculated.\n");
        return out;
    };
    let m = &summary.matrix;
    out.push_str(&table(
        "Confusion Matrix",
        ("Metric", "Value"),
        &[
            ("TP (human and model: not a real issue)".to_string(), m.tp.to_string()),
            ("FP (model wrongly: not a real issue)".to_string(), m.fp.to_string()),
            ("TN (human and model: real issue)".to_string(), m.tn.to_string()),
            ("FN (model wrongly: real issue)".to_string(), m.fn_.to_string()),
        ],
    ));
    out.push_str(&table(
        "Model Performance",
        ("Metric", "Value"),
        &[
            ("Accuracy".to_string(), format!("{:.3}", metrics.accuracy)),
            ("Recall".to_string(), format!("{:.3}", metrics.recall)),
            ("Precision".to_string(), format!("{:.3}", metrics.precision)),
            ("F1 Score".to_string(), format!("{:.3}", metrics.f1)),
        ],
    ));
    out
}

/// One line per finding: id, result, and the short justification.
pub fn render_verdicts(report: &RunReport) -> String {
    let mut out = String::new();
    for record in &report.findings {
        let marker = if record.verdict.fallback { " (fallback)" } else { "" };
        let _ = writeln!(
            out,
            "{:<10} {:<15}{} {}",
            record.finding.id, record.verdict.result, marker, record.verdict.short_justification
        );
    }
    out
}

/// Print the run summary to `out`, then write the JSON report. The summary is
/// printed even when the report cannot be written.
pub fn publish(report: &RunReport, path: &Path, out: &mut impl std::io::Write) -> anyhow::Result<()> {
    write!(
        out,
        "{}{}\nRun ID: {}\n",
        render_verdicts(report),
        render_conclusion(&report.evaluation),
        report.run_id
    )?;
    write_report_json(path, report)?;
    writeln!(out, "Report: {}", path.display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{ConfusionMatrix, Metrics};
    use crate::llm::models::Usage;

    fn empty_run(evaluation: EvaluationSummary) -> RunReport {
        let now = chrono::Utc::now();
        RunReport {
            run_id: "run-1".to_string(),
            started_at: now,
            finished_at: now,
            use_critique_as_final: false,
            usage: Usage::default(),
            findings: Vec::new(),
            evaluation,
        }
    }

    #[test]
    fn test_conclusion_printed_when_report_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let report = empty_run(EvaluationSummary {
            excluded: vec!["def3".to_string()],
            ..EvaluationSummary::default()
        });

        let mut out = Vec::new();
        let result = publish(&report, &blocker.join("run.json"), &mut out);
        let printed = String::from_utf8(out).unwrap();
        assert!(result.is_err());
        assert!(printed.contains("excluded from evaluation: def3"));
        assert!(printed.contains("Run ID: run-1"));
        assert!(!printed.contains("Report:"));
    }

    #[test]
    fn test_publish_writes_report_after_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut out = Vec::new();
        publish(&empty_run(EvaluationSummary::default()), &path, &mut out).unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("metrics were not calculated"));
        assert!(printed.ends_with(&format!("Report: {}\n", path.display())));
        assert!(path.is_file());
    }

    #[test]
    fn test_conclusion_lists_excluded_and_metrics() {
        let matrix = ConfusionMatrix { tp: 1, tn: 2, fp: 0, fn_: 1 };
        let summary = EvaluationSummary {
            matrix,
            metrics: Some(Metrics::from_matrix(&matrix)),
            predicted_false_positives: 1,
            predicted_true_positives: 3,
            excluded: vec!["def7".to_string()],
            unlabeled: Vec::new(),
        };
        let text = render_conclusion(&summary);
        assert!(text.contains("excluded from evaluation: def7"));
        assert!(text.contains("| Accuracy "));
        assert!(text.contains("0.750"));
        assert!(text.contains("--- Confusion Matrix ---"));
    }

    #[test]
    fn test_conclusion_without_ground_truth() {
        let text = render_conclusion(&EvaluationSummary::default());
        assert!(text.contains("metrics were not calculated"));
        assert!(!text.contains("Confusion Matrix"));
    }

    #[test]
    fn test_report_written_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/run.json");
        write_report_json(&path, &EvaluationSummary::default()).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["matrix"]["fn"], 0);
        assert!(written["metrics"].is_null());
    }
}
