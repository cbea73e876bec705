//! In-memory similarity index over known false positives, partitioned by issue type.

use super::{KnowledgeBaseError, KnownFalsePositiveRecord};
use crate::llm::EmbeddingModel;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Cosine similarity between two vectors.
/// Returns 0.0 for mismatched, empty or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut mag_a, mut mag_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

struct Entry {
    record: KnownFalsePositiveRecord,
    vector: Vec<f32>,
}

/// A retrieved record and its similarity to the query.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub record: &'a KnownFalsePositiveRecord,
    pub score: f64,
}

/// Built once per run, then read-only.
#[derive(Default)]
pub struct SimilarityIndex {
    partitions: HashMap<String, Vec<Entry>>,
}

impl SimilarityIndex {
    /// Embed every record's trace and index it under its issue type.
    pub async fn build(
        records: Vec<KnownFalsePositiveRecord>,
        embedder: &dyn EmbeddingModel,
    ) -> Result<Self, KnowledgeBaseError> {
        if records.is_empty() {
            return Ok(Self::default());
        }
        let texts: Vec<String> = records.iter().map(|r| r.trace.clone()).collect();
        let vectors = embedder
            .embed(&texts)
            .await
            .map_err(KnowledgeBaseError::Embedding)?;
        if vectors.len() != records.len() {
            return Err(KnowledgeBaseError::Embedding(anyhow::anyhow!(
                "expected {} vectors, got {}",
                records.len(),
                vectors.len()
            )));
        }
        let index = Self::from_embedded(records.into_iter().zip(vectors));
        tracing::info!(
            records = index.len(),
            issue_types = index.partitions.len(),
            "Built known false positive index"
        );
        Ok(index)
    }

    pub fn from_embedded(items: impl IntoIterator<Item = (KnownFalsePositiveRecord, Vec<f32>)>) -> Self {
        let mut partitions: HashMap<String, Vec<Entry>> = HashMap::new();
        for (record, vector) in items {
            partitions
                .entry(record.issue_type.clone())
                .or_default()
                .push(Entry { record, vector });
        }
        Self { partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }

    /// Records indexed under `issue_type`.
    pub fn partition_len(&self, issue_type: &str) -> usize {
        self.partitions.get(issue_type).map_or(0, Vec::len)
    }

    /// The `k` most similar records of `issue_type`, best first. Ties keep
    /// corpus order.
    pub fn top_k(&self, issue_type: &str, query: &[f32], k: usize) -> Vec<Candidate<'_>> {
        let Some(entries) = self.partitions.get(issue_type) else {
            return Vec::new();
        };
        let mut scored: Vec<Candidate<'_>> = entries
            .iter()
            .map(|entry| Candidate {
                record: &entry.record,
                score: cosine_similarity(query, &entry.vector),
            })
            .collect();
        // Stable sort, so equal scores stay in insertion order
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::HashingEmbedder;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn record(issue_type: &str, trace: &str) -> KnownFalsePositiveRecord {
        KnownFalsePositiveRecord {
            trace: trace.to_string(),
            reason: format!("reason for {}", trace),
            issue_type: issue_type.to_string(),
        }
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_top_k_is_partitioned_and_ranked() {
        let index = SimilarityIndex::from_embedded(vec![
            (record("LEAK", "far"), vec![0.0, 1.0]),
            (record("LEAK", "near"), vec![1.0, 0.1]),
            (record("OVERRUN", "other type"), vec![1.0, 0.0]),
            (record("LEAK", "middle"), vec![1.0, 1.0]),
        ]);
        let top = index.top_k("LEAK", &[1.0, 0.0], 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].record.trace, "near");
        assert_eq!(top[1].record.trace, "middle");
        assert!(index.top_k("UNKNOWN", &[1.0, 0.0], 3).is_empty());
        assert_eq!(index.partition_len("LEAK"), 3);
    }

    #[test]
    fn test_ties_keep_corpus_order() {
        let index = SimilarityIndex::from_embedded(vec![
            (record("LEAK", "first"), vec![1.0, 0.0]),
            (record("LEAK", "second"), vec![1.0, 0.0]),
        ]);
        let top = index.top_k("LEAK", &[1.0, 0.0], 2);
        assert_eq!(top[0].record.trace, "first");
        assert_eq!(top[1].record.trace, "second");
    }

    #[tokio::test]
    async fn test_build_embeds_in_one_pass() {
        let embedder = HashingEmbedder::new(64);
        let index = SimilarityIndex::build(
            vec![record("LEAK", "src/a.c:1: leak"), record("OVERRUN", "src/b.c:2: overrun")],
            embedder.as_ref(),
        )
        .await
        .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(embedder.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_corpus_skips_embedding() {
        let embedder = HashingEmbedder::new(8);
        let index = SimilarityIndex::build(Vec::new(), embedder.as_ref()).await.unwrap();
        assert!(index.is_empty());
        assert_eq!(embedder.calls.load(AtomicOrdering::SeqCst), 0);
    }
}
