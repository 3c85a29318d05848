//! Vector Store - hybrid (dense + sparse) store trait and shared scoring
//!
//! Records are keyed by `chunk_id`. Candidate chunks travel between
//! components as an arena (`chunk_id -> Chunk`) plus ranked id lists, so
//! fusion never clones or links chunk bodies.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RagResult;

// ============================================================================
// Types
// ============================================================================

/// Sparse term-weight vector, `indices` strictly ascending
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Build from unordered `(term, weight)` pairs, summing duplicates
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, f32)>) -> Self {
        let mut merged: Vec<(u32, f32)> = pairs.into_iter().collect();
        merged.sort_by_key(|(term, _)| *term);

        let mut indices: Vec<u32> = Vec::with_capacity(merged.len());
        let mut values: Vec<f32> = Vec::with_capacity(merged.len());
        for (term, weight) in merged {
            if indices.last() == Some(&term) {
                if let Some(last) = values.last_mut() {
                    *last += weight;
                }
            } else {
                indices.push(term);
                values.push(weight);
            }
        }

        Self { indices, values }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn weight(&self, term: u32) -> Option<f32> {
        self.indices
            .binary_search(&term)
            .ok()
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }
}

/// Stored passage payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub company: String,
    pub url: String,
    pub title: String,
    pub text: String,
    /// Order within the document (0-based)
    pub position: u32,
    /// Token offset of the chunk start within the document
    pub offset: u32,
}

/// Chunk plus both vector fields, as written to the store
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

/// Ranked reference into a candidate arena
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub chunk_id: String,
    pub score: f32,
}

/// Single-modality query result
#[derive(Debug, Clone, Default)]
pub struct RankedCandidates {
    pub chunks: HashMap<String, Chunk>,
    pub ranked: Vec<ScoredId>,
}

/// Hybrid query result: one arena, two ranked lists
#[derive(Debug, Clone, Default)]
pub struct HybridCandidates {
    pub chunks: HashMap<String, Chunk>,
    pub dense: Vec<ScoredId>,
    pub sparse: Vec<ScoredId>,
}

impl HybridCandidates {
    pub fn from_parts(dense: RankedCandidates, sparse: RankedCandidates) -> Self {
        let mut chunks = dense.chunks;
        chunks.extend(sparse.chunks);
        Self {
            chunks,
            dense: dense.ranked,
            sparse: sparse.ranked,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty() && self.sparse.is_empty()
    }
}

/// Company present in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanySummary {
    pub company: String,
    pub chunks: usize,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Hybrid vector store
///
/// `filter` is a normalized company key; it restricts candidates before
/// ranking so `top_k` is always drawn from the filtered set.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records by `chunk_id`
    async fn upsert(&self, records: &[ChunkRecord]) -> RagResult<usize>;

    /// Dense-only ranking (cosine similarity)
    async fn query_dense(
        &self,
        dense: &[f32],
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates>;

    /// Sparse-only ranking (BM25 over the filtered corpus)
    async fn query_sparse(
        &self,
        sparse: &SparseVector,
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates>;

    /// Both rankings; a failure in either sub-query fails the whole query
    async fn query_hybrid(
        &self,
        dense: &[f32],
        sparse: &SparseVector,
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<HybridCandidates> {
        let (dense, sparse) = tokio::try_join!(
            self.query_dense(dense, filter, top_k),
            self.query_sparse(sparse, filter, top_k),
        )?;
        Ok(HybridCandidates::from_parts(dense, sparse))
    }

    /// Remove every record of a company in one operation
    async fn delete_by_company(&self, company: &str) -> RagResult<usize>;

    /// Remove records of a company whose id is not in `keep`
    async fn retain_company_chunks(&self, company: &str, keep: &HashSet<String>)
        -> RagResult<usize>;

    /// Distinct companies with their record counts, sorted by name
    async fn list_companies(&self) -> RagResult<Vec<CompanySummary>>;

    /// Sorted chunk ids of a company
    async fn chunk_ids(&self, company: &str) -> RagResult<Vec<String>>;

    /// Total record count
    async fn count(&self) -> RagResult<usize>;

    /// Reachability probe
    async fn health(&self) -> RagResult<()>;

    /// Backend name
    fn name(&self) -> &'static str;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Cosine similarity in -1.0 ..= 1.0 (0.0 on length mismatch or zero norm)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Sort by descending score, ties broken by ascending `chunk_id`
pub fn sort_ranked(ranked: &mut [ScoredId]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Rank candidates by cosine similarity to `query`
pub fn rank_dense<'a>(
    query: &[f32],
    candidates: impl IntoIterator<Item = (&'a str, &'a [f32])>,
    top_k: usize,
) -> Vec<ScoredId> {
    let mut ranked: Vec<ScoredId> = candidates
        .into_iter()
        .map(|(chunk_id, dense)| ScoredId {
            chunk_id: chunk_id.to_string(),
            score: cosine_similarity(query, dense),
        })
        .collect();
    sort_ranked(&mut ranked);
    ranked.truncate(top_k);
    ranked
}

/// BM25 inverse document frequency
pub fn idf(total: usize, doc_freq: usize) -> f32 {
    let n = total as f32;
    let df = doc_freq as f32;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

/// Rank candidates by sparse dot product with IDF taken over the candidate set
///
/// Only candidates sharing at least one term with the query are returned.
pub fn rank_sparse<'a>(
    query: &SparseVector,
    candidates: impl IntoIterator<Item = (&'a str, &'a SparseVector)>,
    top_k: usize,
) -> Vec<ScoredId> {
    if query.is_empty() {
        return Vec::new();
    }

    let candidates: Vec<(&str, &SparseVector)> = candidates.into_iter().collect();
    let total = candidates.len();

    let mut doc_freq: HashMap<u32, usize> = HashMap::with_capacity(query.len());
    for (_, sparse) in &candidates {
        for term in &query.indices {
            if sparse.weight(*term).is_some() {
                *doc_freq.entry(*term).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<ScoredId> = candidates
        .iter()
        .filter_map(|(chunk_id, sparse)| {
            let score: f32 = query
                .iter()
                .filter_map(|(term, q_weight)| {
                    let d_weight = sparse.weight(term)?;
                    let df = doc_freq.get(&term).copied().unwrap_or(0);
                    Some(q_weight * d_weight * idf(total, df))
                })
                .sum();

            (score > 0.0).then(|| ScoredId {
                chunk_id: chunk_id.to_string(),
                score,
            })
        })
        .collect();

    sort_ranked(&mut ranked);
    ranked.truncate(top_k);
    ranked
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_empty() {
        let a: Vec<f32> = vec![];
        let b: Vec<f32> = vec![];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_sparse_from_pairs_sorts_and_merges() {
        let sparse = SparseVector::from_pairs(vec![(9, 1.0), (2, 0.5), (9, 0.25)]);
        assert_eq!(sparse.indices, vec![2, 9]);
        assert_eq!(sparse.values, vec![0.5, 1.25]);
        assert_eq!(sparse.weight(9), Some(1.25));
        assert_eq!(sparse.weight(3), None);
    }

    #[test]
    fn test_sort_ranked_breaks_ties_by_id() {
        let mut ranked = vec![
            ScoredId { chunk_id: "b".into(), score: 0.5 },
            ScoredId { chunk_id: "a".into(), score: 0.5 },
            ScoredId { chunk_id: "c".into(), score: 0.9 },
        ];
        sort_ranked(&mut ranked);
        let ids: Vec<&str> = ranked.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_dense_orders_by_similarity() {
        let a = vec![1.0, 0.0];
        let b = vec![0.6, 0.8];
        let c = vec![0.0, 1.0];
        let ranked = rank_dense(
            &[1.0, 0.0],
            vec![("c", c.as_slice()), ("a", a.as_slice()), ("b", b.as_slice())],
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk_id, "a");
        assert_eq!(ranked[1].chunk_id, "b");
    }

    #[test]
    fn test_rank_sparse_rare_terms_weigh_more() {
        // term 1 appears everywhere, term 2 only in "x"
        let x = SparseVector::from_pairs(vec![(1, 1.0), (2, 1.0)]);
        let y = SparseVector::from_pairs(vec![(1, 1.0)]);
        let z = SparseVector::from_pairs(vec![(1, 1.0), (3, 1.0)]);
        let query = SparseVector::from_pairs(vec![(1, 1.0), (2, 1.0)]);

        let ranked = rank_sparse(&query, vec![("y", &y), ("x", &x), ("z", &z)], 10);
        assert_eq!(ranked[0].chunk_id, "x");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_rank_sparse_drops_non_matching() {
        let x = SparseVector::from_pairs(vec![(1, 1.0)]);
        let y = SparseVector::from_pairs(vec![(5, 1.0)]);
        let query = SparseVector::from_pairs(vec![(1, 1.0)]);

        let ranked = rank_sparse(&query, vec![("x", &x), ("y", &y)], 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "x");
    }

    #[test]
    fn test_idf_decreases_with_frequency() {
        assert!(idf(10, 1) > idf(10, 5));
        assert!(idf(10, 10) > 0.0);
    }
}
