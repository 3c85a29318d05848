//! Retrieval Engine - hybrid search with Reciprocal Rank Fusion
//!
//! The query is embedded both ways, one hybrid store query returns a
//! dense-ranked and a sparse-ranked candidate list (each `top_k *
//! fanout_factor` long), and the lists are fused with RRF.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::company::normalize_company;
use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};

use super::chunker::count_tokens;
use super::vector::{Chunk, ScoredId, VectorStore};

// ============================================================================
// Types
// ============================================================================

/// Search modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// Dense + sparse fused with RRF
    #[default]
    Hybrid,
    /// Dense similarity only
    Dense,
    /// Sparse (BM25) only
    Sparse,
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hybrid => "hybrid",
            Self::Dense => "dense",
            Self::Sparse => "sparse",
        };
        f.write_str(name)
    }
}

impl FromStr for SearchMethod {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "dense" | "vector" => Ok(Self::Dense),
            "sparse" | "bm25" => Ok(Self::Sparse),
            other => Err(RagError::Validation(format!("unknown search method '{}'", other))),
        }
    }
}

/// Ranked chunk with source attribution
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Fused RRF score (hybrid) or the single-modality score
    pub score: f32,
    /// 1-based rank in the dense list, if present
    pub dense_rank: Option<usize>,
    /// 1-based rank in the sparse list, if present
    pub sparse_rank: Option<usize>,
}

/// Source reference for a generated answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

/// Ranked, cited context for one query
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub company: Option<String>,
    pub method: SearchMethod,
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Distinct sources in rank order
    pub fn citations(&self) -> Vec<Citation> {
        let mut seen = std::collections::HashSet::new();
        self.hits
            .iter()
            .filter(|h| seen.insert(h.chunk.url.clone()))
            .map(|h| Citation {
                url: h.chunk.url.clone(),
                title: h.chunk.title.clone(),
            })
            .collect()
    }

    /// Retrieved passages joined for a generation prompt
    pub fn context_text(&self) -> String {
        self.hits
            .iter()
            .map(|h| h.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// One entry of a fused ranking
#[derive(Debug, Clone, PartialEq)]
pub struct FusedId {
    pub chunk_id: String,
    pub score: f32,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
}

impl FusedId {
    fn best_rank(&self) -> usize {
        match (self.dense_rank, self.sparse_rank) {
            (Some(d), Some(s)) => d.min(s),
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => usize::MAX,
        }
    }
}

// ============================================================================
// Rank Fusion
// ============================================================================

/// Reciprocal Rank Fusion
///
/// score = sum of `1 / (k + rank)` over the lists a chunk appears in (ranks
/// 1-based). Sorted by descending score, then best original rank, then
/// `chunk_id`; truncated to `limit`.
pub fn rrf_fuse(dense: &[ScoredId], sparse: &[ScoredId], k: f32, limit: usize) -> Vec<FusedId> {
    let mut fused: HashMap<&str, FusedId> = HashMap::new();

    for (i, hit) in dense.iter().enumerate() {
        let entry = fused.entry(hit.chunk_id.as_str()).or_insert_with(|| FusedId {
            chunk_id: hit.chunk_id.clone(),
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
        });
        entry.score += 1.0 / (k + (i + 1) as f32);
        entry.dense_rank = Some(i + 1);
    }

    for (i, hit) in sparse.iter().enumerate() {
        let entry = fused.entry(hit.chunk_id.as_str()).or_insert_with(|| FusedId {
            chunk_id: hit.chunk_id.clone(),
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
        });
        entry.score += 1.0 / (k + (i + 1) as f32);
        entry.sparse_rank = Some(i + 1);
    }

    let mut ranked: Vec<FusedId> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    ranked.truncate(limit);
    ranked
}

/// Keep hits in rank order until the next one would exceed `budget_tokens`
pub fn apply_context_budget(hits: Vec<RetrievedChunk>, budget_tokens: usize) -> Vec<RetrievedChunk> {
    let mut used = 0;
    let mut kept = Vec::with_capacity(hits.len());

    for hit in hits {
        let tokens = count_tokens(&hit.chunk.text);
        if used + tokens > budget_tokens {
            break;
        }
        used += tokens;
        kept.push(hit);
    }

    kept
}

// ============================================================================
// RetrievalEngine
// ============================================================================

#[derive(Clone)]
pub struct RetrievalEngine {
    embedder: Embedder,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(embedder: Embedder, store: Arc<dyn VectorStore>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Hybrid retrieval; an unmatched filter yields an empty result
    pub async fn retrieve(
        &self,
        query: &str,
        company: Option<&str>,
        top_k: usize,
    ) -> RagResult<RetrievalResult> {
        self.retrieve_with(query, company, top_k, SearchMethod::Hybrid)
            .await
    }

    /// Retrieval with an explicit modality
    pub async fn retrieve_with(
        &self,
        query: &str,
        company: Option<&str>,
        top_k: usize,
        method: SearchMethod,
    ) -> RagResult<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::Validation("query must not be empty".into()));
        }
        if top_k == 0 {
            return Err(RagError::Validation("top_k must be at least 1".into()));
        }

        let company = company.map(normalize_company).transpose()?;
        let filter = company.as_deref();

        let hits = match method {
            SearchMethod::Hybrid => self.hybrid(query, filter, top_k).await?,
            SearchMethod::Dense => {
                let dense = self.embedder.embed_dense(query).await?;
                let found = self.store.query_dense(&dense, filter, top_k).await?;
                single_modality(found.chunks, found.ranked, true)
            }
            SearchMethod::Sparse => {
                let sparse = self.embedder.embed_sparse_query(query);
                let found = self.store.query_sparse(&sparse, filter, top_k).await?;
                single_modality(found.chunks, found.ranked, false)
            }
        };

        tracing::debug!(
            "Retrieved {} chunks for '{}' (company={:?}, method={})",
            hits.len(),
            query,
            filter,
            method
        );

        Ok(RetrievalResult {
            query: query.to_string(),
            company,
            method,
            hits,
        })
    }

    /// Hybrid retrieval packed into the configured context budget
    pub async fn retrieve_context(
        &self,
        query: &str,
        company: Option<&str>,
        top_k: usize,
    ) -> RagResult<RetrievalResult> {
        let mut result = self.retrieve(query, company, top_k).await?;
        result.hits = apply_context_budget(result.hits, self.config.context_budget_tokens);
        Ok(result)
    }

    async fn hybrid(
        &self,
        query: &str,
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<Vec<RetrievedChunk>> {
        let embedded = self.embedder.embed_query(query).await?;
        let fanout = top_k.saturating_mul(self.config.fanout_factor.max(1));

        let mut candidates = self
            .store
            .query_hybrid(&embedded.dense, &embedded.sparse, filter, fanout)
            .await?;

        let fused = rrf_fuse(&candidates.dense, &candidates.sparse, self.config.rrf_k, top_k);

        Ok(fused
            .into_iter()
            .filter_map(|f| {
                candidates.chunks.remove(&f.chunk_id).map(|chunk| RetrievedChunk {
                    chunk,
                    score: f.score,
                    dense_rank: f.dense_rank,
                    sparse_rank: f.sparse_rank,
                })
            })
            .collect())
    }
}

fn single_modality(
    mut chunks: HashMap<String, Chunk>,
    ranked: Vec<ScoredId>,
    dense: bool,
) -> Vec<RetrievedChunk> {
    ranked
        .into_iter()
        .enumerate()
        .filter_map(|(i, hit)| {
            chunks.remove(&hit.chunk_id).map(|chunk| RetrievedChunk {
                chunk,
                score: hit.score,
                dense_rank: dense.then_some(i + 1),
                sparse_rank: (!dense).then_some(i + 1),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
