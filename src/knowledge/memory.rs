//! In-memory vector store
//!
//! Arena of records keyed by `chunk_id`. Used for offline runs, evaluation
//! and tests; nothing survives a restart.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RagResult;
use crate::knowledge::vector::{
    rank_dense, rank_sparse, Chunk, ChunkRecord, CompanySummary, RankedCandidates, ScoredId,
    SparseVector, VectorStore,
};

#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<HashMap<String, ChunkRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn in_scope(record: &ChunkRecord, filter: Option<&str>) -> bool {
    filter.map_or(true, |company| record.chunk.company == company)
}

fn collect_candidates(
    records: &HashMap<String, ChunkRecord>,
    ranked: Vec<ScoredId>,
) -> RankedCandidates {
    let chunks: HashMap<String, Chunk> = ranked
        .iter()
        .filter_map(|s| {
            records
                .get(&s.chunk_id)
                .map(|r| (s.chunk_id.clone(), r.chunk.clone()))
        })
        .collect();
    RankedCandidates { chunks, ranked }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: &[ChunkRecord]) -> RagResult<usize> {
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert(record.chunk.chunk_id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn query_dense(
        &self,
        dense: &[f32],
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates> {
        let guard = self.records.read().await;
        let ranked = rank_dense(
            dense,
            guard
                .values()
                .filter(|r| in_scope(r, filter))
                .map(|r| (r.chunk.chunk_id.as_str(), r.dense.as_slice())),
            top_k,
        );
        Ok(collect_candidates(&guard, ranked))
    }

    async fn query_sparse(
        &self,
        sparse: &SparseVector,
        filter: Option<&str>,
        top_k: usize,
    ) -> RagResult<RankedCandidates> {
        let guard = self.records.read().await;
        let ranked = rank_sparse(
            sparse,
            guard
                .values()
                .filter(|r| in_scope(r, filter))
                .map(|r| (r.chunk.chunk_id.as_str(), &r.sparse)),
            top_k,
        );
        Ok(collect_candidates(&guard, ranked))
    }

    async fn delete_by_company(&self, company: &str) -> RagResult<usize> {
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, r| r.chunk.company != company);
        Ok(before - guard.len())
    }

    async fn retain_company_chunks(
        &self,
        company: &str,
        keep: &HashSet<String>,
    ) -> RagResult<usize> {
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|id, r| r.chunk.company != company || keep.contains(id));
        Ok(before - guard.len())
    }

    async fn list_companies(&self) -> RagResult<Vec<CompanySummary>> {
        let guard = self.records.read().await;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in guard.values() {
            *counts.entry(record.chunk.company.as_str()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(company, chunks)| CompanySummary {
                company: company.to_string(),
                chunks,
            })
            .collect())
    }

    async fn chunk_ids(&self, company: &str) -> RagResult<Vec<String>> {
        let guard = self.records.read().await;
        let mut ids: Vec<String> = guard
            .values()
            .filter(|r| r.chunk.company == company)
            .map(|r| r.chunk.chunk_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> RagResult<usize> {
        Ok(self.records.read().await.len())
    }

    async fn health(&self) -> RagResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(id: &str, company: &str, dense: Vec<f32>, terms: &[u32]) -> ChunkRecord {
        ChunkRecord {
            chunk: Chunk {
                chunk_id: id.to_string(),
                document_id: format!("doc-{}", company),
                company: company.to_string(),
                url: format!("https://{}.test/{}", company, id),
                title: format!("{} page", company),
                text: format!("text of {}", id),
                position: 0,
                offset: 0,
            },
            dense,
            sparse: SparseVector::from_pairs(terms.iter().map(|t| (*t, 1.0))),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryVectorStore::new();
        let records = vec![
            record("a", "paypal", vec![1.0, 0.0], &[1]),
            record("b", "paypal", vec![0.0, 1.0], &[2]),
        ];
        store.upsert(&records).await.unwrap();
        store.upsert(&records).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_filter_applies_before_ranking() {
        let store = MemoryVectorStore::new();
        store
            .upsert(&[
                record("near", "airbnb", vec![1.0, 0.0], &[7]),
                record("far", "paypal", vec![0.0, 1.0], &[7]),
            ])
            .await
            .unwrap();

        let hits = store
            .query_hybrid(&[1.0, 0.0], &SparseVector::from_pairs([(7, 1.0)]), Some("paypal"), 1)
            .await
            .unwrap();

        assert_eq!(hits.dense.len(), 1);
        assert_eq!(hits.dense[0].chunk_id, "far");
        assert_eq!(hits.sparse[0].chunk_id, "far");
        assert!(hits.chunks.values().all(|c| c.company == "paypal"));
    }

    #[tokio::test]
    async fn test_delete_and_retain() {
        let store = MemoryVectorStore::new();
        store
            .upsert(&[
                record("a1", "airbnb", vec![1.0], &[1]),
                record("a2", "airbnb", vec![1.0], &[1]),
                record("f1", "figma", vec![1.0], &[1]),
            ])
            .await
            .unwrap();

        let keep: HashSet<String> = ["a1".to_string()].into_iter().collect();
        assert_eq!(store.retain_company_chunks("airbnb", &keep).await.unwrap(), 1);
        assert_eq!(store.chunk_ids("airbnb").await.unwrap(), vec!["a1".to_string()]);

        assert_eq!(store.delete_by_company("airbnb").await.unwrap(), 1);
        let companies = store.list_companies().await.unwrap();
        assert_eq!(
            companies,
            vec![CompanySummary {
                company: "figma".into(),
                chunks: 1
            }]
        );
    }
}
