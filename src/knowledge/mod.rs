//! Knowledge module - hybrid RAG storage and retrieval
//!
//! - SQLite: fetched documents, keyed by `(company, url)`
//! - LanceDB / memory: chunk records with dense + sparse vectors
//! - Hybrid: RRF fusion of dense and sparse rankings
//! - Chunker: markdown-aware passage splitting

mod chunker;
mod hybrid;
mod lance;
mod memory;
mod store;
mod vector;

use std::path::Path;
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::RagResult;

// Re-exports
pub use chunker::{
    chunk_document, chunk_id, count_tokens, ChunkConfig, Chunker, MarkdownChunker, TextChunk,
};
pub use hybrid::{
    apply_context_budget, rrf_fuse, Citation, FusedId, RetrievalEngine, RetrievalResult,
    RetrievedChunk, SearchMethod,
};
pub use lance::LanceVectorStore;
pub use memory::MemoryVectorStore;
pub use store::{
    content_hash, document_id, Document, DocumentStore, DocumentWrite, StoreStats,
};
pub use vector::{
    cosine_similarity, rank_dense, rank_sparse, Chunk, ChunkRecord, CompanySummary,
    HybridCandidates, RankedCandidates, ScoredId, SparseVector, VectorStore,
};

/// Open the configured vector store backend
pub async fn open_vector_store(
    config: &StoreConfig,
    lance_path: &Path,
    dimension: usize,
) -> RagResult<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.backend {
        StoreBackend::Lance => Arc::new(LanceVectorStore::open(lance_path, dimension).await?),
        StoreBackend::Memory => Arc::new(MemoryVectorStore::new()),
    };
    tracing::info!("Vector store: {}", store.name());
    Ok(store)
}
