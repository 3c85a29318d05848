//! company-intel - company intelligence RAG service
//!
//! Crawls public pages about a company, chunks and embeds them, and serves
//! hybrid (dense + BM25, RRF-fused) search over the result to an agent over HTTP.

pub mod cli;
pub mod company;
pub mod config;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod ingest;
pub mod jobs;
pub mod knowledge;
pub mod retry;
pub mod scraper;
pub mod server;
pub mod service;

#[cfg(test)]
mod test_support;

// Re-exports
pub use company::normalize_company;
pub use config::Config;
pub use embedding::{Embedder, EmbeddingProvider, HashingEmbedding, OllamaEmbedding};
pub use error::{RagError, RagResult};
pub use eval::{Dataset, EvalHarness, EvalOutput, Metrics};
pub use ingest::{IngestReport, IngestionPipeline};
pub use jobs::{JobContext, JobKind, JobManager, JobRecord, JobState, Submission};
pub use knowledge::{
    ChunkConfig, Chunker, DocumentStore, LanceVectorStore, MarkdownChunker, MemoryVectorStore,
    RetrievalEngine, RetrievalResult, SearchMethod, VectorStore,
};
pub use scraper::{Crawler, LocalCorpus, WebScraper};
pub use service::AgentService;
