//! Embedding module - dense provider plus sparse encoder behind one interface
//!
//! ## Usage
//! ```rust,ignore
//! let embedder = Embedder::from_config(&config.embedding)?;
//! let query = embedder.embed_query("What does PayPal charge merchants?").await?;
//! ```
//!
//! The configured dimension is a system-wide constant: a provider returning
//! any other length is a configuration error, never a retry case.

pub mod hashing;
pub mod ollama;
pub mod sparse;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{RagError, RagResult};
use crate::knowledge::SparseVector;

pub use hashing::HashingEmbedding;
pub use ollama::OllamaEmbedding;
pub use sparse::SparseEncoder;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Dense embedding provider
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>>;

    /// Embed several texts (default: sequential calls)
    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;

    /// Reachability probe
    async fn health(&self) -> RagResult<()>;
}

// ============================================================================
// Embedder
// ============================================================================

/// Both query representations
#[derive(Debug, Clone)]
pub struct QueryEmbedding {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

/// Dense provider + sparse encoder with dimension enforcement
#[derive(Clone)]
pub struct Embedder {
    dense: Arc<dyn EmbeddingProvider>,
    sparse: SparseEncoder,
    dimension: usize,
    batch_size: usize,
}

impl Embedder {
    pub fn new(dense: Arc<dyn EmbeddingProvider>, dimension: usize) -> RagResult<Self> {
        if dense.dimension() != dimension {
            return Err(RagError::Configuration(format!(
                "provider {} produces {}-dim vectors, system dimension is {}",
                dense.name(),
                dense.dimension(),
                dimension
            )));
        }

        Ok(Self {
            dense,
            sparse: SparseEncoder::default(),
            dimension,
            batch_size: 32,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn from_config(config: &EmbeddingConfig) -> RagResult<Self> {
        let provider: Arc<dyn EmbeddingProvider> = match config.provider {
            EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedding::new(config)?),
            EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedding::new(config.dimension)),
        };

        tracing::info!(
            "Using {} embedding (dimension: {})",
            provider.name(),
            config.dimension
        );
        Ok(Self::new(provider, config.dimension)?.with_batch_size(config.batch_size))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn provider_name(&self) -> &str {
        self.dense.name()
    }

    fn check_dimension(&self, vector: &[f32]) -> RagResult<()> {
        if vector.len() != self.dimension {
            return Err(RagError::Configuration(format!(
                "{} returned a {}-dim vector, expected {}",
                self.dense.name(),
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Dense vector, L2-normalized
    pub async fn embed_dense(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vector = self.dense.embed(text).await?;
        self.check_dimension(&vector)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    /// Dense vectors for one provider call worth of texts
    pub async fn embed_dense_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut vectors = self.dense.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::dependency(
                "embedding",
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }
        for vector in &mut vectors {
            self.check_dimension(vector)?;
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    /// Document-side sparse vector
    pub fn embed_sparse(&self, text: &str) -> SparseVector {
        self.sparse.encode_document(text)
    }

    /// Query-side sparse vector
    pub fn embed_sparse_query(&self, text: &str) -> SparseVector {
        self.sparse.encode_query(text)
    }

    pub async fn embed_query(&self, text: &str) -> RagResult<QueryEmbedding> {
        Ok(QueryEmbedding {
            dense: self.embed_dense(text).await?,
            sparse: self.embed_sparse_query(text),
        })
    }

    pub async fn health(&self) -> RagResult<()> {
        self.dense.health().await
    }
}

/// Scale to unit length; zero vectors are left as is
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
