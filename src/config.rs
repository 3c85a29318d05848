//! Service configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every section has defaults so an empty file (or no file) yields
//! a working local setup.
//!
//! ```toml
//! data_dir = "/var/lib/company-intel"
//!
//! [embedding]
//! provider = "ollama"
//! base_url = "http://localhost:11434"
//! model = "nomic-embed-text"
//! dimension = 768
//!
//! [store]
//! backend = "lance"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{RagError, RagResult};
use crate::knowledge::ChunkConfig;

/// Default data directory (`<local data dir>/company-intel`)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("company-intel")
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub crawler: CrawlerConfig,
    pub jobs: JobConfig,
    pub eval: EvalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            store: StoreConfig::default(),
            chunking: ChunkConfig::default(),
            retrieval: RetrievalConfig::default(),
            crawler: CrawlerConfig::default(),
            jobs: JobConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Deadline for synchronous retrieval requests
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Ollama,
    Hashing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub model: String,
    /// System-wide dense dimension; provider output must match exactly
    pub dimension: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            batch_size: 32,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Lance,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub upsert_batch_size: usize,
    /// Upsert batches in flight at once
    pub upsert_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Lance,
            upsert_batch_size: 64,
            upsert_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Candidate fan-out per modality is `top_k * fanout_factor`
    pub fanout_factor: usize,
    pub rrf_k: f32,
    /// Token budget for context handed to generation
    pub context_budget_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            fanout_factor: 2,
            rrf_k: 60.0,
            context_budget_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Seed URL templates; `{company}` and `{Company}` are substituted
    pub seed_urls: Vec<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            seed_urls: vec!["https://en.wikipedia.org/wiki/{Company}".to_string()],
            user_agent: concat!("company-intel/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per dependency call
    pub call_timeout_secs: u64,
    /// Overall wall-clock limit per job; unset means unbounded
    pub job_timeout_secs: Option<u64>,
    /// How long a deletion waits for a cancelled job to wind down; the
    /// default outlasts one fully retried dependency call
    pub cancel_grace_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            call_timeout_secs: 60,
            job_timeout_secs: None,
            cancel_grace_secs: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Defaults to `<data_dir>/golden` when unset
    pub dataset_dir: Option<PathBuf>,
    /// Defaults to `dataset_dir` when unset
    pub corpus_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/eval` when unset
    pub report_dir: Option<PathBuf>,
    pub top_k: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            dataset_dir: None,
            corpus_dir: None,
            report_dir: None,
            top_k: 5,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Load from an optional TOML file, apply env overrides and validate
    pub fn load(path: Option<&Path>) -> RagResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    RagError::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> RagResult<Self> {
        toml::from_str(raw).map_err(|e| RagError::Configuration(format!("invalid config: {}", e)))
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`)
    pub fn apply_env<F>(&mut self, lookup: F) -> RagResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.embedding.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("EMBED_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dim) = get("EMBED_DIMENSION") {
            self.embedding.dimension = dim.parse().map_err(|_| {
                RagError::Configuration(format!("EMBED_DIMENSION must be an integer, got '{}'", dim))
            })?;
        }
        if let Some(bind) = get("RAG_BIND") {
            self.server.bind = bind;
        }
        if let Some(backend) = get("RAG_STORE_BACKEND") {
            self.store.backend = match backend.to_lowercase().as_str() {
                "lance" => StoreBackend::Lance,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(RagError::Configuration(format!(
                        "unknown store backend '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(provider) = get("RAG_EMBEDDING_PROVIDER") {
            self.embedding.provider = match provider.to_lowercase().as_str() {
                "ollama" => EmbeddingProviderKind::Ollama,
                "hashing" => EmbeddingProviderKind::Hashing,
                other => {
                    return Err(RagError::Configuration(format!(
                        "unknown embedding provider '{}'",
                        other
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> RagResult<()> {
        self.chunking.validate()?;

        if self.embedding.dimension == 0 {
            return Err(RagError::Configuration("embedding.dimension must be > 0".into()));
        }
        if self.embedding.batch_size == 0 || self.store.upsert_batch_size == 0 {
            return Err(RagError::Configuration("batch sizes must be > 0".into()));
        }
        if self.store.upsert_concurrency == 0 {
            return Err(RagError::Configuration("store.upsert_concurrency must be > 0".into()));
        }
        if self.retrieval.top_k == 0 || self.retrieval.fanout_factor == 0 {
            return Err(RagError::Configuration(
                "retrieval.top_k and retrieval.fanout_factor must be > 0".into(),
            ));
        }
        if self.retrieval.rrf_k <= 0.0 {
            return Err(RagError::Configuration("retrieval.rrf_k must be positive".into()));
        }
        if self.jobs.max_attempts == 0 {
            return Err(RagError::Configuration("jobs.max_attempts must be >= 1".into()));
        }
        if self.eval.top_k == 0 {
            return Err(RagError::Configuration("eval.top_k must be > 0".into()));
        }
        Ok(())
    }

    // Derived paths

    pub fn documents_db_path(&self) -> PathBuf {
        self.data_dir.join("documents.db")
    }

    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }

    /// Raw snapshot root (`<data_dir>/companies`)
    pub fn raw_root(&self) -> PathBuf {
        self.data_dir.join("companies")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.eval
            .dataset_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("golden"))
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.eval.corpus_dir.clone().unwrap_or_else(|| self.dataset_dir())
    }

    pub fn report_dir(&self) -> PathBuf {
        self.eval
            .report_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("eval"))
    }
}
