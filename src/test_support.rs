//! Deterministic doubles shared by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Notify;

use tempfile::TempDir;

use crate::config::Config;
use crate::embedding::{Embedder, HashingEmbedding};
use crate::error::{RagError, RagResult};
use crate::knowledge::{ChunkConfig, DocumentStore, MemoryVectorStore};
use crate::scraper::{CrawlOutcome, Crawler, FetchedPage};
use crate::service::AgentService;

/// In-memory crawler with optional injected transient failures
///
/// `hold` makes fetches block until `release`, keeping an ingest run active.
#[derive(Default)]
pub struct StaticCrawler {
    pages: Mutex<HashMap<String, Vec<FetchedPage>>>,
    failures_left: AtomicU32,
    calls: AtomicU32,
    held: AtomicBool,
    released: Notify,
    entered: Notify,
}

impl StaticCrawler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pages served for a company: `(url, title, markdown)`
    pub fn set_pages(&self, company: &str, pages: &[(&str, &str, &str)]) {
        let fetched_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let pages = pages
            .iter()
            .map(|(url, title, markdown)| FetchedPage {
                url: url.to_string(),
                title: title.to_string(),
                markdown: markdown.to_string(),
                fetched_at,
            })
            .collect();
        self.pages.lock().unwrap().insert(company.to_string(), pages);
    }

    /// Fail the next `n` fetches with a transient error
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Resolves once a fetch has started
    pub async fn wait_until_fetching(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl Crawler for StaticCrawler {
    async fn fetch(&self, company: &str) -> RagResult<CrawlOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        loop {
            let released = self.released.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(RagError::transient("crawler", "connection reset"));
        }

        let pages = self
            .pages
            .lock()
            .unwrap()
            .get(company)
            .cloned()
            .unwrap_or_default();
        Ok(CrawlOutcome {
            pages,
            errors: vec![],
        })
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

pub fn hashing_embedder(dimension: usize) -> Embedder {
    Embedder::new(Arc::new(HashingEmbedding::new(dimension)), dimension).unwrap()
}

/// Offline service rooted in `dir`: memory store, hashing embedder, static crawler
pub fn test_service(dir: &TempDir, crawler: Arc<StaticCrawler>) -> AgentService {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.embedding.dimension = 64;
    config.chunking = ChunkConfig::compact();
    config.jobs.initial_backoff_ms = 1;
    config.jobs.max_backoff_ms = 2;

    AgentService::with_components(
        &config,
        crawler,
        DocumentStore::open_in_memory().unwrap(),
        Arc::new(MemoryVectorStore::new()),
        hashing_embedder(64),
    )
}

/// `words` words of sentence-shaped filler mentioning `topic` regularly
pub fn prose(topic: &str, words: usize) -> String {
    const VOCAB: [&str; 12] = [
        "company", "customers", "revenue", "platform", "market", "growth", "product", "teams",
        "global", "service", "launched", "annual",
    ];

    let mut out = String::new();
    for i in 0..words {
        let word = if i % 5 == 0 { topic } else { VOCAB[(i * 7) % VOCAB.len()] };
        out.push_str(word);
        if i % 12 == 11 {
            out.push_str(". ");
        } else {
            out.push(' ');
        }
    }
    out.trim_end().to_string()
}
