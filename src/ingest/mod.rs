//! Ingestion pipeline - fetch -> clean -> chunk -> embed -> store
//!
//! One run handles one company. Dependency calls (crawler, embedding
//! provider, vector store) go through the [`RetryPolicy`]; cancellation is
//! checked between stages and interrupts in-flight dependency calls. A failed run is discarded as a whole: upserts are
//! idempotent by `chunk_id`, so a retried run simply overwrites.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::company::normalize_company;
use crate::embedding::Embedder;
use crate::error::RagResult;
use crate::jobs::JobContext;
use crate::knowledge::{
    chunk_document, Chunk, ChunkRecord, Chunker, Document, DocumentStore, DocumentWrite,
    VectorStore,
};
use crate::retry::RetryPolicy;
use crate::scraper::{clean_text, Crawler, LocalCorpus};

/// Summary of one ingestion run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub company: String,
    pub documents_fetched: usize,
    /// Documents that survived cleaning
    pub documents_kept: usize,
    /// Inserted or replaced (content hash changed)
    pub documents_changed: usize,
    pub chunks_produced: usize,
    pub vectors_stored: usize,
    pub vectors_pruned: usize,
    pub documents_pruned: usize,
    /// Per-page fetch failures that did not abort the run
    pub fetch_errors: Vec<String>,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    crawler: Arc<dyn Crawler>,
    documents: DocumentStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Embedder,
    chunker: Arc<dyn Chunker>,
    retry: RetryPolicy,
    upsert_batch_size: usize,
    upsert_concurrency: usize,
    snapshots: Option<LocalCorpus>,
}

impl IngestionPipeline {
    pub fn new(
        crawler: Arc<dyn Crawler>,
        documents: DocumentStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Embedder,
        chunker: Arc<dyn Chunker>,
    ) -> Self {
        Self {
            crawler,
            documents,
            vectors,
            embedder,
            chunker,
            retry: RetryPolicy::default(),
            upsert_batch_size: 64,
            upsert_concurrency: 4,
            snapshots: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_upserts(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.upsert_batch_size = batch_size.max(1);
        self.upsert_concurrency = concurrency.max(1);
        self
    }

    /// Persist fetched pages as raw snapshots
    pub fn with_snapshots(mut self, corpus: LocalCorpus) -> Self {
        self.snapshots = Some(corpus);
        self
    }

    /// Same pipeline, different page source
    pub fn with_crawler(&self, crawler: Arc<dyn Crawler>) -> Self {
        Self {
            crawler,
            ..self.clone()
        }
    }

    pub fn crawler_name(&self) -> &'static str {
        self.crawler.name()
    }

    /// Run outside the job manager
    pub async fn run(&self, company: &str) -> RagResult<IngestReport> {
        let ctx = JobContext::detached(format!("ingest-{}", company));
        self.run_with(company, &ctx).await
    }

    pub async fn run_with(&self, company: &str, ctx: &JobContext) -> RagResult<IngestReport> {
        let company = normalize_company(company)?;
        let mut report = IngestReport {
            company: company.clone(),
            ..IngestReport::default()
        };

        // 1. fetching
        ctx.enter("fetching", format!("via {}", self.crawler.name()));
        let outcome = self
            .retry
            .run("fetch", ctx, || self.crawler.fetch(&company))
            .await?;
        report.documents_fetched = outcome.pages.len();
        report.fetch_errors = outcome.errors;
        ctx.check_cancelled()?;

        if !outcome.pages.is_empty() && !self.crawler.reads_snapshots() {
            if let Some(corpus) = &self.snapshots {
                corpus.write_pages(&company, &outcome.pages)?;
            }
        }

        // 2. cleaning
        ctx.enter("cleaning", format!("{} pages", outcome.pages.len()));
        let mut seen = HashSet::new();
        let documents: Vec<Document> = outcome
            .pages
            .iter()
            .filter_map(|page| {
                let Some(content) = clean_text(&page.markdown) else {
                    tracing::warn!("Dropping {} (too short after cleaning)", page.url);
                    return None;
                };
                Some(Document::new(
                    &company,
                    &page.url,
                    &page.title,
                    &content,
                    Some(page.fetched_at),
                ))
            })
            .filter(|doc| seen.insert(doc.document_id.clone()))
            .collect();
        report.documents_kept = documents.len();
        ctx.check_cancelled()?;

        if documents.is_empty() {
            tracing::warn!("No usable documents for '{}', existing data left untouched", company);
            return Ok(report);
        }

        // 3. chunking
        ctx.enter("chunking", format!("{} documents", documents.len()));
        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunk_document(doc, self.chunker.as_ref()))
            .collect();
        report.chunks_produced = chunks.len();
        tracing::info!(
            "Chunked {} documents into {} chunks ({})",
            documents.len(),
            chunks.len(),
            self.chunker.name()
        );
        ctx.check_cancelled()?;

        // 4. embedding
        let records = self.embed_chunks(chunks, ctx).await?;
        ctx.check_cancelled()?;

        // 5. storing
        ctx.enter("storing", format!("{} vectors", records.len()));
        for doc in &documents {
            if self.documents.upsert_document(doc)? != DocumentWrite::Unchanged {
                report.documents_changed += 1;
            }
        }
        report.vectors_stored = self.store_records(&records, ctx).await?;
        ctx.check_cancelled()?;

        let keep_chunks: HashSet<String> =
            records.iter().map(|r| r.chunk.chunk_id.clone()).collect();
        let keep_docs: HashSet<String> = documents.iter().map(|d| d.document_id.clone()).collect();

        report.vectors_pruned = self
            .retry
            .run("prune", ctx, || self.vectors.retain_company_chunks(&company, &keep_chunks))
            .await?;
        report.documents_pruned = self.documents.retain_company_documents(&company, &keep_docs)?;

        tracing::info!(
            "Ingested '{}': {} documents, {} chunks ({} stale vectors pruned)",
            company,
            report.documents_kept,
            report.vectors_stored,
            report.vectors_pruned
        );
        Ok(report)
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>, ctx: &JobContext) -> RagResult<Vec<ChunkRecord>> {
        let total = chunks.len();
        ctx.enter("embedding", format!("0/{} chunks", total));

        let mut records = Vec::with_capacity(total);
        let mut pending = chunks.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<Chunk> = pending.by_ref().take(self.embedder.batch_size()).collect();
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

            let dense = self
                .retry
                .run("embed", ctx, || self.embedder.embed_dense_batch(&texts))
                .await?;

            for (chunk, dense) in batch.into_iter().zip(dense) {
                let sparse = self.embedder.embed_sparse(&chunk.text);
                records.push(ChunkRecord {
                    chunk,
                    dense,
                    sparse,
                });
            }

            ctx.enter("embedding", format!("{}/{} chunks", records.len(), total));
            ctx.check_cancelled()?;
        }

        Ok(records)
    }

    /// Upsert in parallel batches
    async fn store_records(&self, records: &[ChunkRecord], ctx: &JobContext) -> RagResult<usize> {
        let uploads: Vec<_> = records
            .chunks(self.upsert_batch_size)
            .map(|batch| self.retry.run("upsert", ctx, move || self.vectors.upsert(batch)))
            .collect();

        let mut in_flight = stream::iter(uploads).buffer_unordered(self.upsert_concurrency);
        let mut stored = 0;
        while let Some(result) = in_flight.next().await {
            stored += result?;
        }

        tracing::debug!("Upserted {} vectors into {}", stored, self.vectors.name());
        Ok(stored)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{ChunkConfig, MarkdownChunker, MemoryVectorStore};
    use crate::test_support::{hashing_embedder, prose, StaticCrawler};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        crawler: Arc<StaticCrawler>,
        documents: DocumentStore,
        vectors: Arc<MemoryVectorStore>,
        pipeline: IngestionPipeline,
    }

    fn fixture() -> Fixture {
        let crawler = Arc::new(StaticCrawler::new());
        let documents = DocumentStore::open_in_memory().unwrap();
        let vectors = Arc::new(MemoryVectorStore::new());
        let pipeline = IngestionPipeline::new(
            crawler.clone(),
            documents.clone(),
            vectors.clone(),
            hashing_embedder(64),
            Arc::new(MarkdownChunker::new(ChunkConfig::compact())),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        })
        .with_upserts(2, 3);

        Fixture {
            crawler,
            documents,
            vectors,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_run_stores_chunks_and_documents() {
        let f = fixture();
        f.crawler.set_pages(
            "figma",
            &[
                ("https://figma.test/about", "About Figma", &prose("design", 120)),
                ("https://figma.test/pricing", "Pricing", &prose("pricing", 90)),
            ],
        );

        let report = f.pipeline.run("Figma").await.unwrap();

        assert_eq!(report.company, "figma");
        assert_eq!(report.documents_fetched, 2);
        assert_eq!(report.documents_kept, 2);
        assert!(report.chunks_produced >= 2);
        assert_eq!(report.vectors_stored, report.chunks_produced);
        assert_eq!(f.vectors.count().await.unwrap(), report.chunks_produced);
        assert_eq!(f.documents.list_documents("figma").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let f = fixture();
        f.crawler
            .set_pages("paypal", &[("https://paypal.test", "PayPal", &prose("payments", 150))]);

        f.pipeline.run("paypal").await.unwrap();
        let first_ids = f.vectors.chunk_ids("paypal").await.unwrap();
        let first_count = f.vectors.count().await.unwrap();

        let report = f.pipeline.run("paypal").await.unwrap();
        assert_eq!(f.vectors.chunk_ids("paypal").await.unwrap(), first_ids);
        assert_eq!(f.vectors.count().await.unwrap(), first_count);
        assert_eq!(report.documents_changed, 0);
        assert_eq!(report.vectors_pruned, 0);
    }

    #[tokio::test]
    async fn test_changed_content_prunes_stale_chunks() {
        let f = fixture();
        f.crawler.set_pages(
            "airbnb",
            &[
                ("https://airbnb.test/a", "A", &prose("hosts", 80)),
                ("https://airbnb.test/b", "B", &prose("guests", 80)),
            ],
        );
        f.pipeline.run("airbnb").await.unwrap();

        f.crawler
            .set_pages("airbnb", &[("https://airbnb.test/a", "A", &prose("listings", 80))]);
        let report = f.pipeline.run("airbnb").await.unwrap();

        assert!(report.vectors_pruned > 0);
        assert_eq!(report.documents_pruned, 1);
        assert_eq!(
            f.vectors.chunk_ids("airbnb").await.unwrap().len(),
            report.chunks_produced
        );
        assert_eq!(f.documents.list_documents("airbnb").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_usable_pages_leaves_data_untouched() {
        let f = fixture();
        f.crawler
            .set_pages("stripe", &[("https://stripe.test", "Stripe", &prose("billing", 60))]);
        f.pipeline.run("stripe").await.unwrap();
        let before = f.vectors.count().await.unwrap();

        f.crawler
            .set_pages("stripe", &[("https://stripe.test", "Stripe", "too short")]);
        let report = f.pipeline.run("stripe").await.unwrap();

        assert_eq!(report.documents_kept, 0);
        assert_eq!(report.vectors_stored, 0);
        assert_eq!(f.vectors.count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let f = fixture();
        f.crawler
            .set_pages("figma", &[("https://figma.test", "Figma", &prose("design", 60))]);
        f.crawler.fail_next(2);

        let report = f.pipeline.run("figma").await.unwrap();
        assert_eq!(report.documents_kept, 1);
        assert_eq!(f.crawler.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_storing() {
        let f = fixture();
        f.crawler
            .set_pages("figma", &[("https://figma.test", "Figma", &prose("design", 60))]);

        let ctx = JobContext::detached("ingest-figma-test");
        ctx.cancel();
        let err = f.pipeline.run_with("figma", &ctx).await.unwrap_err();

        assert_eq!(err.code(), "cancelled");
        assert_eq!(f.vectors.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshots_written_then_replayed() {
        let dir = TempDir::new().unwrap();
        let f = fixture();
        let corpus = LocalCorpus::new(dir.path());
        let pipeline = f.pipeline.clone().with_snapshots(corpus.clone());

        f.crawler
            .set_pages("figma", &[("https://figma.test", "Figma", &prose("design", 60))]);
        let live = pipeline.run("figma").await.unwrap();
        assert!(corpus.has_company("figma"));

        let replay = pipeline.with_crawler(Arc::new(corpus.clone()));
        let offline = replay.run("figma").await.unwrap();
        assert_eq!(offline.chunks_produced, live.chunks_produced);
        assert_eq!(offline.documents_changed, 0);
    }
}
