//! Agent service - the tool operations exposed to the conversational layer
//!
//! Wires the retrieval engine, ingestion pipeline, job managers and eval
//! harness together. Both the HTTP server and the CLI drive this type.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::company::normalize_company;
use crate::config::{Config, StoreBackend};
use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};
use crate::eval::{EvalHarness, EvalOutput, Metrics};
use crate::ingest::{IngestReport, IngestionPipeline};
use crate::jobs::{JobKind, JobManager, JobRecord, Submission};
use crate::knowledge::{
    open_vector_store, Citation, DocumentStore, MarkdownChunker, RetrievalEngine, StoreStats,
    VectorStore,
};
use crate::retry::RetryPolicy;
use crate::scraper::{Crawler, LocalCorpus, WebScraper};

// ============================================================================
// Responses
// ============================================================================

/// One ranked passage in a `search_knowledge_base` answer
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Stable chunk id
    pub chunk_id: String,
    /// Normalized company key
    pub company: String,
    /// Source page URL
    pub url: String,
    /// Source page title
    pub title: String,
    /// Chunk text
    pub text: String,
    /// Fused RRF score (higher is better)
    pub score: f32,
    /// Index of the chunk within its document
    pub position: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub company: Option<String>,
    pub results: Vec<SearchHit>,
    pub citations: Vec<Citation>,
}

/// `check_scrape_status` body
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeStatus {
    pub run_id: String,
    pub company: String,
    pub status: &'static str,
    pub phase: String,
    pub progress: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<IngestReport>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord<IngestReport>> for ScrapeStatus {
    fn from(record: JobRecord<IngestReport>) -> Self {
        Self {
            status: record.status(),
            phase: record.phase().to_string(),
            progress: record.progress().to_string(),
            error: record.error().map(str::to_string),
            report: record.output().cloned(),
            updated_at: record.updated_at,
            company: record.key,
            run_id: record.run_id,
        }
    }
}

/// `GET /eval/status` body
#[derive(Debug, Clone, Serialize)]
pub struct EvalStatus {
    pub run_id: String,
    /// Company the dataset targets
    pub company: String,
    pub status: &'static str,
    pub phase: String,
    pub progress: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl From<JobRecord<EvalOutput>> for EvalStatus {
    fn from(record: JobRecord<EvalOutput>) -> Self {
        Self {
            status: record.status(),
            phase: record.phase().to_string(),
            progress: record.progress().to_string(),
            error: record.error().map(str::to_string),
            metrics: record.output().map(|o| o.metrics),
            company: record.key,
            run_id: record.run_id,
        }
    }
}

/// Stored company entry
#[derive(Debug, Clone, Serialize)]
pub struct CompanyInfo {
    /// Normalized company key
    pub company: String,
    /// Chunk count in the vector store
    pub chunks: usize,
    /// Document count in the document store
    pub documents: usize,
}

/// What `delete_company_data` removed
#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    /// Normalized company key
    pub company: String,
    /// Chunk records removed from the vector store
    pub vectors_deleted: usize,
    /// Documents removed from the document store
    pub documents_deleted: usize,
    /// Whether a raw snapshot directory was removed
    pub raw_deleted: bool,
    /// Runs cancelled before the purge
    pub cancelled_runs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result(name: &str, result: RagResult<()>) -> Self {
        Self {
            name: name.to_string(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub embedding: ComponentHealth,
    pub vector_store: ComponentHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.embedding.ok && self.vector_store.ok
    }
}

/// Store and provider summary for `status`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Document store statistics
    pub documents: StoreStats,
    /// Total chunk records
    pub vectors: usize,
    /// Dense embedding provider name
    pub embedding_provider: String,
    /// Dense vector dimension
    pub embedding_dimension: usize,
    /// Vector store backend name
    pub vector_store: &'static str,
}

// ============================================================================
// AgentService
// ============================================================================

#[derive(Clone)]
pub struct AgentService {
    engine: RetrievalEngine,
    pipeline: IngestionPipeline,
    harness: EvalHarness,
    documents: DocumentStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Embedder,
    raw: LocalCorpus,
    ingest_jobs: JobManager<IngestReport>,
    eval_jobs: JobManager<EvalOutput>,
    default_top_k: usize,
    request_timeout: Duration,
    cancel_grace: Duration,
}

impl AgentService {
    /// Build the production service from configuration
    pub async fn from_config(config: &Config) -> RagResult<Self> {
        let embedder = Embedder::from_config(&config.embedding)?;
        let documents = match config.store.backend {
            StoreBackend::Lance => DocumentStore::open(&config.documents_db_path())?,
            StoreBackend::Memory => DocumentStore::open_in_memory()?,
        };
        let vectors =
            open_vector_store(&config.store, &config.lance_path(), config.embedding.dimension)
                .await?;
        let crawler: Arc<dyn Crawler> = Arc::new(WebScraper::new(&config.crawler)?);

        Ok(Self::with_components(config, crawler, documents, vectors, embedder))
    }

    /// Build around explicit components (offline runs and tests)
    pub fn with_components(
        config: &Config,
        crawler: Arc<dyn Crawler>,
        documents: DocumentStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Embedder,
    ) -> Self {
        let raw = LocalCorpus::new(config.raw_root());
        let pipeline = IngestionPipeline::new(
            crawler,
            documents.clone(),
            vectors.clone(),
            embedder.clone(),
            Arc::new(MarkdownChunker::new(config.chunking.clone())),
        )
        .with_retry(RetryPolicy::from_config(&config.jobs))
        .with_upserts(config.store.upsert_batch_size, config.store.upsert_concurrency)
        .with_snapshots(raw.clone());

        let job_timeout = config.jobs.job_timeout_secs.map(Duration::from_secs);
        let ingest_jobs = JobManager::new(JobKind::Ingest).with_job_timeout(job_timeout);

        let engine = RetrievalEngine::new(embedder.clone(), vectors.clone(), config.retrieval.clone());
        let harness = EvalHarness::new(
            engine.clone(),
            pipeline.clone(),
            ingest_jobs.clone(),
            config.dataset_dir(),
            config.eval.top_k,
        )
        .with_corpus_dir(config.corpus_dir())
        .with_report_dir(config.report_dir());

        Self {
            engine,
            pipeline,
            harness,
            documents,
            vectors,
            embedder,
            raw,
            ingest_jobs,
            eval_jobs: JobManager::new(JobKind::Eval).with_job_timeout(job_timeout),
            default_top_k: config.retrieval.top_k,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            cancel_grace: Duration::from_secs(config.jobs.cancel_grace_secs),
        }
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn ingest_jobs(&self) -> &JobManager<IngestReport> {
        &self.ingest_jobs
    }

    pub fn eval_jobs(&self) -> &JobManager<EvalOutput> {
        &self.eval_jobs
    }

    // ------------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------------

    /// Hybrid search, packed into the context budget
    pub async fn search_knowledge_base(
        &self,
        query: &str,
        company: Option<&str>,
        limit: Option<usize>,
    ) -> RagResult<SearchResponse> {
        let top_k = limit.unwrap_or(self.default_top_k);
        let result = tokio::time::timeout(
            self.request_timeout,
            self.engine.retrieve_context(query, company, top_k),
        )
        .await
        .map_err(|_| RagError::Timeout(self.request_timeout))??;

        let citations = result.citations();
        let results = result
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                score: hit.score,
                chunk_id: hit.chunk.chunk_id,
                company: hit.chunk.company,
                url: hit.chunk.url,
                title: hit.chunk.title,
                text: hit.chunk.text,
                position: hit.chunk.position,
            })
            .collect();

        Ok(SearchResponse {
            query: result.query,
            company: result.company,
            results,
            citations,
        })
    }

    /// Queue an ingestion run (coalesced per company)
    pub fn gather_company_data(&self, company_name: &str) -> RagResult<Submission> {
        let company = normalize_company(company_name)?;
        let pipeline = self.pipeline.clone();
        let key = company.clone();

        Ok(self.ingest_jobs.submit(&company, move |ctx| async move {
            pipeline.run_with(&key, &ctx).await
        }))
    }

    /// Latest ingestion run for a company
    pub fn check_scrape_status(&self, company_name: &str) -> RagResult<ScrapeStatus> {
        let company = normalize_company(company_name)?;
        self.ingest_jobs
            .latest_for_key(&company)
            .map(ScrapeStatus::from)
            .ok_or_else(|| RagError::not_found("ingest run", company))
    }

    pub async fn list_gathered_companies(&self) -> RagResult<Vec<CompanyInfo>> {
        let summaries = self.vectors.list_companies().await?;
        let mut companies = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let documents = self.documents.list_documents(&summary.company)?.len();
            companies.push(CompanyInfo {
                company: summary.company,
                chunks: summary.chunks,
                documents,
            });
        }
        Ok(companies)
    }

    /// Cancel active runs for the company, then purge vectors, documents and raw files
    pub async fn delete_company_data(&self, company_name: &str) -> RagResult<DeletionReport> {
        let company = normalize_company(company_name)?;

        // evals first: a running eval may still queue a corpus ingest
        let mut cancelled_runs = Vec::new();
        if let Some(run_id) = self.eval_jobs.cancel_and_wait(&company, self.cancel_grace).await? {
            cancelled_runs.push(run_id);
        }
        if let Some(run_id) = self.ingest_jobs.cancel_and_wait(&company, self.cancel_grace).await? {
            cancelled_runs.push(run_id);
        }

        let vectors_deleted = self.vectors.delete_by_company(&company).await?;
        let documents_deleted = self.documents.delete_company(&company)?;
        let raw_deleted = self.raw.wipe(&company)?;

        if vectors_deleted == 0 && documents_deleted == 0 && !raw_deleted && cancelled_runs.is_empty()
        {
            return Err(RagError::not_found("company", company));
        }

        tracing::info!(
            "Deleted '{}': {} vectors, {} documents",
            company,
            vectors_deleted,
            documents_deleted
        );
        Ok(DeletionReport {
            company,
            vectors_deleted,
            documents_deleted,
            raw_deleted,
            cancelled_runs,
        })
    }

    /// Queue an eval run for a dataset
    ///
    /// Runs are keyed by the dataset's company: one eval per company at a time,
    /// and company deletion cancels it.
    pub fn run_eval(&self, dataset_id: &str) -> RagResult<Submission> {
        let dataset_id = normalize_company(dataset_id)?;
        // unknown datasets fail fast instead of producing a failed run
        let dataset = self.harness.dataset(&dataset_id)?;

        let harness = self.harness.clone();
        Ok(self.eval_jobs.submit(&dataset.company, move |ctx| async move {
            harness.run(&dataset_id, &ctx).await
        }))
    }

    pub fn eval_status(&self, run_id: &str) -> RagResult<EvalStatus> {
        self.eval_jobs.get_status(run_id).map(EvalStatus::from)
    }

    pub async fn health(&self) -> HealthReport {
        let (embedding, store) = tokio::join!(self.embedder.health(), self.vectors.health());
        let report = HealthReport {
            status: "ok",
            embedding: ComponentHealth::from_result(self.embedder.provider_name(), embedding),
            vector_store: ComponentHealth::from_result(self.vectors.name(), store),
        };
        HealthReport {
            status: if report.is_healthy() { "ok" } else { "degraded" },
            ..report
        }
    }

    pub async fn stats(&self) -> RagResult<ServiceStats> {
        Ok(ServiceStats {
            documents: self.documents.stats()?,
            vectors: self.vectors.count().await?,
            embedding_provider: self.embedder.provider_name().to_string(),
            embedding_dimension: self.embedder.dimension(),
            vector_store: self.vectors.name(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::scraper::FetchedPage;
    use crate::test_support::{prose, test_service, StaticCrawler};
    use tempfile::TempDir;

    fn seeded_crawler() -> Arc<StaticCrawler> {
        let crawler = Arc::new(StaticCrawler::new());
        crawler.set_pages(
            "paypal",
            &[("https://paypal.test", "PayPal", &prose("payments", 100))],
        );
        crawler.set_pages(
            "airbnb",
            &[("https://airbnb.test", "Airbnb", &prose("rentals", 100))],
        );
        crawler
    }

    async fn gather(service: &AgentService, company: &str) {
        let submission = service.gather_company_data(company).unwrap();
        let record = service.ingest_jobs().wait(&submission.run_id).await.unwrap();
        assert_eq!(record.status(), "completed", "{:?}", record.error());
    }

    #[tokio::test]
    async fn test_filter_correctness() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, seeded_crawler());
        gather(&service, "paypal").await;
        gather(&service, "airbnb").await;

        let response = service
            .search_knowledge_base("payments rentals company", Some("PayPal"), Some(10))
            .await
            .unwrap();
        assert!(!response.results.is_empty());
        assert!(response.results.iter().all(|r| r.company == "paypal"));
        assert_eq!(response.citations[0].url, "https://paypal.test");
    }

    #[tokio::test]
    async fn test_deletion_completeness() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, seeded_crawler());
        gather(&service, "paypal").await;
        gather(&service, "airbnb").await;
        assert!(dir.path().join("companies/airbnb/raw").is_dir());

        let report = service.delete_company_data("Airbnb").await.unwrap();
        assert!(report.vectors_deleted > 0);
        assert_eq!(report.documents_deleted, 1);
        assert!(report.raw_deleted);

        let companies = service.list_gathered_companies().await.unwrap();
        assert!(companies.iter().all(|c| c.company != "airbnb"));
        assert!(companies.iter().any(|c| c.company == "paypal"));

        let response = service
            .search_knowledge_base("rentals", Some("airbnb"), None)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert!(!dir.path().join("companies/airbnb/raw").exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_company() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, seeded_crawler());
        let err = service.delete_company_data("nobody").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_cancels_eval_keyed_by_dataset_company() {
        let dir = TempDir::new().unwrap();
        let crawler = seeded_crawler();
        let service = test_service(&dir, crawler.clone());

        let golden = dir.path().join("golden");
        LocalCorpus::new(&golden)
            .write_pages(
                "paypal",
                &[FetchedPage {
                    url: "https://paypal.test/about".into(),
                    title: "About PayPal".into(),
                    markdown: prose("founded", 60),
                    fetched_at: Utc::now(),
                }],
            )
            .unwrap();
        std::fs::write(
            golden.join("paypal-smoke.json"),
            r#"{"company": "PayPal", "queries": [
                {"id": "q1", "query": "founded", "reference_contexts": ["founded"]}
            ]}"#,
        )
        .unwrap();

        crawler.hold();
        let crawl = service.gather_company_data("paypal").unwrap();
        crawler.wait_until_fetching().await;
        let eval = service.run_eval("paypal-smoke").unwrap();
        assert!(eval.run_id.starts_with("eval-paypal-"));
        tokio::task::yield_now().await;

        let report = service.delete_company_data("paypal").await.unwrap();
        assert_eq!(report.cancelled_runs, vec![eval.run_id.clone(), crawl.run_id.clone()]);

        let record = service.eval_jobs().get_status(&eval.run_id).unwrap();
        assert!(matches!(record.state, JobState::Failed { code: "cancelled", .. }));
        assert!(service.ingest_jobs().active_run("paypal").is_none());
        assert!(service
            .list_gathered_companies()
            .await
            .unwrap()
            .iter()
            .all(|c| c.company != "paypal"));
    }

    #[tokio::test]
    async fn test_gather_coalesces_while_active() {
        let dir = TempDir::new().unwrap();
        let crawler = seeded_crawler();
        crawler.set_pages("figma", &[("https://figma.test", "Figma", &prose("design", 300))]);
        let service = test_service(&dir, crawler);

        let first = service.gather_company_data("figma").unwrap();
        let second = service.gather_company_data("Figma").unwrap();
        assert_eq!(first.run_id, second.run_id);

        service.ingest_jobs().wait(&first.run_id).await.unwrap();
        let status = service.check_scrape_status("figma").unwrap();
        assert_eq!(status.status, "completed");
        assert!(status.report.unwrap().vectors_stored > 0);
    }

    #[tokio::test]
    async fn test_status_for_unknown_company() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, seeded_crawler());
        assert!(matches!(
            service.check_scrape_status("figma"),
            Err(RagError::NotFound { .. })
        ));
        assert!(matches!(service.run_eval("figma"), Err(RagError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_health_with_offline_components() {
        let dir = TempDir::new().unwrap();
        let service = test_service(&dir, seeded_crawler());
        let health = service.health().await;
        assert!(health.is_healthy());
        assert_eq!(health.status, "ok");
        assert_eq!(health.vector_store.name, "memory");
    }
}
