//! Eval harness - retrieval quality against a labeled query set
//!
//! A dataset lives at `<dataset_dir>/<dataset_id>.json`:
//!
//! ```json
//! {
//!   "company": "paypal",
//!   "queries": [
//!     { "id": "q1", "query": "When was PayPal founded?",
//!       "reference_contexts": ["founded in December 1998"] }
//!   ]
//! }
//! ```
//!
//! Matching is deterministic: reference contexts and retrieved text are both
//! lowercased with whitespace collapsed, then compared by substring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::company::normalize_company;
use crate::error::{RagError, RagResult};
use crate::ingest::{IngestReport, IngestionPipeline};
use crate::jobs::{JobContext, JobManager};
use crate::knowledge::{RetrievalEngine, RetrievedChunk};
use crate::scraper::LocalCorpus;

// ============================================================================
// Dataset
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    pub company: String,
    #[serde(default)]
    pub queries: Vec<LabeledQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabeledQuery {
    pub id: String,
    pub query: String,
    /// Facts the retrieved context should contain
    #[serde(default)]
    pub reference_contexts: Vec<String>,
    #[serde(default)]
    pub expected_chunk_ids: Vec<String>,
    /// Company expected among the hits of an unfiltered search
    #[serde(default)]
    pub expected_company: Option<String>,
}

impl LabeledQuery {
    /// Whether there is anything to score this query against
    pub fn is_scorable(&self) -> bool {
        !self.reference_contexts.is_empty()
            || !self.expected_chunk_ids.is_empty()
            || self.expected_company.is_some()
    }
}

impl Dataset {
    /// Load `<dir>/<dataset_id>.json`
    pub fn load(dir: &Path, dataset_id: &str) -> RagResult<Self> {
        // dataset ids share the company key alphabet, which keeps them path-safe
        let id = normalize_company(dataset_id)?;
        let path = dir.join(format!("{}.json", id));
        if !path.is_file() {
            return Err(RagError::not_found("dataset", id));
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut dataset: Dataset = serde_json::from_str(&raw).map_err(|e| {
            RagError::Validation(format!("malformed dataset {}: {}", path.display(), e))
        })?;
        dataset.company = normalize_company(&dataset.company)?;
        Ok(dataset)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub hit_rate: f64,
    pub context_recall: f64,
    pub queries_evaluated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub id: String,
    pub query: String,
    pub retrieved_chunk_ids: Vec<String>,
    pub retrieved_urls: Vec<String>,
    pub context_recall: f64,
    pub hit: bool,
}

/// Output attached to a completed eval run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalOutput {
    pub dataset: String,
    pub company: String,
    pub metrics: Metrics,
    pub queries_skipped: usize,
    pub ingestion: Option<IngestReport>,
    pub report_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct EvalReport<'a> {
    run_id: &'a str,
    dataset: &'a str,
    company: &'a str,
    timestamp: String,
    ingestion: Option<&'a IngestReport>,
    metrics: &'a Metrics,
    per_query: &'a [QueryOutcome],
}

/// Lowercase and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fraction of references found (normalized substring) in the retrieved text
pub fn context_recall(references: &[String], retrieved: &[&str]) -> f64 {
    if references.is_empty() {
        return 0.0;
    }
    let haystack = normalize_text(&retrieved.join(" "));
    let found = references
        .iter()
        .map(|r| normalize_text(r))
        .filter(|r| !r.is_empty() && haystack.contains(r.as_str()))
        .count();
    found as f64 / references.len() as f64
}

/// Score one query against its hits: `(hit, recall)`
///
/// - expected chunk ids: hit if any is retrieved; recall is the retrieved fraction
/// - reference contexts: recall by substring; hit if recall > 0
/// - expected company only: hit (and recall 1.0) if any hit belongs to it
pub fn score_query(query: &LabeledQuery, hits: &[RetrievedChunk]) -> (bool, f64) {
    let texts: Vec<&str> = hits.iter().map(|h| h.chunk.text.as_str()).collect();

    if !query.expected_chunk_ids.is_empty() {
        let found = query
            .expected_chunk_ids
            .iter()
            .filter(|id| hits.iter().any(|h| &h.chunk.chunk_id == *id))
            .count();
        let recall = if query.reference_contexts.is_empty() {
            found as f64 / query.expected_chunk_ids.len() as f64
        } else {
            context_recall(&query.reference_contexts, &texts)
        };
        return (found > 0, recall);
    }

    if !query.reference_contexts.is_empty() {
        let recall = context_recall(&query.reference_contexts, &texts);
        return (recall > 0.0, recall);
    }

    let hit = query
        .expected_company
        .as_deref()
        .map(|expected| {
            let expected = normalize_company(expected).unwrap_or_default();
            hits.iter().any(|h| h.chunk.company == expected)
        })
        .unwrap_or(false);
    (hit, if hit { 1.0 } else { 0.0 })
}

// ============================================================================
// EvalHarness
// ============================================================================

#[derive(Clone)]
pub struct EvalHarness {
    engine: RetrievalEngine,
    pipeline: IngestionPipeline,
    /// Corpus ingestion runs here so it never overlaps another ingest of the company
    ingest_jobs: JobManager<IngestReport>,
    dataset_dir: PathBuf,
    corpus_dir: PathBuf,
    report_dir: Option<PathBuf>,
    top_k: usize,
}

impl EvalHarness {
    pub fn new(
        engine: RetrievalEngine,
        pipeline: IngestionPipeline,
        ingest_jobs: JobManager<IngestReport>,
        dataset_dir: impl Into<PathBuf>,
        top_k: usize,
    ) -> Self {
        let dataset_dir = dataset_dir.into();
        Self {
            engine,
            pipeline,
            ingest_jobs,
            corpus_dir: dataset_dir.clone(),
            dataset_dir,
            report_dir: None,
            top_k: top_k.max(1),
        }
    }

    /// Where `<company>/raw/` corpora are looked up (defaults to the dataset dir)
    pub fn with_corpus_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.corpus_dir = dir.into();
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    /// Check the dataset exists before a run is queued
    pub fn dataset(&self, dataset_id: &str) -> RagResult<Dataset> {
        Dataset::load(&self.dataset_dir, dataset_id)
    }

    pub async fn run(&self, dataset_id: &str, ctx: &JobContext) -> RagResult<EvalOutput> {
        let dataset = self.dataset(dataset_id)?;
        let company = dataset.company.clone();

        // 1. ingest the bundled corpus, if any
        let corpus = LocalCorpus::new(&self.corpus_dir);
        let ingestion = if corpus.has_company(&company) {
            ctx.enter("ingesting", "loading and embedding documents");
            let report = self.ingest_corpus(&company, corpus, ctx).await?;
            tracing::info!(
                "Eval corpus: {} documents -> {} vectors",
                report.documents_kept,
                report.vectors_stored
            );
            Some(report)
        } else {
            None
        };
        ctx.check_cancelled()?;

        // 2. search
        let scorable: Vec<&LabeledQuery> =
            dataset.queries.iter().filter(|q| q.is_scorable()).collect();
        let skipped = dataset.queries.len() - scorable.len();
        if skipped > 0 {
            tracing::info!("Skipping {} queries without expectations", skipped);
        }

        let total = scorable.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, query) in scorable.iter().enumerate() {
            ctx.enter("searching", format!("{}/{} queries", i + 1, total));

            let filter = match query.expected_company {
                Some(_) => None,
                None => Some(company.as_str()),
            };
            let result = self.engine.retrieve(&query.query, filter, self.top_k).await?;
            let (hit, recall) = score_query(query, &result.hits);
            tracing::debug!("[{}/{}] {}: recall={:.2} hit={}", i + 1, total, query.id, recall, hit);

            outcomes.push(QueryOutcome {
                id: query.id.clone(),
                query: query.query.clone(),
                retrieved_chunk_ids: result.hits.iter().map(|h| h.chunk.chunk_id.clone()).collect(),
                retrieved_urls: result.hits.iter().map(|h| h.chunk.url.clone()).collect(),
                context_recall: recall,
                hit,
            });
            ctx.check_cancelled()?;
        }

        // 3. aggregate
        ctx.enter("evaluating", "computing retrieval metrics");
        let metrics = aggregate(&outcomes);
        tracing::info!(
            "Eval '{}': hit_rate={:.2} recall={:.2} ({} queries)",
            dataset_id,
            metrics.hit_rate,
            metrics.context_recall,
            metrics.queries_evaluated
        );

        let report_path = match &self.report_dir {
            Some(dir) => {
                let report = EvalReport {
                    run_id: ctx.run_id(),
                    dataset: dataset_id,
                    company: &company,
                    timestamp: Utc::now().to_rfc3339(),
                    ingestion: ingestion.as_ref(),
                    metrics: &metrics,
                    per_query: &outcomes,
                };
                Some(write_report(dir, ctx.run_id(), &report)?)
            }
            None => None,
        };

        Ok(EvalOutput {
            dataset: dataset_id.to_string(),
            company,
            metrics,
            queries_skipped: skipped,
            ingestion,
            report_path,
        })
    }

    /// Ingest the corpus as a regular ingest run for `company`
    ///
    /// A run already active for the company (e.g. a live crawl) is waited out
    /// first, so the two never prune each other's chunks.
    async fn ingest_corpus(
        &self,
        company: &str,
        corpus: LocalCorpus,
        ctx: &JobContext,
    ) -> RagResult<IngestReport> {
        let pipeline = self.pipeline.with_crawler(Arc::new(corpus));

        loop {
            ctx.check_cancelled()?;

            let job_pipeline = pipeline.clone();
            let key = company.to_string();
            let submission = self.ingest_jobs.submit(company, move |job_ctx| async move {
                job_pipeline.run_with(&key, &job_ctx).await
            });
            if submission.coalesced {
                tracing::info!(
                    "Ingest run {} active for '{}', waiting before loading the eval corpus",
                    submission.run_id,
                    company
                );
            }

            let record = tokio::select! {
                record = self.ingest_jobs.wait(&submission.run_id) => record?,
                _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
            };
            if !submission.coalesced {
                return record.into_result();
            }
        }
    }
}

fn aggregate(outcomes: &[QueryOutcome]) -> Metrics {
    let n = outcomes.len();
    if n == 0 {
        return Metrics {
            hit_rate: 0.0,
            context_recall: 0.0,
            queries_evaluated: 0,
        };
    }
    let hits = outcomes.iter().filter(|o| o.hit).count();
    let recall: f64 = outcomes.iter().map(|o| o.context_recall).sum();
    Metrics {
        hit_rate: hits as f64 / n as f64,
        context_recall: recall / n as f64,
        queries_evaluated: n,
    }
}

fn write_report(dir: &Path, run_id: &str, report: &EvalReport<'_>) -> RagResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_report.json", run_id));
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
    tracing::info!("Eval report written to {}", path.display());
    Ok(path)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::jobs::JobKind;
    use crate::knowledge::{
        ChunkConfig, DocumentStore, MarkdownChunker, MemoryVectorStore, VectorStore,
    };
    use crate::scraper::FetchedPage;
    use crate::test_support::{hashing_embedder, prose, StaticCrawler};
    use tempfile::TempDir;

    const FACTS: &str = "PayPal was founded in December 1998 as Confinity. \
        The company is headquartered in San Jose, California. \
        PayPal acquired Venmo through its purchase of Braintree in 2013. \
        It operates Xoom for international money transfers.";

    struct Fixture {
        crawler: Arc<StaticCrawler>,
        vectors: Arc<MemoryVectorStore>,
        ingest_jobs: JobManager<IngestReport>,
        harness: EvalHarness,
    }

    fn fixture(dataset_dir: &Path) -> Fixture {
        let crawler = Arc::new(StaticCrawler::new());
        let embedder = hashing_embedder(64);
        let vectors = Arc::new(MemoryVectorStore::new());
        let pipeline = IngestionPipeline::new(
            crawler.clone(),
            DocumentStore::open_in_memory().unwrap(),
            vectors.clone(),
            embedder.clone(),
            Arc::new(MarkdownChunker::new(ChunkConfig::compact())),
        );
        let engine = RetrievalEngine::new(embedder, vectors.clone(), RetrievalConfig::default());
        let ingest_jobs = JobManager::new(JobKind::Ingest);
        let harness = EvalHarness::new(engine, pipeline, ingest_jobs.clone(), dataset_dir, 5);

        Fixture {
            crawler,
            vectors,
            ingest_jobs,
            harness,
        }
    }

    fn harness(dataset_dir: &Path) -> EvalHarness {
        fixture(dataset_dir).harness
    }

    fn write_corpus(dir: &Path) {
        LocalCorpus::new(dir)
            .write_pages(
                "paypal",
                &[FetchedPage {
                    url: "https://paypal.test/about".into(),
                    title: "About PayPal".into(),
                    markdown: FACTS.into(),
                    fetched_at: Utc::now(),
                }],
            )
            .unwrap();
    }

    fn write_dataset(dir: &Path, json: &str) {
        std::fs::write(dir.join("paypal.json"), json).unwrap();
    }

    #[tokio::test]
    async fn test_three_of_four_hits() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path());
        write_dataset(
            dir.path(),
            r#"{
                "company": "paypal",
                "queries": [
                    {"id": "q1", "query": "When was PayPal founded?",
                     "reference_contexts": ["founded in December  1998"]},
                    {"id": "q2", "query": "Where is PayPal headquartered?",
                     "reference_contexts": ["San Jose, California"]},
                    {"id": "q3", "query": "How did PayPal get Venmo?",
                     "reference_contexts": ["purchase of Braintree", "Venmo"]},
                    {"id": "q4", "query": "Who runs the PayPal quantum lab?",
                     "reference_contexts": ["quantum research laboratory"]},
                    {"id": "q5", "query": "Unlabeled question"}
                ]
            }"#,
        );

        let reports = TempDir::new().unwrap();
        let harness = harness(dir.path()).with_report_dir(reports.path());
        let ctx = JobContext::detached("eval-paypal-test");
        let output = harness.run("paypal", &ctx).await.unwrap();

        assert_eq!(output.metrics.queries_evaluated, 4);
        assert_eq!(output.queries_skipped, 1);
        assert_eq!(output.metrics.hit_rate, 0.75);
        assert_eq!(output.metrics.context_recall, 0.75);
        assert_eq!(output.ingestion.as_ref().unwrap().documents_kept, 1);

        let path = output.report_path.unwrap();
        assert!(path.ends_with("eval-paypal-test_report.json"));
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(report["per_query"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_dataset_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ctx = JobContext::detached("eval-none");
        let err = harness(dir.path()).run("acme", &ctx).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { kind: "dataset", .. }));
    }

    #[tokio::test]
    async fn test_expected_chunk_ids() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path());
        let harness = harness(dir.path());

        // ingest first to learn the chunk id
        let corpus = Arc::new(LocalCorpus::new(dir.path()));
        harness.pipeline.with_crawler(corpus).run("paypal").await.unwrap();
        let ids = harness.engine.store().chunk_ids("paypal").await.unwrap();

        write_dataset(
            dir.path(),
            &format!(
                r#"{{"company": "paypal", "queries": [
                    {{"id": "q1", "query": "Xoom transfers", "expected_chunk_ids": ["{}"]}},
                    {{"id": "q2", "query": "Xoom transfers", "expected_chunk_ids": ["missing"]}}
                ]}}"#,
                ids[0]
            ),
        );

        let ctx = JobContext::detached("eval-ids");
        let output = harness.run("paypal", &ctx).await.unwrap();
        assert_eq!(output.metrics.hit_rate, 0.5);
        assert!(output.report_path.is_none());
    }

    #[test]
    fn test_context_recall_normalizes() {
        let refs = vec!["San  Jose".to_string(), "Austin".to_string()];
        assert_eq!(context_recall(&refs, &["based in san\njose"]), 0.5);
        assert_eq!(context_recall(&[], &["anything"]), 0.0);
    }

    #[test]
    fn test_dataset_id_must_be_a_key() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Dataset::load(dir.path(), "   "),
            Err(RagError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_corpus_ingest_waits_for_active_crawl() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path());
        write_dataset(
            dir.path(),
            r#"{"company": "paypal", "queries": [
                {"id": "q1", "query": "When was PayPal founded?",
                 "reference_contexts": ["December 1998"]}
            ]}"#,
        );

        let f = fixture(dir.path());
        f.crawler.set_pages(
            "paypal",
            &[("https://paypal.test/live", "Live", &prose("payments", 80))],
        );
        f.crawler.hold();

        let pipeline = f.harness.pipeline.clone();
        let crawl = f.ingest_jobs.submit("paypal", move |ctx| async move {
            pipeline.run_with("paypal", &ctx).await
        });
        f.crawler.wait_until_fetching().await;

        let harness = f.harness.clone();
        let eval = tokio::spawn(async move {
            let ctx = JobContext::detached("eval-paypal-queued");
            harness.run("paypal", &ctx).await
        });
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(!eval.is_finished());
        assert_eq!(f.vectors.count().await.unwrap(), 0);

        f.crawler.release();
        let output = eval.await.unwrap().unwrap();

        assert_eq!(f.ingest_jobs.get_status(&crawl.run_id).unwrap().status(), "completed");
        // the corpus run came second, so its chunks are the ones kept
        let ingestion = output.ingestion.unwrap();
        assert_eq!(
            f.vectors.chunk_ids("paypal").await.unwrap().len(),
            ingestion.vectors_stored
        );
        assert_eq!(output.metrics.hit_rate, 1.0);
    }

    #[tokio::test]
    async fn test_cancelled_eval_submits_no_ingest() {
        let dir = TempDir::new().unwrap();
        write_corpus(dir.path());
        write_dataset(
            dir.path(),
            r#"{"company": "paypal", "queries": [
                {"id": "q1", "query": "founded", "reference_contexts": ["1998"]}
            ]}"#,
        );

        let f = fixture(dir.path());
        let ctx = JobContext::detached("eval-paypal-cancelled");
        ctx.cancel();
        let err = f.harness.run("paypal", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(f.ingest_jobs.list().is_empty());
    }
}
