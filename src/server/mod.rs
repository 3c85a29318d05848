//! HTTP server for the agent tools
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | 200 when the embedding provider and vector store respond |
//! | `POST` | `/eval/run` | Queue an eval run (`{company}`), 202 |
//! | `GET`  | `/eval/status?run_id=` | Poll an eval run |
//! | `POST` | `/tools/search_knowledge_base` | Hybrid search (`{query, company?, limit?}`) |
//! | `POST` | `/tools/gather_company_data` | Queue an ingestion run (`{company_name}`), 202 |
//! | `POST` | `/tools/check_scrape_status` | Latest ingestion run (`{company_name}`) |
//! | `POST` | `/tools/delete_company_data` | Cancel runs and purge a company (`{company_name}`) |
//! | `GET`  | `/tools/list_gathered_companies` | Companies with stored chunks |
//!
//! Errors use `{ "error": { "code": "...", "message": "..." } }`.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::RagError;
use crate::jobs::Submission;
use crate::service::{
    AgentService, CompanyInfo, DeletionReport, EvalStatus, HealthReport, ScrapeStatus,
    SearchResponse,
};

/// Build the service from configuration and serve until the process exits
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = AgentService::from_config(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;

    tracing::info!("Agent service listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

pub fn router(service: AgentService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/eval/run", post(handle_eval_run))
        .route("/eval/status", get(handle_eval_status))
        .route("/tools/search_knowledge_base", post(handle_search))
        .route("/tools/gather_company_data", post(handle_gather))
        .route("/tools/check_scrape_status", post(handle_scrape_status))
        .route("/tools/delete_company_data", post(handle_delete))
        .route("/tools/list_gathered_companies", get(handle_list_companies))
        .layer(cors)
        .with_state(service)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound { .. } => StatusCode::NOT_FOUND,
            RagError::Cancelled(_) => StatusCode::CONFLICT,
            RagError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RagError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Dependency { .. } => StatusCode::BAD_GATEWAY,
            RagError::Configuration(_) | RagError::Storage(_) | RagError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", err);
        }
        Self {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: rejection.body_text(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Request bodies ============

#[derive(Deserialize)]
struct EvalRunRequest {
    company: String,
}

#[derive(Deserialize)]
struct StatusQuery {
    run_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    company: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CompanyRequest {
    company_name: String,
}

#[derive(Serialize)]
struct CompaniesResponse {
    companies: Vec<CompanyInfo>,
}

// ============ Handlers ============

async fn handle_health(State(service): State<AgentService>) -> (StatusCode, Json<HealthReport>) {
    let report = service.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn handle_eval_run(
    State(service): State<AgentService>,
    payload: Result<Json<EvalRunRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let Json(req) = payload?;
    let submission = service.run_eval(&req.company)?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

async fn handle_eval_status(
    State(service): State<AgentService>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<EvalStatus>> {
    let run_id = query
        .run_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| RagError::Validation("run_id is required".into()))?;
    Ok(Json(service.eval_status(&run_id)?))
}

async fn handle_search(
    State(service): State<AgentService>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Json(req) = payload?;
    let response = service
        .search_knowledge_base(&req.query, req.company.as_deref(), req.limit)
        .await?;
    Ok(Json(response))
}

async fn handle_gather(
    State(service): State<AgentService>,
    payload: Result<Json<CompanyRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let Json(req) = payload?;
    let submission = service.gather_company_data(&req.company_name)?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

async fn handle_scrape_status(
    State(service): State<AgentService>,
    payload: Result<Json<CompanyRequest>, JsonRejection>,
) -> ApiResult<Json<ScrapeStatus>> {
    let Json(req) = payload?;
    Ok(Json(service.check_scrape_status(&req.company_name)?))
}

async fn handle_delete(
    State(service): State<AgentService>,
    payload: Result<Json<CompanyRequest>, JsonRejection>,
) -> ApiResult<Json<DeletionReport>> {
    let Json(req) = payload?;
    Ok(Json(service.delete_company_data(&req.company_name).await?))
}

async fn handle_list_companies(
    State(service): State<AgentService>,
) -> ApiResult<Json<CompaniesResponse>> {
    let companies = service.list_gathered_companies().await?;
    Ok(Json(CompaniesResponse { companies }))
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::{FetchedPage, LocalCorpus};
    use crate::test_support::{prose, test_service, StaticCrawler};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn spawn(service: AgentService) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn crawler() -> Arc<StaticCrawler> {
        let crawler = Arc::new(StaticCrawler::new());
        crawler.set_pages("figma", &[("https://figma.test", "Figma", &prose("design", 120))]);
        crawler
    }

    async fn poll<F>(client: &reqwest::Client, url: &str, done: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..200 {
            let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
            if done(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out polling {}", url);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let base = spawn(test_service(&dir, crawler())).await;

        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_gather_then_search() {
        let dir = TempDir::new().unwrap();
        let base = spawn(test_service(&dir, crawler())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/tools/gather_company_data", base))
            .json(&json!({ "company_name": "Figma" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let submission: Value = resp.json().await.unwrap();
        assert_eq!(submission["status"], "queued");

        // poll the tool until the run is terminal
        let mut status = Value::Null;
        for _ in 0..200 {
            status = client
                .post(format!("{}/tools/check_scrape_status", base))
                .json(&json!({ "company_name": "figma" }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["status"] == "completed" || status["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status["status"], "completed");
        assert_eq!(status["run_id"], submission["run_id"]);

        let companies: Value = client
            .get(format!("{}/tools/list_gathered_companies", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(companies["companies"][0]["company"], "figma");

        let resp = client
            .post(format!("{}/tools/search_knowledge_base", base))
            .json(&json!({ "query": "design platform", "company": "figma" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(!body["results"].as_array().unwrap().is_empty());
        assert_eq!(body["citations"][0]["url"], "https://figma.test");
    }

    #[tokio::test]
    async fn test_error_contract() {
        let dir = TempDir::new().unwrap();
        let base = spawn(test_service(&dir, crawler())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/tools/search_knowledge_base", base))
            .json(&json!({ "query": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");

        let resp = client
            .get(format!("{}/eval/status?run_id=eval-missing", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("{}/tools/delete_company_data", base))
            .json(&json!({ "wrong": "field" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_search_unknown_company_is_empty() {
        let dir = TempDir::new().unwrap();
        let base = spawn(test_service(&dir, crawler())).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/tools/search_knowledge_base", base))
            .json(&json!({ "query": "anything", "company": "airbnb" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(body["results"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eval_run_and_status() {
        let dir = TempDir::new().unwrap();
        let golden = dir.path().join("golden");
        LocalCorpus::new(&golden)
            .write_pages(
                "paypal",
                &[FetchedPage {
                    url: "https://paypal.test/about".into(),
                    title: "About PayPal".into(),
                    markdown: "PayPal was founded in December 1998. \
                               Its headquarters are in San Jose, California."
                        .into(),
                    fetched_at: chrono::Utc::now(),
                }],
            )
            .unwrap();
        std::fs::write(
            golden.join("paypal.json"),
            r#"{"company": "paypal", "queries": [
                {"id": "q1", "query": "PayPal founding", "reference_contexts": ["December 1998"]},
                {"id": "q2", "query": "PayPal headquarters", "reference_contexts": ["San Jose"]}
            ]}"#,
        )
        .unwrap();

        let base = spawn(test_service(&dir, crawler())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/eval/run", base))
            .json(&json!({ "company": "paypal" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let run: Value = resp.json().await.unwrap();
        let run_id = run["run_id"].as_str().unwrap().to_string();

        let status = poll(
            &client,
            &format!("{}/eval/status?run_id={}", base, run_id),
            |b| b["status"] == "completed" || b["status"] == "failed",
        )
        .await;

        assert_eq!(status["status"], "completed", "{}", status);
        assert_eq!(status["metrics"]["hit_rate"], 1.0);
        assert_eq!(status["metrics"]["context_recall"], 1.0);
        assert!(status.get("error").is_none());
        assert!(dir
            .path()
            .join("eval")
            .join(format!("{}_report.json", run_id))
            .is_file());
    }

    #[tokio::test]
    async fn test_eval_unknown_dataset() {
        let dir = TempDir::new().unwrap();
        let base = spawn(test_service(&dir, crawler())).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/eval/run", base))
            .json(&json!({ "company": "nobody" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }
}
