//! CLI module
//!
//! company-intel command definitions and implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::knowledge::SearchMethod;
use crate::scraper::LocalCorpus;
use crate::service::AgentService;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "company-intel")]
#[command(version, about = "Company intelligence RAG service", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP agent service
    Serve,

    /// Fetch, chunk and embed one company's pages
    Ingest {
        /// Company name
        company: String,

        /// Read saved `<company>/raw/` snapshots from this directory instead of crawling
        #[arg(long)]
        from_dir: Option<PathBuf>,
    },

    /// Search the knowledge base
    Query {
        /// Search query
        query: String,

        /// Restrict to one company
        #[arg(short, long)]
        company: Option<String>,

        /// Result count limit
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// hybrid, dense or sparse
        #[arg(short, long, default_value = "hybrid")]
        method: SearchMethod,
    },

    /// Run an evaluation dataset
    Eval {
        /// Dataset id (`<dataset_dir>/<id>.json`)
        dataset: String,
    },

    /// List companies in the knowledge base
    Companies,

    /// Delete every document, chunk and raw file of a company
    Delete {
        company: String,
    },

    /// Show configuration and store status
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Run a CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve => crate::server::run_server(&config).await,
        Commands::Ingest { company, from_dir } => cmd_ingest(&config, &company, from_dir).await,
        Commands::Query {
            query,
            company,
            limit,
            method,
        } => cmd_query(&config, &query, company.as_deref(), limit, method).await,
        Commands::Eval { dataset } => cmd_eval(&config, &dataset).await,
        Commands::Companies => cmd_companies(&config).await,
        Commands::Delete { company } => cmd_delete(&config, &company).await,
        Commands::Status => cmd_status(&config).await,
    }
}

async fn open_service(config: &Config) -> Result<AgentService> {
    AgentService::from_config(config)
        .await
        .context("failed to initialize agent service")
}

// ============================================================================
// Command Implementations
// ============================================================================

/// ingest: crawl (or replay snapshots) and store one company
async fn cmd_ingest(config: &Config, company: &str, from_dir: Option<PathBuf>) -> Result<()> {
    let service = open_service(config).await?;

    let report = match from_dir {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("not a directory: {}", dir.display());
            }
            println!("[*] Ingesting '{}' from {}", company, dir.display());
            service
                .pipeline()
                .with_crawler(Arc::new(LocalCorpus::new(dir)))
                .run(company)
                .await
                .context("ingestion failed")?
        }
        None => {
            let submission = service.gather_company_data(company)?;
            println!("[*] Ingesting '{}' (run {})", company, submission.run_id);

            let record = service.ingest_jobs().wait(&submission.run_id).await?;
            match record.output() {
                Some(report) => report.clone(),
                None => bail!(
                    "ingestion failed in phase {}: {}",
                    record.phase(),
                    record.error().unwrap_or("unknown error")
                ),
            }
        }
    };

    println!(
        "[OK] {}: {} pages fetched, {} kept, {} chunks stored",
        report.company, report.documents_fetched, report.documents_kept, report.vectors_stored
    );
    if report.vectors_pruned > 0 {
        println!("     {} stale chunks pruned", report.vectors_pruned);
    }
    for err in &report.fetch_errors {
        println!("[!] {}", err);
    }

    Ok(())
}

/// query: hybrid (or single-modality) search
async fn cmd_query(
    config: &Config,
    query: &str,
    company: Option<&str>,
    limit: usize,
    method: SearchMethod,
) -> Result<()> {
    let service = open_service(config).await?;

    println!("[*] Searching ({}): \"{}\"", method, query);

    let result = service
        .engine()
        .retrieve_with(query, company, limit, method)
        .await
        .context("search failed")?;

    if result.is_empty() {
        println!("\n[!] No results.");
        return Ok(());
    }

    println!("\n[OK] {} results:\n", result.len());

    for (i, hit) in result.hits.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} ({})",
            i + 1,
            hit.score,
            hit.chunk.title,
            hit.chunk.company
        );
        println!("   URL: {}", hit.chunk.url);
        println!("   {}", truncate_text(&hit.chunk.text, 200));
        println!();
    }

    Ok(())
}

/// eval: run a dataset and print metrics
async fn cmd_eval(config: &Config, dataset: &str) -> Result<()> {
    let service = open_service(config).await?;

    let submission = service.run_eval(dataset)?;
    println!("[*] Eval '{}' started (run {})", dataset, submission.run_id);

    let record = service.eval_jobs().wait(&submission.run_id).await?;
    let Some(output) = record.output() else {
        bail!(
            "eval failed in phase {}: {}",
            record.phase(),
            record.error().unwrap_or("unknown error")
        );
    };

    println!("[OK] {} queries evaluated", output.metrics.queries_evaluated);
    println!("     Hit rate:       {:.2}", output.metrics.hit_rate);
    println!("     Context recall: {:.2}", output.metrics.context_recall);
    if let Some(path) = &output.report_path {
        println!("     Report: {}", path.display());
    }

    Ok(())
}

async fn cmd_companies(config: &Config) -> Result<()> {
    let service = open_service(config).await?;
    let companies = service.list_gathered_companies().await?;

    if companies.is_empty() {
        println!("[!] No companies stored.");
        return Ok(());
    }

    println!("[OK] {} companies:\n", companies.len());
    for c in companies {
        println!("  {:<24} {:>6} chunks {:>4} documents", c.company, c.chunks, c.documents);
    }

    Ok(())
}

async fn cmd_delete(config: &Config, company: &str) -> Result<()> {
    let service = open_service(config).await?;
    let report = service
        .delete_company_data(company)
        .await
        .with_context(|| format!("failed to delete '{}'", company))?;

    println!(
        "[OK] Deleted '{}': {} chunks, {} documents",
        report.company, report.vectors_deleted, report.documents_deleted
    );
    for run_id in &report.cancelled_runs {
        println!("     cancelled run {}", run_id);
    }

    Ok(())
}

/// status: configuration, store statistics and dependency health
async fn cmd_status(config: &Config) -> Result<()> {
    println!("company-intel v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] Data directory: {}", config.data_dir.display());

    let service = match AgentService::from_config(config).await {
        Ok(service) => service,
        Err(e) => {
            println!("[!] Service unavailable: {}", e);
            return Ok(());
        }
    };

    match service.stats().await {
        Ok(stats) => {
            println!(
                "[OK] Documents: {} across {} companies ({})",
                stats.documents.document_count,
                stats.documents.company_count,
                format_bytes(stats.documents.total_content_bytes)
            );
            println!("[OK] Vectors: {} chunks in {}", stats.vectors, stats.vector_store);
            println!(
                "[*] Embedding: {} ({} dims)",
                stats.embedding_provider, stats.embedding_dimension
            );
        }
        Err(e) => println!("[!] Stats unavailable: {}", e),
    }

    let health = service.health().await;
    for component in [&health.embedding, &health.vector_store] {
        match &component.error {
            None => println!("[OK] {} reachable", component.name),
            Some(err) => println!("[!] {} unreachable: {}", component.name, err),
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Truncate to `max_chars` characters on one line
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
