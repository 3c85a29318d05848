//! Scraper module - fetch company pages as markdown
//!
//! [`Crawler`] is the "fetch -> markdown" contract the ingestion pipeline
//! depends on. [`WebScraper`] fetches configured seed URLs over HTTP and
//! renders the main content block as light markdown; [`LocalCorpus`] reads
//! previously saved snapshots.

pub mod cleaner;
pub mod corpus;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::config::CrawlerConfig;
use crate::error::{RagError, RagResult};

pub use cleaner::clean_text;
pub use corpus::LocalCorpus;

const SERVICE: &str = "crawler";

// ============================================================================
// Types
// ============================================================================

/// One fetched page, before cleaning
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub title: String,
    pub markdown: String,
    pub fetched_at: DateTime<Utc>,
}

/// Result of crawling one company
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub pages: Vec<FetchedPage>,
    /// Per-page failures that did not abort the crawl
    pub errors: Vec<String>,
}

// ============================================================================
// Crawler Trait
// ============================================================================

#[async_trait]
pub trait Crawler: Send + Sync {
    /// Fetch every page for a normalized company key
    ///
    /// Individual page failures land in [`CrawlOutcome::errors`]; an error is
    /// returned only when nothing could be fetched at all.
    async fn fetch(&self, company: &str) -> RagResult<CrawlOutcome>;

    fn name(&self) -> &'static str;

    /// Whether pages come from saved snapshots (and need no re-saving)
    fn reads_snapshots(&self) -> bool {
        false
    }
}

// ============================================================================
// WebScraper
// ============================================================================

pub struct WebScraper {
    client: reqwest::Client,
    seed_urls: Vec<String>,
}

impl WebScraper {
    pub fn new(config: &CrawlerConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            seed_urls: config.seed_urls.clone(),
        })
    }

    /// Expand seed templates for a company key
    pub fn seeds_for(&self, company: &str) -> Vec<String> {
        let title = title_case(company);
        self.seed_urls
            .iter()
            .map(|template| {
                template
                    .replace("{Company}", &title)
                    .replace("{company}", company)
            })
            .collect()
    }

    /// Fetch one URL and render it as markdown
    pub async fn scrape(&self, url: &str) -> RagResult<FetchedPage> {
        let parsed = url::Url::parse(url)
            .map_err(|e| RagError::Configuration(format!("invalid seed URL '{}': {}", url, e)))?;

        tracing::info!("Scraping: {}", url);

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| RagError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        let html = response
            .text()
            .await
            .map_err(|e| RagError::from_reqwest(SERVICE, e))?;

        if !status.is_success() {
            return Err(RagError::from_status(SERVICE, status, url));
        }

        let document = Html::parse_document(&html);
        let title = extract_title(&document).unwrap_or_else(|| url.to_string());
        let markdown = extract_markdown(&document);

        Ok(FetchedPage {
            url: url.to_string(),
            title,
            markdown,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Crawler for WebScraper {
    async fn fetch(&self, company: &str) -> RagResult<CrawlOutcome> {
        let mut outcome = CrawlOutcome::default();
        let mut failures: Vec<RagError> = Vec::new();

        for url in self.seeds_for(company) {
            match self.scrape(&url).await {
                Ok(page) => outcome.pages.push(page),
                Err(e) => {
                    tracing::warn!("Failed to fetch {}: {}", url, e);
                    outcome.errors.push(format!("{}: {}", url, e));
                    failures.push(e);
                }
            }
        }

        if outcome.pages.is_empty() && !failures.is_empty() {
            // nothing fetched: surface a transient failure if there was one
            let idx = failures.iter().position(RagError::is_transient).unwrap_or(0);
            return Err(failures.swap_remove(idx));
        }

        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "web"
    }
}

// ============================================================================
// HTML -> markdown
// ============================================================================

fn extract_title(document: &Html) -> Option<String> {
    for selector in ["title", "h1"] {
        if let Ok(selector) = Selector::parse(selector) {
            if let Some(element) = document.select(&selector).next() {
                let title = collapse_whitespace(&element.text().collect::<String>());
                if !title.is_empty() {
                    return Some(title);
                }
            }
        }
    }
    None
}

/// Render the main content block; priority: article > main > content ids > body
fn extract_markdown(document: &Html) -> String {
    let roots = [
        "div#mw-content-text",
        "article",
        "main",
        "[role=main]",
        "#content",
        "body",
    ];

    for root in roots {
        if let Ok(selector) = Selector::parse(root) {
            if let Some(element) = document.select(&selector).next() {
                let markdown = render_blocks(&element);
                if markdown.len() > 100 {
                    return markdown;
                }
            }
        }
    }

    Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next().map(|e| render_blocks(&e)))
        .unwrap_or_default()
}

/// Headings, paragraphs, list items and code blocks in document order
fn render_blocks(root: &ElementRef) -> String {
    let Ok(blocks) = Selector::parse("h1, h2, h3, h4, p, li, pre") else {
        return String::new();
    };

    let mut parts: Vec<String> = Vec::new();
    for element in root.select(&blocks) {
        if inside_excluded(&element) {
            continue;
        }

        let name = element.value().name();
        if name == "pre" {
            let code = element.text().collect::<String>();
            if !code.trim().is_empty() {
                parts.push(format!("```\n{}\n```", code.trim_end()));
            }
            continue;
        }

        let text = collapse_whitespace(&element.text().collect::<String>());
        if text.is_empty() {
            continue;
        }

        let block = match name {
            "h1" => format!("# {}", text),
            "h2" => format!("## {}", text),
            "h3" => format!("### {}", text),
            "h4" => format!("#### {}", text),
            "li" => format!("- {}", text),
            _ => text,
        };
        parts.push(block);
    }

    parts.join("\n\n")
}

/// Navigation chrome and nested list/paragraph duplicates
fn inside_excluded(element: &ElementRef) -> bool {
    element.ancestors().filter_map(ElementRef::wrap).any(|a| {
        matches!(
            a.value().name(),
            "nav" | "footer" | "header" | "aside" | "form" | "script" | "style" | "li" | "pre"
        )
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `goldman-sachs` -> `Goldman_Sachs`
fn title_case(company: &str) -> String {
    company
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("_")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scraper_with(seeds: &[&str]) -> WebScraper {
        let config = CrawlerConfig {
            seed_urls: seeds.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 2,
            ..CrawlerConfig::default()
        };
        WebScraper::new(&config).expect("scraper creation failed")
    }

    #[test]
    fn test_seed_expansion() {
        let scraper = scraper_with(&[
            "https://en.wikipedia.org/wiki/{Company}",
            "https://{company}.com/about",
        ]);
        assert_eq!(
            scraper.seeds_for("goldman-sachs"),
            vec![
                "https://en.wikipedia.org/wiki/Goldman_Sachs".to_string(),
                "https://goldman-sachs.com/about".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_title() {
        let html = r#"
            <html>
                <head><title>Test Page Title</title></head>
                <body><h1>Main Heading</h1></body>
            </html>
        "#;
        let document = Html::parse_document(html);
        assert_eq!(extract_title(&document), Some("Test Page Title".to_string()));
    }

    #[test]
    fn test_extract_title_h1_fallback() {
        let html = r#"
            <html>
                <head><title></title></head>
                <body><h1>H1 Heading</h1></body>
            </html>
        "#;
        let document = Html::parse_document(html);
        assert_eq!(extract_title(&document), Some("H1 Heading".to_string()));
    }

    #[test]
    fn test_markdown_from_article() {
        let html = r#"
            <html>
                <body>
                    <nav><p>Navigation menu</p></nav>
                    <article>
                        <h2>Overview</h2>
                        <p>This is the main article content.
                           It should be extracted as the primary content.</p>
                        <ul><li>Payments</li><li>Wallets and more text here</li></ul>
                    </article>
                    <footer><p>Footer content</p></footer>
                </body>
            </html>
        "#;
        let document = Html::parse_document(html);
        let markdown = extract_markdown(&document);

        assert!(markdown.starts_with("## Overview"));
        assert!(markdown.contains("main article content. It should"));
        assert!(markdown.contains("- Payments"));
        assert!(!markdown.contains("Navigation"));
        assert!(!markdown.contains("Footer"));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("paypal"), "Paypal");
        assert_eq!(title_case("goldman-sachs"), "Goldman_Sachs");
    }

    #[tokio::test]
    async fn test_all_seeds_failing_is_an_error() {
        let scraper = scraper_with(&["http://127.0.0.1:9/{company}"]);
        let err = scraper.fetch("acme").await.unwrap_err();
        assert!(err.is_transient());
    }
}
