//! Raw snapshot storage
//!
//! Fetched pages are kept as markdown files with a small front-matter header
//! under `<root>/<company>/raw/`. The same layout doubles as an offline
//! corpus: [`LocalCorpus`] implements [`Crawler`] by reading it back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::{CrawlOutcome, Crawler, FetchedPage};
use crate::error::RagResult;

#[derive(Debug, Clone)]
pub struct LocalCorpus {
    root: PathBuf,
}

impl LocalCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, company: &str) -> PathBuf {
        self.root.join(company).join("raw")
    }

    pub fn has_company(&self, company: &str) -> bool {
        self.raw_dir(company).is_dir()
    }

    /// Replace the company's snapshot with `pages`
    pub fn write_pages(&self, company: &str, pages: &[FetchedPage]) -> RagResult<usize> {
        self.wipe(company)?;
        let dir = self.raw_dir(company);
        std::fs::create_dir_all(&dir)?;

        for (i, page) in pages.iter().enumerate() {
            let path = dir.join(format!("page_{:03}.md", i + 1));
            std::fs::write(&path, render_page(company, page))?;
        }

        tracing::info!("Saved {} raw pages to {}", pages.len(), dir.display());
        Ok(pages.len())
    }

    /// Pages of a company in file-name order
    pub fn read_pages(&self, company: &str) -> RagResult<Vec<FetchedPage>> {
        let dir = self.raw_dir(company);
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "md"))
            .collect();
        paths.sort();

        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path)?;
            match parse_page(&text) {
                Some(page) => pages.push(page),
                None => tracing::warn!("Skipping {} (no front matter)", path.display()),
            }
        }

        tracing::debug!("Loaded {} raw pages for '{}'", pages.len(), company);
        Ok(pages)
    }

    /// Remove the company's raw directory; `true` if it existed
    pub fn wipe(&self, company: &str) -> RagResult<bool> {
        let dir = self.raw_dir(company);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("Wiped raw data at {}", dir.display());
        Ok(true)
    }
}

#[async_trait]
impl Crawler for LocalCorpus {
    async fn fetch(&self, company: &str) -> RagResult<CrawlOutcome> {
        let pages = self.read_pages(company)?;
        Ok(CrawlOutcome {
            pages,
            errors: vec![],
        })
    }

    fn name(&self) -> &'static str {
        "local-corpus"
    }

    fn reads_snapshots(&self) -> bool {
        true
    }
}

fn render_page(company: &str, page: &FetchedPage) -> String {
    format!(
        "---\nurl: {}\ntitle: {}\ncompany: {}\nfetched_at: {}\n---\n\n{}",
        page.url,
        page.title.replace('\n', " "),
        company,
        page.fetched_at.to_rfc3339(),
        page.markdown
    )
}

fn parse_page(text: &str) -> Option<FetchedPage> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let header = &rest[..end];
    let body = rest[end + 4..].trim();

    let mut url = String::new();
    let mut title = String::new();
    let mut fetched_at: Option<DateTime<Utc>> = None;

    for line in header.lines() {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key.trim() {
            "url" => url = value.trim().to_string(),
            "title" => title = value.trim().to_string(),
            "fetched_at" | "scraped_at" => {
                fetched_at = DateTime::parse_from_rfc3339(value.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
            _ => {}
        }
    }

    if title.is_empty() {
        title = url.clone();
    }

    Some(FetchedPage {
        url,
        title,
        markdown: body.to_string(),
        fetched_at: fetched_at.unwrap_or_else(Utc::now),
    })
}
