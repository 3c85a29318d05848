//! Markdown cleaning for fetched pages
//!
//! Deterministic rules that drop crawl noise (images, bare links, wiki
//! markers, carousel indicators, cookie sections) and normalize whitespace.

use std::sync::LazyLock;

use regex::Regex;

/// Pages shorter than this after cleaning are dropped
pub const MIN_LENGTH: usize = 50;
/// Longer pages are truncated to this many characters
pub const MAX_LENGTH: usize = 50_000;

struct Rules {
    image: Regex,
    bare_url: Regex,
    wiki_edit: Regex,
    wiki_cite: Regex,
    skip_line: Regex,
    slide: Regex,
    cookie_header: Regex,
    multi_newline: Regex,
    multi_space: Regex,
}

static RULES: LazyLock<Rules> = LazyLock::new(|| Rules {
    image: Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("image pattern"),
    bare_url: Regex::new(r"(^|[^(])\bhttps?://\S+").expect("url pattern"),
    wiki_edit: Regex::new(r"\[edit\]").expect("edit pattern"),
    wiki_cite: Regex::new(r"\[\d+\]").expect("citation pattern"),
    skip_line: Regex::new(r"(?m)^Skip to main content$").expect("skip pattern"),
    slide: Regex::new(r"Slide \d+ of \d+").expect("slide pattern"),
    cookie_header: Regex::new(r"^#{1,3} Cookie (?:policy|settings)").expect("cookie pattern"),
    multi_newline: Regex::new(r"\n{3,}").expect("newline pattern"),
    multi_space: Regex::new(r"[ \t]{2,}").expect("space pattern"),
});

/// Clean fetched markdown; `None` when too little text survives
pub fn clean_text(raw: &str) -> Option<String> {
    let rules = &*RULES;

    let text = rules.image.replace_all(raw, "");
    let text = rules.bare_url.replace_all(&text, "$1");
    let text = rules.wiki_edit.replace_all(&text, "");
    let text = rules.wiki_cite.replace_all(&text, "");
    let text = rules.skip_line.replace_all(&text, "");
    let text = rules.slide.replace_all(&text, "");
    let text = strip_cookie_sections(&text, &rules.cookie_header);
    let text = rules.multi_newline.replace_all(&text, "\n\n");
    let text = rules.multi_space.replace_all(&text, " ");
    let text = text.trim();

    if text.chars().count() < MIN_LENGTH {
        return None;
    }

    Some(truncate_chars(text, MAX_LENGTH))
}

/// Drop cookie policy sections up to the next header line
fn strip_cookie_sections(text: &str, cookie_header: &Regex) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;

    for line in text.split('\n') {
        if cookie_header.is_match(line) {
            skipping = true;
            continue;
        }
        if skipping && line.starts_with('#') {
            skipping = false;
        }
        if !skipping {
            kept.push(line);
        }
    }

    kept.join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
