//! Company identity keys

use crate::error::{RagError, RagResult};

/// Normalize a company name into its identity key
///
/// Trims, lowercases, collapses inner whitespace into `-` and drops anything
/// outside `[a-z0-9._-]`, so the key is safe inside store predicates and paths.
pub fn normalize_company(name: &str) -> RagResult<String> {
    let lowered = name.trim().to_lowercase();

    let slug: String = lowered
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();

    let slug = slug.trim_matches(|c| c == '-' || c == '.').to_string();

    if slug.is_empty() {
        return Err(RagError::Validation(format!(
            "company name '{}' is empty after normalization",
            name
        )));
    }

    Ok(slug)
}
