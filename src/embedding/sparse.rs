//! Sparse lexical encoder
//!
//! Documents get BM25 term-frequency saturation weights; queries get weight 1
//! per distinct term. IDF is applied by the vector store over the filtered
//! corpus at query time, so the product is BM25 over the current corpus state.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use sha2::{Digest, Sha256};

use crate::knowledge::SparseVector;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "such", "that",
        "the", "their", "then", "there", "these", "they", "this", "to", "was", "were", "will",
        "with",
    ]
    .into_iter()
    .collect()
});

/// Lowercase, split on non-alphanumeric, drop stop words and 1-char tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Stable `u32` id of a term
pub fn term_id(term: &str) -> u32 {
    let digest = Sha256::digest(term.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// BM25-style sparse encoder
#[derive(Debug, Clone)]
pub struct SparseEncoder {
    /// Term frequency saturation
    pub k1: f32,
    /// Length normalization strength
    pub b: f32,
    /// Reference document length in tokens
    pub avg_len: f32,
}

impl Default for SparseEncoder {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_len: 256.0,
        }
    }
}

impl SparseEncoder {
    pub fn encode_document(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return SparseVector::default();
        }

        let mut tf: HashMap<u32, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(term_id(token)).or_insert(0.0) += 1.0;
        }

        let len_norm = 1.0 - self.b + self.b * (tokens.len() as f32 / self.avg_len);
        SparseVector::from_pairs(
            tf.into_iter()
                .map(|(term, f)| (term, f * (self.k1 + 1.0) / (f + self.k1 * len_norm))),
        )
    }

    pub fn encode_query(&self, text: &str) -> SparseVector {
        let terms: HashSet<u32> = tokenize(text).iter().map(|t| term_id(t)).collect();
        SparseVector::from_pairs(terms.into_iter().map(|term| (term, 1.0)))
    }
}
