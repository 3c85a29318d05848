//! Text Chunking Module
//!
//! Markdown-aware splitting into bounded passages. A "token" is one
//! whitespace-separated word, so bounds are stable without a model-specific
//! tokenizer.
//!
//! Boundaries are found top-down (header sections, paragraphs, sentences)
//! and only fall back to hard word cuts for oversized sentences. Splitting is
//! pure: the same text and bounds always give the same chunks and ids.

use serde::Deserialize;

use crate::error::{RagError, RagResult};
use crate::knowledge::store::{content_hash, stable_uuid, Document};
use crate::knowledge::vector::Chunk;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunk size bounds, in whitespace tokens
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Lower bound for every chunk but the last of a document
    pub min_tokens: usize,
    /// Upper bound, overlap included
    pub max_tokens: usize,
    /// Trailing words of the previous chunk repeated at the start of the next
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_tokens: 256,
            max_tokens: 512,
            overlap_tokens: 0,
        }
    }
}

impl ChunkConfig {
    /// Same bounds with a small overlap between neighbours
    pub fn with_overlap() -> Self {
        Self {
            overlap_tokens: 32,
            ..Self::default()
        }
    }

    /// Short passages for small corpora and tests
    pub fn compact() -> Self {
        Self {
            min_tokens: 32,
            max_tokens: 64,
            overlap_tokens: 0,
        }
    }

    pub fn validate(&self) -> RagResult<()> {
        if self.max_tokens == 0 {
            return Err(RagError::Configuration("chunking.max_tokens must be > 0".into()));
        }
        if self.min_tokens > self.max_tokens {
            return Err(RagError::Configuration(format!(
                "chunking.min_tokens ({}) exceeds max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(RagError::Configuration(format!(
                "chunking.overlap_tokens ({}) must be below max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }

    /// Largest body a chunk may carry once the overlap prefix is added
    fn body_max(&self) -> usize {
        self.max_tokens - self.overlap_tokens
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// Passage produced by a [`Chunker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    /// Token offset of the first token (overlap included)
    pub offset: usize,
    pub position: usize,
    pub tokens: usize,
}

/// Text chunking strategy
pub trait Chunker: Send + Sync {
    /// Split text into ordered passages; blank input yields none
    fn chunk(&self, text: &str) -> Vec<TextChunk>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// MarkdownChunker
// ============================================================================

/// Contiguous run of tokens, `start` counted from the document start
#[derive(Debug, Clone)]
struct Piece {
    text: String,
    tokens: usize,
    start: usize,
}

impl Piece {
    fn new(text: &str, start: usize) -> Self {
        let text = text.trim().to_string();
        let tokens = count_tokens(&text);
        Self { text, tokens, start }
    }

    /// Cut after `n` tokens; the head is re-joined with single spaces
    fn split_at(&self, n: usize) -> (Piece, Piece) {
        let words: Vec<&str> = self.text.split_whitespace().collect();
        let head = Piece {
            text: words[..n].join(" "),
            tokens: n,
            start: self.start,
        };
        let tail = Piece {
            text: words[n..].join(" "),
            tokens: words.len() - n,
            start: self.start + n,
        };
        (head, tail)
    }
}

/// Chunk body under construction
#[derive(Default)]
struct Body {
    parts: Vec<String>,
    tokens: usize,
    start: usize,
}

impl Body {
    fn push(&mut self, piece: Piece) {
        if self.parts.is_empty() {
            self.start = piece.start;
        }
        self.tokens += piece.tokens;
        self.parts.push(piece.text);
    }

    fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Markdown-aware chunker
///
/// - header boundaries start new sections (headers inside code fences don't)
/// - oversized sections split on paragraphs, then sentences, then words
/// - small pieces are packed greedily up to the upper bound
pub struct MarkdownChunker {
    config: ChunkConfig,
}

impl MarkdownChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Split markdown into header-delimited sections
    fn split_sections(&self, text: &str) -> Vec<String> {
        let mut sections = Vec::new();
        let mut current = String::new();
        let mut in_code_block = false;

        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
            }

            if !in_code_block && is_header(line) && !current.trim().is_empty() {
                sections.push(current.trim().to_string());
                current = String::new();
            }

            current.push_str(line);
            current.push('\n');
        }

        if !current.trim().is_empty() {
            sections.push(current.trim().to_string());
        }

        sections
    }

    /// Break text into pieces no larger than the body limit
    fn split_pieces(&self, text: &str) -> Vec<Piece> {
        let body_max = self.config.body_max();
        let mut pieces = Vec::new();
        let mut cursor = 0;

        for section in self.split_sections(text) {
            let section = Piece::new(&section, cursor);
            cursor += section.tokens;

            if section.tokens <= body_max {
                pieces.push(section);
                continue;
            }

            let mut para_cursor = section.start;
            for para in section.text.split("\n\n") {
                let para = Piece::new(para, para_cursor);
                if para.tokens == 0 {
                    continue;
                }
                para_cursor += para.tokens;

                if para.tokens <= body_max {
                    pieces.push(para);
                    continue;
                }

                let mut sentence_cursor = para.start;
                for sentence in split_sentences(&para.text) {
                    let mut sentence = Piece::new(sentence, sentence_cursor);
                    sentence_cursor += sentence.tokens;

                    // hard cut
                    while sentence.tokens > body_max {
                        let (head, tail) = sentence.split_at(body_max);
                        pieces.push(head);
                        sentence = tail;
                    }
                    if sentence.tokens > 0 {
                        pieces.push(sentence);
                    }
                }
            }
        }

        pieces
    }

    /// Greedy packing of pieces into chunk bodies
    fn pack(&self, pieces: Vec<Piece>) -> Vec<Body> {
        let body_max = self.config.body_max();
        let min_first = self.config.min_tokens.min(body_max);
        let min_rest = self
            .config
            .min_tokens
            .saturating_sub(self.config.overlap_tokens)
            .min(body_max);

        let mut bodies: Vec<Body> = Vec::new();
        let mut current = Body::default();
        let mut pending: std::collections::VecDeque<Piece> = pieces.into();

        while let Some(piece) = pending.pop_front() {
            if current.tokens + piece.tokens <= body_max {
                current.push(piece);
                continue;
            }

            let floor = if bodies.is_empty() { min_first } else { min_rest };
            if current.tokens >= floor {
                bodies.push(std::mem::take(&mut current));
                pending.push_front(piece);
                continue;
            }

            // too small to stand alone: top up from the head of the next piece
            let room = body_max - current.tokens;
            let (head, tail) = piece.split_at(room);
            current.push(head);
            bodies.push(std::mem::take(&mut current));
            if tail.tokens > 0 {
                pending.push_front(tail);
            }
        }

        if !current.is_empty() {
            bodies.push(current);
        }

        bodies
    }

    fn render(&self, bodies: Vec<Body>) -> Vec<TextChunk> {
        let overlap = self.config.overlap_tokens;
        let mut chunks: Vec<TextChunk> = Vec::with_capacity(bodies.len());
        let mut previous: Option<String> = None;

        for (position, body) in bodies.into_iter().enumerate() {
            let text = body.parts.join("\n\n");

            let prefix: Vec<&str> = match (&previous, overlap) {
                (Some(prev), n) if n > 0 => {
                    let words: Vec<&str> = prev.split_whitespace().collect();
                    words[words.len().saturating_sub(n)..].to_vec()
                }
                _ => Vec::new(),
            };

            let chunk = if prefix.is_empty() {
                TextChunk {
                    text: text.clone(),
                    offset: body.start,
                    position,
                    tokens: body.tokens,
                }
            } else {
                TextChunk {
                    text: format!("{}\n{}", prefix.join(" "), text),
                    offset: body.start - prefix.len(),
                    position,
                    tokens: body.tokens + prefix.len(),
                }
            };

            chunks.push(chunk);
            previous = Some(text);
        }

        chunks
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let pieces = self.split_pieces(text);
        let bodies = self.pack(pieces);
        self.render(bodies)
    }

    fn name(&self) -> &'static str {
        "MarkdownChunker"
    }
}

// ============================================================================
// Chunk identity
// ============================================================================

/// Deterministic chunk id from `(document_id, offset, content hash)`
pub fn chunk_id(document_id: &str, offset: usize, text: &str) -> String {
    stable_uuid(&[document_id, &offset.to_string(), &content_hash(text)])
}

/// Chunk a stored document into payload records
pub fn chunk_document(document: &Document, chunker: &dyn Chunker) -> Vec<Chunk> {
    chunker
        .chunk(&document.content)
        .into_iter()
        .map(|piece| Chunk {
            chunk_id: chunk_id(&document.document_id, piece.offset, &piece.text),
            document_id: document.document_id.clone(),
            company: document.company.clone(),
            url: document.url.clone(),
            title: document.title.clone(),
            text: piece.text,
            position: piece.position as u32,
            offset: piece.offset as u32,
        })
        .collect()
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// ATX header line (`#` .. `######` followed by whitespace)
fn is_header(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && line[hashes..]
            .chars()
            .next()
            .map_or(false, char::is_whitespace)
}

/// Split after sentence terminators followed by whitespace
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut after_terminal = false;

    for (i, c) in text.char_indices() {
        if after_terminal && c.is_whitespace() {
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i;
        }
        after_terminal = matches!(c, '.' | '!' | '?');
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn small() -> MarkdownChunker {
        MarkdownChunker::new(ChunkConfig {
            min_tokens: 8,
            max_tokens: 16,
            overlap_tokens: 0,
        })
    }

    #[test]
    fn test_chunker_empty() {
        let chunker = MarkdownChunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t \n").is_empty());
    }

    #[test]
    fn test_chunker_small_text() {
        let chunker = MarkdownChunker::with_defaults();
        let chunks = chunker.chunk("# Header\n\nShort paragraph.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Header"));
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].position, 0);
    }

    #[test]
    fn test_chunks_respect_bounds() {
        let chunker = small();
        let text = format!(
            "# One\n\n{}\n\n# Two\n\n{}. {}.\n\n{}",
            words("a", 5),
            words("b", 12),
            words("c", 20),
            words("d", 3)
        );
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 2);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.position, i);
            assert!(chunk.tokens <= 16, "chunk {} has {} tokens", i, chunk.tokens);
            assert_eq!(chunk.tokens, count_tokens(&chunk.text));
            if i + 1 < chunks.len() {
                assert!(chunk.tokens >= 8, "chunk {} has {} tokens", i, chunk.tokens);
            }
        }
    }

    #[test]
    fn test_no_tokens_lost_without_overlap() {
        let chunker = small();
        let text = format!("{}\n\n{}. {}", words("x", 30), words("y", 7), words("z", 11));
        let chunks = chunker.chunk(&text);

        let rebuilt: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.text.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .collect();
        let original: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        assert_eq!(rebuilt, original);

        // offsets are contiguous
        let mut expected = 0;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected);
            expected += chunk.tokens;
        }
    }

    #[test]
    fn test_final_chunk_may_be_short() {
        let chunker = small();
        let chunks = chunker.chunk(&words("w", 19));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].tokens, 16);
        assert_eq!(chunks[1].tokens, 3);
    }

    #[test]
    fn test_overlap_prefixes_previous_words() {
        let chunker = MarkdownChunker::new(ChunkConfig {
            min_tokens: 8,
            max_tokens: 16,
            overlap_tokens: 4,
        });
        let chunks = chunker.chunk(&words("w", 30));
        assert!(chunks.len() >= 2);
        assert!(chunks[1].text.starts_with("w8 w9 w10 w11\n"));
        assert_eq!(chunks[1].offset, 8);
        for chunk in &chunks {
            assert!(chunk.tokens <= 16);
        }
    }

    #[test]
    fn test_code_block_headers_do_not_split() {
        let chunker = MarkdownChunker::with_defaults();
        let sections = chunker.split_sections("# A\n\n```\n# not a header\n```\n\ntext");
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("First one. Second one! Third? tail");
        assert_eq!(sentences, vec!["First one.", "Second one!", "Third?", "tail"]);
    }

    #[test]
    fn test_is_header() {
        assert!(is_header("# Title"));
        assert!(is_header("###### Deep"));
        assert!(!is_header("####### Too deep"));
        assert!(!is_header("#hashtag"));
        assert!(!is_header("plain"));
    }

    #[test]
    fn test_deterministic_boundaries_and_ids() {
        let chunker = MarkdownChunker::new(ChunkConfig::compact());
        let text = format!("# Intro\n\n{}\n\n## More\n\n{}", words("p", 90), words("q", 45));

        let doc = Document::new("acme", "https://acme.test/about", "About", &text, None);
        let first = chunk_document(&doc, &chunker);
        let second = chunk_document(&doc, &chunker);

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_chunk_id_depends_on_inputs() {
        let base = chunk_id("doc", 0, "text");
        assert_eq!(base, chunk_id("doc", 0, "text"));
        assert_ne!(base, chunk_id("doc", 1, "text"));
        assert_ne!(base, chunk_id("doc", 0, "other"));
        assert_ne!(base, chunk_id("doc2", 0, "text"));
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkConfig::default().validate().is_ok());
        assert!(ChunkConfig::with_overlap().validate().is_ok());

        let bad = ChunkConfig {
            min_tokens: 10,
            max_tokens: 10,
            overlap_tokens: 10,
        };
        assert!(bad.validate().is_err());
    }
}
