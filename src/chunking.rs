//! Token-budgeted semantic chunking and deterministic chunk identities.
//!
//! Pages are split independently with `semchunk-rs`, so a chunk never straddles a page
//! boundary, and `sequence_index` counts chunks across the whole document. Token counting uses
//! `tiktoken-rs` for known encodings and models; the `whitespace` model (or any tokenizer that
//! cannot be loaded) falls back to counting whitespace-separated words. An optional overlap
//! prefixes each chunk with the tail of its predecessor while staying within the budget.
//!
//! A chunk's id is a UUIDv5 over the document id, its sequence index and the SHA-256 of its
//! text. The same document chunked with the same settings therefore always produces the same
//! ids, which is what makes index upserts of redelivered jobs overwrite instead of duplicate.

use crate::extraction::Page;
use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker as SemanticChunker;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};
use uuid::Uuid;

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Namespace for chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x4f1c_2b8e_96a3_4d57_8e0b_d0c5_7a61_3e29);

const WHITESPACE_MODEL: &str = "whitespace";

/// Errors produced while configuring the chunker.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// A zero token budget can never fit any text.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Model or encoding we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkerSettings {
    /// Hard upper bound on tokens per chunk.
    pub chunk_size: usize,
    /// Tokens of the previous chunk repeated at the start of the next.
    pub overlap: usize,
    /// Tokenizer model or encoding name, or `whitespace`.
    pub tokenizer_model: String,
}

/// One chunk of a document, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Deterministic identity.
    pub chunk_id: Uuid,
    /// Position across the whole document, from 0.
    pub sequence_index: u32,
    /// Page the chunk was cut from.
    pub page: u32,
    /// Chunk text.
    pub text: String,
}

/// Configured chunker, cheap to share between workers.
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    token_counter: TokenCounter,
}

impl Chunker {
    /// Build a chunker, loading the tokenizer once.
    pub fn new(settings: &ChunkerSettings) -> Result<Self, ChunkingError> {
        if settings.chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        let token_counter = build_token_counter(&settings.tokenizer_model)?;
        tracing::debug!(
            chunk_size = settings.chunk_size,
            overlap = settings.overlap,
            tokenizer = %settings.tokenizer_model,
            "Configured chunker"
        );
        Ok(Self {
            chunk_size: settings.chunk_size,
            overlap: settings.overlap,
            token_counter,
        })
    }

    /// Chunk every page of a document, assigning global sequence indexes and ids.
    pub fn chunk_pages(&self, document_id: &str, pages: &[Page]) -> Vec<ChunkSpan> {
        let mut spans = Vec::new();
        for page in pages {
            let texts = chunk_text_with_counter(
                &page.text,
                self.chunk_size,
                self.overlap,
                self.token_counter.clone(),
            );
            for text in texts {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let sequence_index = u32::try_from(spans.len()).unwrap_or(u32::MAX);
                spans.push(ChunkSpan {
                    chunk_id: chunk_id(document_id, sequence_index, trimmed),
                    sequence_index,
                    page: page.number,
                    text: trimmed.to_string(),
                });
            }
        }
        spans
    }
}

/// Deterministic id for a chunk.
pub fn chunk_id(document_id: &str, sequence_index: u32, text: &str) -> Uuid {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{document_id}:{sequence_index}:{digest}").as_bytes(),
    )
}

/// Build a token counter for a model or encoding name.
///
/// Unknown names fall back to `cl100k_base`; `whitespace` selects the word counter, as does a
/// tokenizer that fails to load.
fn build_token_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let normalized = model.trim();
    if normalized.eq_ignore_ascii_case(WHITESPACE_MODEL) {
        return Ok(default_token_counter());
    }
    match build_tiktoken_counter(normalized) {
        Ok(counter) => Ok(counter),
        Err(error) => {
            tracing::warn!(
                model = normalized,
                error = %error,
                "Tokenizer unavailable; falling back to whitespace counter"
            );
            Ok(default_token_counter())
        }
    }
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let target = if model.is_empty() { "cl100k_base" } else { model };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(model) {
        return candidate;
    }
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::warn!(
                model,
                error = %model_err,
                "Unknown tokenizer model; using 'cl100k_base'"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

fn default_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

fn chunk_text_with_counter(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    token_counter: TokenCounter,
) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let counter_for_chunker = token_counter.clone();
    let chunker = SemanticChunker::new(
        chunk_size,
        Box::new(move |segment: &str| counter_for_chunker.as_ref()(segment)),
    );
    let base_chunks = chunker.chunk(text);
    apply_overlap(base_chunks, chunk_size, overlap, &token_counter)
}

/// Prefix each chunk with a token-limited tail of the previous one, trimming from the front
/// so the result still fits `chunk_size`.
fn apply_overlap(
    chunks: Vec<String>,
    chunk_size: usize,
    overlap: usize,
    token_counter: &TokenCounter,
) -> Vec<String> {
    let effective_overlap = overlap.min(chunk_size.saturating_sub(1));
    if effective_overlap == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut overlapped = Vec::with_capacity(chunks.len());
    let mut previous: Option<String> = None;
    for current in chunks {
        let next = match previous.as_deref() {
            Some(prev) => build_overlapped_chunk(
                prev,
                &current,
                effective_overlap,
                chunk_size,
                token_counter,
            ),
            None => current.clone(),
        };
        overlapped.push(next);
        previous = Some(current);
    }
    overlapped
}

fn build_overlapped_chunk(
    previous: &str,
    current: &str,
    overlap: usize,
    chunk_size: usize,
    token_counter: &TokenCounter,
) -> String {
    let tail = tail_with_token_limit(previous, overlap, token_counter);
    let mut combined = String::with_capacity(tail.len() + current.len() + 1);

    if !tail.is_empty() {
        combined.push_str(tail);
        if !ends_with_whitespace(tail) && !starts_with_whitespace(current) {
            combined.push(' ');
        }
    }

    combined.push_str(current);
    trim_to_token_budget(&combined, chunk_size, token_counter).to_string()
}

fn tail_with_token_limit<'a>(
    text: &'a str,
    token_limit: usize,
    token_counter: &TokenCounter,
) -> &'a str {
    if token_limit == 0 {
        return "";
    }
    trim_to_token_budget(text, token_limit, token_counter)
}

/// Longest suffix of `text` (starting at a char boundary, leading whitespace trimmed) that
/// fits within `token_budget`.
fn trim_to_token_budget<'a>(
    text: &'a str,
    token_budget: usize,
    token_counter: &TokenCounter,
) -> &'a str {
    if token_budget == 0 {
        return "";
    }

    let trimmed_text = text.trim_start();
    if token_counter.as_ref()(trimmed_text) <= token_budget {
        return trimmed_text;
    }

    for (offset, _) in text.char_indices().skip(1) {
        let candidate = text[offset..].trim_start();
        if token_counter.as_ref()(candidate) <= token_budget {
            return candidate;
        }
    }

    ""
}

fn starts_with_whitespace(text: &str) -> bool {
    text.chars().next().is_some_and(char::is_whitespace)
}

fn ends_with_whitespace(text: &str) -> bool {
    text.chars().next_back().is_some_and(char::is_whitespace)
}
