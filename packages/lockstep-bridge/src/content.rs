//! Content canonicalisation, hashing and chunking
//!
//! The canonical form of a document is its UTF-8 content with line endings
//! normalised to LF; nothing else is touched. The chunker is pure over
//! `(canonical_content, chunk_size, overlap)`: no time, no rng, no locale.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Normalise CRLF and lone CR to LF.
pub fn canonicalize(content: &str) -> Cow<'_, str> {
    if !content.contains('\r') {
        return Cow::Borrowed(content);
    }
    Cow::Owned(content.replace("\r\n", "\n").replace('\r', "\n"))
}

/// SHA-256 of the canonical bytes, lowercase hex.
pub fn content_hash(content: &str) -> String {
    let canonical = canonicalize(content);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Chunk id for `(doc_id, index)`.
pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("{doc_id}_chunk_{index}")
}

/// One deterministic window of a document's canonical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPiece {
    pub id: String,
    pub index: usize,
    pub text: String,
}

/// Deterministic overlapping-window chunker.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(BridgeError::validation("chunk_size must be positive"));
        }
        if overlap >= chunk_size {
            return Err(BridgeError::validation(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split a document into character windows. Windows advance by
    /// `chunk_size - overlap`; the final short window is kept. Empty
    /// content yields no chunks.
    pub fn split(&self, doc_id: &str, content: &str) -> Vec<ChunkPiece> {
        let canonical = canonicalize(content);
        let chars: Vec<char> = canonical.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let step = self.chunk_size - self.overlap;
        let mut pieces = Vec::new();
        let mut start = 0;
        let mut index = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            pieces.push(ChunkPiece {
                id: chunk_id(doc_id, index),
                index,
                text: chars[start..end].iter().collect(),
            });
            if end == chars.len() {
                break;
            }
            start += step;
            index += 1;
        }
        pieces
    }
}
