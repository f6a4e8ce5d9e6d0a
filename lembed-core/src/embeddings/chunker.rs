//! Token-aligned chunking
//!
//! Groups a text's tokens into fixed-size runs and maps each run back onto the exact bytes of
//! the source it came from. Chunk text is always a slice of the input, never a re-rendering of
//! the tokens, so whitespace, casing and punctuation survive untouched.

use super::tokenizer::tokenize;
use crate::backend::LanguageModel;
use crate::{LembedError, Result};
use serde::Serialize;
use tracing::debug;

/// A run of consecutive tokens and the source bytes they cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Position of this chunk within the text (0-based)
    pub index: usize,
    /// Exact source text, equal to `source[start..end]`
    pub text: String,
    /// Number of tokens grouped into this chunk
    pub token_count: usize,
    /// Byte offset where the chunk starts in the source
    pub start: usize,
    /// Byte offset one past the chunk's last byte
    pub end: usize,
}

/// Split `text` into chunks of `chunk_size` tokens.
///
/// Produces `ceil(tokens / chunk_size)` chunks. A token whose piece cannot be located in the
/// remaining text is an alignment failure.
pub fn chunk(model: &dyn LanguageModel, text: &str, chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(LembedError::InvalidArgument(
            "chunk_size must be at least 1".to_string(),
        ));
    }

    let tokens = tokenize(model, text)?;
    let count = tokens.len().div_ceil(chunk_size);

    let mut chunks = Vec::new();
    chunks
        .try_reserve_exact(count)
        .map_err(|e| LembedError::out_of_memory("chunk list", e))?;

    // Byte position of the scan. It can sit inside a character after a byte-fallback token,
    // so chunk boundaries are snapped forward to the next character boundary.
    let mut cursor = 0;
    let mut start = 0;
    for (index, group) in tokens.chunks(chunk_size).enumerate() {
        for &token in group {
            let piece = model.token_piece(token)?;
            if piece.is_empty() {
                continue;
            }
            cursor = align_piece(text, cursor, &piece).ok_or_else(|| {
                LembedError::BackendFailure(format!(
                    "token {} ({:?}) could not be aligned with the source text after byte {}",
                    token,
                    String::from_utf8_lossy(&piece),
                    cursor
                ))
            })?;
        }

        let end = ceil_char_boundary(text, cursor).max(start);
        chunks.push(Chunk {
            index,
            text: text[start..end].to_string(),
            token_count: group.len(),
            start,
            end,
        });
        start = end;
    }

    debug!(
        tokens = tokens.len(),
        chunk_size,
        chunks = chunks.len(),
        "Chunked text"
    );
    Ok(chunks)
}

/// Locate `piece` in `text` at or after `cursor` and return the byte offset just past it.
///
/// The scan is bounded by the end of `text`; `None` means the piece is not there.
///
/// A piece longer than one character starts with a word-boundary marker that is not in the
/// source. Matching starts from its second character and the marker is excluded from the
/// span length.
fn align_piece(text: &str, cursor: usize, piece: &[u8]) -> Option<usize> {
    let (marker_len, needle) = match std::str::from_utf8(piece) {
        Ok(s) => {
            let mut chars = s.char_indices();
            chars.next()?;
            match chars.next() {
                Some((offset, second)) => (offset, &piece[offset..offset + second.len_utf8()]),
                None => (0, piece),
            }
        }
        // Partial UTF-8 from a byte-fallback token: match its first raw byte
        Err(_) => (0, &piece[..1]),
    };

    let haystack = &text.as_bytes()[cursor..];
    let found = haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))?;

    Some((cursor + found + (piece.len() - marker_len)).min(text.len()))
}

/// Find the nearest valid UTF-8 character boundary at or after the given byte index
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
