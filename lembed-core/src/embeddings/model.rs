//! Embedding generation
//!
//! One-shot forward pass over a single sequence, followed by L2 normalization.

use super::tokenizer::tokenize;
use crate::backend::{Batch, InferenceContext, LanguageModel, PoolingType, SeqId};
use crate::{LembedError, Result};
use tracing::debug;

/// Sequence id used for the single sequence of an embedding batch
const SEQUENCE_ID: SeqId = 0;

/// Embed `text` with a model and its context.
///
/// The returned vector has `model.embedding_width()` elements and unit Euclidean norm.
pub fn embed(
    model: &dyn LanguageModel,
    context: &mut dyn InferenceContext,
    text: &str,
) -> Result<Vec<f32>> {
    let tokens = tokenize(model, text)?;
    let batch = Batch::single_sequence(&tokens, SEQUENCE_ID)?;

    // Every call is a fresh sequence, never a continuation
    context.clear_kv_cache();

    let status = context.decode(&batch);
    if status != 0 {
        return Err(LembedError::BackendFailure(format!(
            "decode of {} tokens failed with status {}",
            batch.len(),
            status
        )));
    }

    let raw = if context.pooling() == PoolingType::None {
        context.embeddings()
    } else {
        context.sequence_embeddings(SEQUENCE_ID)
    }
    .ok_or_else(|| LembedError::BackendFailure("backend returned no embedding".to_string()))?;

    let dim = model.embedding_width();
    if raw.len() < dim {
        return Err(LembedError::BackendFailure(format!(
            "backend returned {} values, model width is {}",
            raw.len(),
            dim
        )));
    }

    debug!(tokens = tokens.len(), dim, pooling = ?context.pooling(), "Computed embedding");
    normalize(&raw[..dim])
}

/// L2-normalize `raw` into a freshly allocated vector
pub fn normalize(raw: &[f32]) -> Result<Vec<f32>> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(LembedError::BackendFailure(format!(
            "cannot normalize an embedding with norm {}",
            norm
        )));
    }

    let mut out = Vec::new();
    out.try_reserve_exact(raw.len())
        .map_err(|e| LembedError::out_of_memory("embedding", e))?;
    out.extend(raw.iter().map(|x| x / norm));
    Ok(out)
}

/// Little-endian float32 bytes, the layout vector indexes ingest
pub fn to_le_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}
