//! Two-pass tokenization
//!
//! The backend is first asked to tokenize into an empty buffer, which it answers with the
//! negated capacity it needs. The buffer is then allocated and filled in a second call.

use crate::backend::{LanguageModel, TokenId};
use crate::{LembedError, Result};
use tracing::debug;

/// Tokenize `text`, including the model's begin/end-of-sequence markers
pub fn tokenize(model: &dyn LanguageModel, text: &str) -> Result<Vec<TokenId>> {
    let estimate = model.tokenize(text, &mut [], true, true)?;
    if estimate >= 0 {
        return Err(LembedError::BackendFailure(format!(
            "tokenizer did not report a required capacity (returned {})",
            estimate
        )));
    }

    let capacity = estimate.unsigned_abs() as usize;
    let mut tokens: Vec<TokenId> = Vec::new();
    tokens
        .try_reserve_exact(capacity)
        .map_err(|e| LembedError::out_of_memory("token buffer", e))?;
    tokens.resize(capacity, 0);

    let filled = model.tokenize(text, &mut tokens, true, true)?;
    if usize::try_from(filled).ok() != Some(capacity) {
        return Err(LembedError::BackendFailure(format!(
            "tokenizer filled {} tokens, expected {}",
            filled, capacity
        )));
    }

    debug!(bytes = text.len(), tokens = capacity, "Tokenized text");
    Ok(tokens)
}
