//! Inference backend boundary
//!
//! The registry, the embedding engine and the chunker only talk to a language model through
//! these traits. `MockBackend` is a deterministic in-process implementation; the llama.cpp
//! implementation lives behind the `llama` cargo feature.

#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;

#[cfg(feature = "llama")]
pub use llama::LlamaBackend;
pub use mock::{MockBackend, MockConfig};

use crate::options::{ContextOptions, ModelOptions};
use crate::{LembedError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Vocabulary token id
pub type TokenId = i32;

/// Identifier grouping tokens of one logical input within a batch
pub type SeqId = i32;

/// How the backend reduces per-token hidden states to one vector per sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// Use whatever the model file declares
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

impl FromStr for PoolingType {
    type Err = LembedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "none" => Ok(Self::None),
            "mean" => Ok(Self::Mean),
            "cls" => Ok(Self::Cls),
            "last" => Ok(Self::Last),
            "rank" => Ok(Self::Rank),
            other => Err(LembedError::InvalidArgument(format!(
                "unknown pooling_type '{}', expected none, mean, cls, last or rank",
                other
            ))),
        }
    }
}

/// Loads models from files
pub trait Backend: Send + Sync {
    /// Load the model at `path`, applying only the options that are set
    fn load_model(&self, path: &Path, options: &ModelOptions) -> Result<Box<dyn LanguageModel>>;
}

/// A loaded model: vocabulary, tokenizer and weights
pub trait LanguageModel: Send {
    /// Tokenize `text` into `out`.
    ///
    /// Returns the number of tokens written. When `out` is too small nothing is written and
    /// the negated required capacity is returned instead. `Err` is reserved for inputs the
    /// tokenizer cannot process at all.
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> Result<i32>;

    /// Exact surface bytes of a single token (empty for control tokens)
    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    /// Vocabulary score assigned to a token
    fn token_score(&self, token: TokenId) -> Result<f32>;

    /// Width of the model's embedding vectors
    fn embedding_width(&self) -> usize;

    /// Size of the loaded weights in bytes
    fn size_bytes(&self) -> u64;

    /// Create an inference context configured for embedding output
    fn new_context(&self, options: &ContextOptions) -> Result<Box<dyn InferenceContext>>;
}

/// Per-model inference state (key/value cache and output buffers)
pub trait InferenceContext: Send {
    fn pooling(&self) -> PoolingType;

    /// Drop any incremental-decoding state
    fn clear_kv_cache(&mut self);

    /// Run one forward pass over `batch`. Zero means success.
    fn decode(&mut self, batch: &Batch) -> i32;

    /// Whole-sequence output of the last decode, used when pooling is `None`
    fn embeddings(&self) -> Option<&[f32]>;

    /// Pooled output for one sequence of the last decode
    fn sequence_embeddings(&self, seq_id: SeqId) -> Option<&[f32]>;
}

/// Tokens submitted to one forward pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<i32>,
    seq_ids: Vec<SeqId>,
    outputs: Vec<bool>,
}

impl Batch {
    /// Allocate an empty batch able to hold `capacity` tokens
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut batch = Self::default();
        batch
            .tokens
            .try_reserve_exact(capacity)
            .map_err(|e| LembedError::out_of_memory("batch tokens", e))?;
        batch
            .positions
            .try_reserve_exact(capacity)
            .map_err(|e| LembedError::out_of_memory("batch positions", e))?;
        batch
            .seq_ids
            .try_reserve_exact(capacity)
            .map_err(|e| LembedError::out_of_memory("batch sequence ids", e))?;
        batch
            .outputs
            .try_reserve_exact(capacity)
            .map_err(|e| LembedError::out_of_memory("batch output flags", e))?;
        Ok(batch)
    }

    /// Build a batch holding one sequence at positions `0..n`.
    ///
    /// Only the final position requests output, which is what last-token pooling reads.
    pub fn single_sequence(tokens: &[TokenId], seq_id: SeqId) -> Result<Self> {
        let mut batch = Self::with_capacity(tokens.len())?;
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            let pos = i32::try_from(i).map_err(|_| {
                LembedError::InvalidArgument(format!("{} tokens do not fit in a batch", tokens.len()))
            })?;
            batch.add(token, pos, seq_id, i == last);
        }
        Ok(batch)
    }

    pub fn add(&mut self, token: TokenId, pos: i32, seq_id: SeqId, output: bool) {
        self.tokens.push(token);
        self.positions.push(pos);
        self.seq_ids.push(seq_id);
        self.outputs.push(output);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn positions(&self) -> &[i32] {
        &self.positions
    }

    pub fn seq_ids(&self) -> &[SeqId] {
        &self.seq_ids
    }

    pub fn outputs(&self) -> &[bool] {
        &self.outputs
    }

    /// Index of the last position that requests output
    pub fn last_output(&self) -> Option<usize> {
        self.outputs.iter().rposition(|&o| o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sequence_layout() {
        let batch = Batch::single_sequence(&[101, 7592, 2088, 102], 0).unwrap();

        assert_eq!(batch.len(), 4);
        assert_eq!(batch.tokens(), &[101, 7592, 2088, 102]);
        assert_eq!(batch.positions(), &[0, 1, 2, 3]);
        assert_eq!(batch.seq_ids(), &[0, 0, 0, 0]);
        assert_eq!(batch.outputs(), &[false, false, false, true]);
        assert_eq!(batch.last_output(), Some(3));
    }

    #[test]
    fn test_single_sequence_empty() {
        let batch = Batch::single_sequence(&[], 0).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.last_output(), None);
    }

    #[test]
    fn test_pooling_type_from_str() {
        assert_eq!("MEAN".parse::<PoolingType>().unwrap(), PoolingType::Mean);
        assert_eq!("none".parse::<PoolingType>().unwrap(), PoolingType::None);
        assert!("max".parse::<PoolingType>().is_err());
    }
}
