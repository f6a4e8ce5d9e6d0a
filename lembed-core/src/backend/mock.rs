//! Deterministic in-process backend
//!
//! Tokenizes on word and punctuation boundaries the way SentencePiece-style vocabularies
//! render pieces: every word piece carries a leading space as its word-boundary marker,
//! punctuation pieces are bare, and the begin/end-of-sequence tokens have empty pieces.
//! Token vectors are derived from a hash of the token id, so results are reproducible.

use super::{Backend, Batch, InferenceContext, LanguageModel, PoolingType, SeqId, TokenId};
use crate::options::{ContextOptions, ModelOptions};
use crate::{LembedError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const BOS_TOKEN: TokenId = 1;
pub const EOS_TOKEN: TokenId = 2;
const FIRST_PIECE_TOKEN: TokenId = 3;

/// Configuration for the mock backend
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Embedding width reported by every model
    pub embedding_dim: usize,
    /// Pooling declared by the "model file"
    pub pooling: PoolingType,
    /// Make every context creation fail
    pub fail_context: bool,
    /// Make every forward pass produce all-zero vectors
    pub zero_output: bool,
    /// Emit non-ASCII letters as one piece per UTF-8 byte, like byte-fallback vocabularies
    pub byte_fallback: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            pooling: PoolingType::Mean,
            fail_context: false,
            zero_output: false,
            byte_fallback: false,
        }
    }
}

/// Backend whose models are plain files on disk (their contents are ignored)
pub struct MockBackend {
    config: MockConfig,
    live_models: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            live_models: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of models loaded through this backend and not yet released
    pub fn live_models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

impl Backend for MockBackend {
    fn load_model(&self, path: &Path, options: &ModelOptions) -> Result<Box<dyn LanguageModel>> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            LembedError::BackendFailure(format!(
                "failed to load model from {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(
            path = %path.display(),
            n_gpu_layers = ?options.n_gpu_layers,
            "Loading mock model"
        );

        self.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockModel {
            config: self.config.clone(),
            size: metadata.len(),
            vocab: Mutex::new(Vocab::default()),
            live_models: Arc::clone(&self.live_models),
        }))
    }
}

#[derive(Default)]
struct Vocab {
    pieces: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, TokenId>,
}

impl Vocab {
    fn intern(&mut self, piece: Vec<u8>) -> TokenId {
        if let Some(&id) = self.ids.get(&piece) {
            return id;
        }
        let id = FIRST_PIECE_TOKEN + self.pieces.len() as TokenId;
        self.pieces.push(piece.clone());
        self.ids.insert(piece, id);
        id
    }

    fn piece(&self, token: TokenId) -> Option<&[u8]> {
        let index = usize::try_from(token.checked_sub(FIRST_PIECE_TOKEN)?).ok()?;
        self.pieces.get(index).map(Vec::as_slice)
    }
}

struct MockModel {
    config: MockConfig,
    size: u64,
    // Grows as new words are seen
    vocab: Mutex<Vocab>,
    live_models: Arc<AtomicUsize>,
}

impl MockModel {
    /// Split text into word pieces (with a leading space marker) and punctuation pieces
    fn split_pieces(text: &str, byte_fallback: bool) -> Vec<Vec<u8>> {
        let mut pieces = Vec::new();
        let mut word = String::new();

        for ch in text.chars() {
            if ch.is_alphanumeric() && !(byte_fallback && !ch.is_ascii()) {
                word.push(ch);
                continue;
            }
            Self::push_word(&mut pieces, &mut word);
            if ch.is_alphanumeric() {
                let mut buf = [0u8; 4];
                pieces.extend(ch.encode_utf8(&mut buf).bytes().map(|b| vec![b]));
            } else if !ch.is_whitespace() {
                pieces.push(ch.to_string().into_bytes());
            }
        }
        Self::push_word(&mut pieces, &mut word);

        pieces
    }

    fn push_word(pieces: &mut Vec<Vec<u8>>, word: &mut String) {
        if !word.is_empty() {
            pieces.push(format!(" {}", word).into_bytes());
            word.clear();
        }
    }
}

impl LanguageModel for MockModel {
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        _parse_special: bool,
    ) -> Result<i32> {
        let mut vocab = self.vocab.lock().unwrap_or_else(PoisonError::into_inner);

        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(
            Self::split_pieces(text, self.config.byte_fallback)
                .into_iter()
                .map(|piece| vocab.intern(piece)),
        );
        if add_special {
            tokens.push(EOS_TOKEN);
        }

        let n = i32::try_from(tokens.len()).map_err(|_| {
            LembedError::BackendFailure(format!("{} tokens overflow the token count", tokens.len()))
        })?;
        if out.len() < tokens.len() {
            return Ok(-n);
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(n)
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        if token == BOS_TOKEN || token == EOS_TOKEN {
            return Ok(Vec::new());
        }
        let vocab = self.vocab.lock().unwrap_or_else(PoisonError::into_inner);
        vocab
            .piece(token)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                LembedError::InvalidArgument(format!("token id {} is not in the vocabulary", token))
            })
    }

    fn token_score(&self, token: TokenId) -> Result<f32> {
        if token == BOS_TOKEN || token == EOS_TOKEN {
            return Ok(0.0);
        }
        let vocab = self.vocab.lock().unwrap_or_else(PoisonError::into_inner);
        match vocab.piece(token) {
            Some(_) => Ok(-(token as f32)),
            None => Err(LembedError::InvalidArgument(format!(
                "token id {} is not in the vocabulary",
                token
            ))),
        }
    }

    fn embedding_width(&self) -> usize {
        self.config.embedding_dim
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn new_context(&self, options: &ContextOptions) -> Result<Box<dyn InferenceContext>> {
        if self.config.fail_context {
            return Err(LembedError::BackendFailure(
                "failed to create inference context".to_string(),
            ));
        }

        let pooling = match options.pooling {
            Some(PoolingType::Unspecified) | None => self.config.pooling,
            Some(pooling) => pooling,
        };

        Ok(Box::new(MockContext {
            dim: self.config.embedding_dim,
            zero_output: self.config.zero_output,
            pooling,
            kv_tokens: 0,
            last_output: None,
            pooled: HashMap::new(),
        }))
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        self.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockContext {
    dim: usize,
    zero_output: bool,
    pooling: PoolingType,
    /// Tokens held in the key/value cache
    kv_tokens: usize,
    last_output: Option<Vec<f32>>,
    pooled: HashMap<SeqId, Vec<f32>>,
}

impl MockContext {
    /// Deterministic per-token hidden state
    fn token_vector(&self, token: TokenId) -> Vec<f32> {
        if self.zero_output {
            return vec![0.0; self.dim];
        }
        let hash = (token as u64)
            .wrapping_add(1)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (0..self.dim)
            .map(|i| {
                let val = ((hash.wrapping_mul(i as u64 + 1) >> 17) % 1000) as f32 / 1000.0 - 0.5;
                val / (self.dim as f32).sqrt()
            })
            .collect()
    }

    fn pool(&self, batch: &Batch, seq_id: SeqId) -> Option<Vec<f32>> {
        let tokens: Vec<TokenId> = batch
            .tokens()
            .iter()
            .zip(batch.seq_ids())
            .filter(|(_, s)| **s == seq_id)
            .map(|(&t, _)| t)
            .collect();

        match self.pooling {
            PoolingType::None => None,
            PoolingType::Cls | PoolingType::Rank => tokens.first().map(|&t| self.token_vector(t)),
            PoolingType::Last => tokens.last().map(|&t| self.token_vector(t)),
            PoolingType::Mean | PoolingType::Unspecified => {
                if tokens.is_empty() {
                    return None;
                }
                let mut sum = vec![0.0f32; self.dim];
                for &t in &tokens {
                    for (acc, v) in sum.iter_mut().zip(self.token_vector(t)) {
                        *acc += v;
                    }
                }
                let n = tokens.len() as f32;
                sum.iter_mut().for_each(|x| *x /= n);
                Some(sum)
            }
        }
    }
}

impl InferenceContext for MockContext {
    fn pooling(&self) -> PoolingType {
        self.pooling
    }

    fn clear_kv_cache(&mut self) {
        self.kv_tokens = 0;
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        if batch.is_empty() {
            return -1;
        }
        // Positions must continue the cached sequence
        if batch.positions()[0] as usize != self.kv_tokens {
            return 1;
        }

        self.last_output = batch
            .last_output()
            .map(|i| self.token_vector(batch.tokens()[i]));

        let mut seq_ids = batch.seq_ids().to_vec();
        seq_ids.dedup();
        self.pooled = seq_ids
            .into_iter()
            .filter_map(|seq| self.pool(batch, seq).map(|v| (seq, v)))
            .collect();

        self.kv_tokens += batch.len();
        0
    }

    fn embeddings(&self) -> Option<&[f32]> {
        self.last_output.as_deref()
    }

    fn sequence_embeddings(&self, seq_id: SeqId) -> Option<&[f32]> {
        self.pooled.get(&seq_id).map(Vec::as_slice)
    }
}
