//! llama.cpp backend via `llama-cpp-2`
//!
//! Loads GGUF models and runs embedding-mode forward passes. Only options the caller set are
//! applied; everything else keeps llama.cpp's defaults. Each forward pass gets its own native
//! context built from the options captured at registration.

use super::{Backend, Batch, InferenceContext, LanguageModel, PoolingType, SeqId, TokenId};
use crate::options::{ContextOptions, ModelOptions, RopeScaling};
use crate::{LembedError, Result};
use llama_cpp_2::context::params::{LlamaContextParams, LlamaPoolingType, RopeScalingType};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend as NativeBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::token::LlamaToken;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Smallest physical batch a pass is given, llama.cpp's own default
const MIN_UBATCH: u32 = 512;

/// Process-wide llama.cpp runtime. Create it once and share it.
pub struct LlamaBackend {
    native: Arc<NativeBackend>,
}

impl LlamaBackend {
    pub fn init() -> Result<Self> {
        let mut native = NativeBackend::init().map_err(|e| {
            LembedError::BackendFailure(format!("failed to initialize llama backend: {}", e))
        })?;
        native.void_logs();
        Ok(Self {
            native: Arc::new(native),
        })
    }
}

impl Backend for LlamaBackend {
    fn load_model(&self, path: &Path, options: &ModelOptions) -> Result<Box<dyn LanguageModel>> {
        if !path.exists() {
            return Err(LembedError::BackendFailure(format!(
                "failed to load model from {}: file does not exist",
                path.display()
            )));
        }

        let mut params = LlamaModelParams::default();
        if let Some(n) = options.n_gpu_layers {
            // Negative means "offload everything"
            params = params.with_n_gpu_layers(u32::try_from(n).unwrap_or(u32::MAX));
        }

        let model = LlamaModel::load_from_file(&self.native, path, &params).map_err(|e| {
            LembedError::BackendFailure(format!(
                "failed to load model from {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            path = %path.display(),
            n_vocab = model.n_vocab(),
            n_embd = model.n_embd_out(),
            "Loaded GGUF model"
        );

        Ok(Box::new(LlamaLanguageModel {
            model: Arc::new(model),
            native: Arc::clone(&self.native),
        }))
    }
}

struct LlamaLanguageModel {
    model: Arc<LlamaModel>,
    native: Arc<NativeBackend>,
}

impl LlamaLanguageModel {
    fn vocab_token(&self, token: TokenId) -> Result<LlamaToken> {
        let n_tokens = self.model.vocab().n_tokens();
        if (0..n_tokens).contains(&token) {
            Ok(LlamaToken::new(token))
        } else {
            Err(LembedError::InvalidArgument(format!(
                "token id {} is not in the vocabulary (size {})",
                token, n_tokens
            )))
        }
    }
}

impl LanguageModel for LlamaLanguageModel {
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> Result<i32> {
        // llama_tokenize takes the text length as an int32
        if i32::try_from(text.len()).is_err() {
            return Err(LembedError::InvalidArgument(format!(
                "text of {} bytes is too large to tokenize",
                text.len()
            )));
        }

        let tokens = self
            .model
            .vocab()
            .tokenize(text.as_bytes(), add_special, parse_special);
        let n = i32::try_from(tokens.len()).map_err(|_| {
            LembedError::BackendFailure(format!("{} tokens overflow the token count", tokens.len()))
        })?;

        if out.len() < tokens.len() {
            return Ok(-n);
        }
        for (slot, token) in out.iter_mut().zip(&tokens) {
            *slot = token.0;
        }
        Ok(n)
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        let token = self.vocab_token(token)?;
        // Control tokens render as nothing
        Ok(self.model.vocab().token_to_piece(token, false, None))
    }

    fn token_score(&self, token: TokenId) -> Result<f32> {
        let token = self.vocab_token(token)?;
        Ok(self.model.vocab().score(token))
    }

    fn embedding_width(&self) -> usize {
        usize::try_from(self.model.n_embd_out()).unwrap_or(0)
    }

    fn size_bytes(&self) -> u64 {
        self.model.size()
    }

    fn new_context(&self, options: &ContextOptions) -> Result<Box<dyn InferenceContext>> {
        if let Some(seed) = options.seed {
            // Seeds only drive sampling, which embedding passes never do
            debug!(seed, "Ignoring seed for llama embedding context");
        }

        // Fail registration now rather than on the first embedding
        open_context(&self.model, &self.native, context_params(options, 1))?;

        Ok(Box::new(LlamaSession {
            model: Arc::clone(&self.model),
            native: Arc::clone(&self.native),
            options: options.clone(),
            pooling: options.pooling.unwrap_or(PoolingType::Unspecified),
            last_output: None,
            pooled: HashMap::new(),
        }))
    }
}

fn open_context<'m>(
    model: &'m LlamaModel,
    native: &NativeBackend,
    params: LlamaContextParams,
) -> Result<LlamaContext<'m>> {
    model.new_context(native, params).map_err(|e| {
        LembedError::BackendFailure(format!("failed to create inference context: {}", e))
    })
}

/// Embedding-mode parameters sized so `n_tokens` fit in one physical batch
fn context_params(options: &ContextOptions, n_tokens: u32) -> LlamaContextParams {
    let n_batch = n_tokens.max(MIN_UBATCH);
    let mut params = LlamaContextParams::default()
        .with_embeddings(true)
        .with_n_batch(n_batch)
        .with_n_ubatch(n_batch);

    if let Some(n_ctx) = options.context_size {
        params = params.with_n_ctx(NonZeroU32::new(n_ctx));
    }
    if let Some(scaling) = options.rope_scaling {
        params = params.with_rope_scaling_type(rope_scaling_type(scaling));
    }
    if let Some(scale) = options.rope_freq_scale {
        params = params.with_rope_freq_scale(scale);
    }
    params.with_pooling_type(pooling_type(
        options.pooling.unwrap_or(PoolingType::Unspecified),
    ))
}

fn rope_scaling_type(scaling: RopeScaling) -> RopeScalingType {
    match scaling {
        RopeScaling::None => RopeScalingType::None,
        RopeScaling::Linear => RopeScalingType::Linear,
        RopeScaling::Yarn => RopeScalingType::Yarn,
    }
}

fn pooling_type(pooling: PoolingType) -> LlamaPoolingType {
    match pooling {
        PoolingType::Unspecified => LlamaPoolingType::Unspecified,
        PoolingType::None => LlamaPoolingType::None,
        PoolingType::Mean => LlamaPoolingType::Mean,
        PoolingType::Cls => LlamaPoolingType::Cls,
        PoolingType::Last => LlamaPoolingType::Last,
        PoolingType::Rank => LlamaPoolingType::Rank,
    }
}

/// Outputs of the last forward pass, copied out of its native context
struct LlamaSession {
    model: Arc<LlamaModel>,
    native: Arc<NativeBackend>,
    options: ContextOptions,
    pooling: PoolingType,
    last_output: Option<Vec<f32>>,
    pooled: HashMap<SeqId, Vec<f32>>,
}

impl InferenceContext for LlamaSession {
    fn pooling(&self) -> PoolingType {
        self.pooling
    }

    fn clear_kv_cache(&mut self) {
        // Every decode starts from a fresh native context, so its cache is already empty
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        self.last_output = None;
        self.pooled.clear();

        let Ok(n_tokens) = u32::try_from(batch.len()) else {
            warn!(tokens = batch.len(), "batch too large for llama");
            return -1;
        };
        if n_tokens == 0 {
            return -1;
        }

        let model = Arc::clone(&self.model);
        let mut context =
            match open_context(&model, &self.native, context_params(&self.options, n_tokens)) {
                Ok(context) => context,
                Err(e) => {
                    warn!(error = %e, "llama context for forward pass");
                    return -1;
                }
            };

        let mut native = LlamaBatch::new(batch.len(), 1);
        for i in 0..batch.len() {
            let added = native.add(
                LlamaToken::new(batch.tokens()[i]),
                batch.positions()[i],
                &[batch.seq_ids()[i]],
                batch.outputs()[i],
            );
            if let Err(e) = added {
                warn!(error = %e, "failed to fill llama batch");
                return -1;
            }
        }

        if let Err(e) = context.decode(&mut native) {
            warn!(error = %e, "llama decode failed");
            return -1;
        }

        if matches!(self.pooling, PoolingType::None | PoolingType::Unspecified) {
            self.last_output = batch
                .last_output()
                .and_then(|i| i32::try_from(i).ok())
                .and_then(|i| context.embeddings_ith(i).ok())
                .map(<[f32]>::to_vec);
        }
        if self.pooling != PoolingType::None {
            let mut seq_ids = batch.seq_ids().to_vec();
            seq_ids.sort_unstable();
            seq_ids.dedup();
            for seq_id in seq_ids {
                match context.embeddings_seq_ith(seq_id) {
                    Ok(embedding) => {
                        self.pooled.insert(seq_id, embedding.to_vec());
                    }
                    Err(e) => debug!(seq_id, error = %e, "no pooled llama embedding"),
                }
            }
        }
        0
    }

    fn embeddings(&self) -> Option<&[f32]> {
        self.last_output.as_deref()
    }

    fn sequence_embeddings(&self, seq_id: SeqId) -> Option<&[f32]> {
        match self.pooled.get(&seq_id) {
            Some(embedding) => Some(embedding),
            // The model file declares no pooling
            None if self.pooling == PoolingType::Unspecified => self.embeddings(),
            None => None,
        }
    }
}
