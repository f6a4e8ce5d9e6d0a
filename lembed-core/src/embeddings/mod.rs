//! Text processing on top of a loaded model
//!
//! Tokenization, embedding generation and token-aligned chunking. Everything here is a
//! synchronous, single-call operation over a `LanguageModel` (and, for embeddings, its
//! `InferenceContext`).

pub mod chunker;
pub mod model;
pub mod tokenizer;

pub use chunker::{chunk, Chunk};
pub use model::{embed, normalize, to_le_bytes};
pub use tokenizer::tokenize;
