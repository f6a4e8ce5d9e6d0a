pub mod backend;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod options;
pub mod registry;
pub mod sqlite;

pub use backend::{Backend, InferenceContext, LanguageModel, MockBackend, MockConfig, PoolingType};
pub use config::LembedConfig;
pub use error::{LembedError, Result};
pub use options::{ContextOptions, ModelOptions, RopeScaling};
pub use registry::{ModelEntry, ModelHandle, ModelRegistry, SharedRegistry, MAX_MODELS};
