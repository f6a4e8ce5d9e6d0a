//! Runtime configuration

use std::path::{Path, PathBuf};

/// Default number of tokens per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Configuration shared by the SQL functions and the CLI
#[derive(Debug, Clone)]
pub struct LembedConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Tokens per chunk when `lembed_chunks` is not given a `chunk_size`
    pub default_chunk_size: usize,
}

impl LembedConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Create with a custom default chunk size
    pub fn with_chunk_size(data_dir: impl AsRef<Path>, chunk_size: usize) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            default_chunk_size: chunk_size.max(1),
        }
    }

    /// Get models directory
    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Resolve a model path given to `lembed_model_from_file`.
    ///
    /// Existing paths are used as given. A relative path that does not exist is looked up
    /// under the models directory.
    pub fn resolve_model_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.exists() || path.is_absolute() {
            return path.to_path_buf();
        }
        let candidate = self.models_dir().join(path);
        if candidate.exists() {
            candidate
        } else {
            path.to_path_buf()
        }
    }
}

impl Default for LembedConfig {
    fn default() -> Self {
        Self::new(".")
    }
}
