//! Model registry
//!
//! Owns every loaded model together with its inference context, keyed by a user-chosen name.
//! Slots are fixed in number and insert-only: once a model is registered it lives as long as
//! the registry does.
//!
//! A registry is not internally synchronized. Share it as a [`SharedRegistry`] and take the
//! lock for the duration of each call.

use crate::backend::{Backend, InferenceContext, LanguageModel, TokenId};
use crate::embeddings::{self, Chunk};
use crate::options::{ContextOptions, ModelOptions};
use crate::{LembedError, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Maximum number of models registered at once
pub const MAX_MODELS: usize = 16;

/// Name of the model used when a caller does not name one
pub const DEFAULT_MODEL: &str = "default";

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-process random id, so handles minted by hand never resolve
fn unguessable_id() -> u64 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(ID_COUNTER.fetch_add(1, Ordering::Relaxed));
    hasher.finish()
}

/// Registry shared between every SQL function and table of a connection
pub type SharedRegistry = Arc<Mutex<ModelRegistry>>;

/// Lock a shared registry
pub fn lock(registry: &SharedRegistry) -> Result<MutexGuard<'_, ModelRegistry>> {
    registry.lock().map_err(|_| {
        LembedError::InvalidOperation(
            "model registry is unusable after a panic in another call".to_string(),
        )
    })
}

/// Stable reference to one registered model.
///
/// Only valid against the registry that issued it; see [`ModelRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub registry: u64,
    pub slot: usize,
    pub id: u64,
}

/// A loaded model and the context it embeds with
pub struct ModelEntry {
    id: u64,
    name: String,
    path: PathBuf,
    // Declared before `model` so it is dropped first
    context: Box<dyn InferenceContext>,
    model: Box<dyn LanguageModel>,
}

impl ModelEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn size_bytes(&self) -> u64 {
        self.model.size_bytes()
    }

    pub fn embedding_width(&self) -> usize {
        self.model.embedding_width()
    }

    /// Normalized embedding of `text`
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        embeddings::embed(self.model.as_ref(), self.context.as_mut(), text)
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        embeddings::tokenize(self.model.as_ref(), text)
    }

    pub fn chunk(&self, text: &str, chunk_size: usize) -> Result<Vec<Chunk>> {
        embeddings::chunk(self.model.as_ref(), text, chunk_size)
    }

    pub fn token_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        self.model.token_piece(token)
    }

    pub fn token_score(&self, token: TokenId) -> Result<f32> {
        self.model.token_score(token)
    }
}

pub struct ModelRegistry {
    id: u64,
    backend: Arc<dyn Backend>,
    slots: [Option<ModelEntry>; MAX_MODELS],
    next_entry_id: u64,
}

impl ModelRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            id: unguessable_id(),
            backend,
            slots: std::array::from_fn(|_| None),
            next_entry_id: unguessable_id(),
        }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Load the model at `path` and register it under `name`.
    ///
    /// Nothing is loaded when the registry is full or the name is taken. If the context cannot
    /// be created the freshly loaded model is released before the error is returned.
    pub fn insert(
        &mut self,
        name: &str,
        path: &Path,
        model_options: &ModelOptions,
        context_options: &ContextOptions,
    ) -> Result<ModelHandle> {
        if name.is_empty() {
            return Err(LembedError::InvalidArgument(
                "model name must not be empty".to_string(),
            ));
        }
        if self.entries().any(|(_, entry)| entry.name == name) {
            return Err(LembedError::AlreadyRegistered(name.to_string()));
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(LembedError::CapacityExceeded {
                capacity: MAX_MODELS,
            })?;

        let model = self.backend.load_model(path, model_options)?;
        let context = model.new_context(context_options).inspect_err(|e| {
            warn!(
                model = name,
                path = %path.display(),
                error = %e,
                "Context creation failed, releasing model"
            );
        })?;

        let id = self.next_entry_id;
        self.next_entry_id = self.next_entry_id.wrapping_add(1);

        info!(
            model = name,
            path = %path.display(),
            slot,
            size_bytes = model.size_bytes(),
            embedding_width = model.embedding_width(),
            "Registered model"
        );

        self.slots[slot] = Some(ModelEntry {
            id,
            name: name.to_string(),
            path: path.to_path_buf(),
            context,
            model,
        });

        Ok(self.handle(slot, id))
    }

    pub fn lookup(&self, name: &str) -> Result<&ModelEntry> {
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.name == name)
            .ok_or_else(|| LembedError::unknown_model(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Result<&mut ModelEntry> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.name == name)
            .ok_or_else(|| LembedError::unknown_model(name))
    }

    /// The model registered as `default`
    pub fn lookup_default(&self) -> Result<&ModelEntry> {
        self.lookup(DEFAULT_MODEL)
            .map_err(|_| LembedError::no_default_model())
    }

    pub fn lookup_default_mut(&mut self) -> Result<&mut ModelEntry> {
        self.lookup_mut(DEFAULT_MODEL)
            .map_err(|_| LembedError::no_default_model())
    }

    /// Handle of the model registered under `name`
    pub fn handle_of(&self, name: &str) -> Result<ModelHandle> {
        self.entries()
            .find(|(_, entry)| entry.name == name)
            .map(|(slot, entry)| self.handle(slot, entry.id))
            .ok_or_else(|| LembedError::unknown_model(name))
    }

    /// Registered models in slot order
    pub fn enumerate(&self) -> impl Iterator<Item = (ModelHandle, &ModelEntry)> + '_ {
        self.entries()
            .map(move |(slot, entry)| (self.handle(slot, entry.id), entry))
    }

    /// Entry a handle refers to, provided it was issued by this registry and is still current
    pub fn resolve(&self, handle: &ModelHandle) -> Result<&ModelEntry> {
        if handle.registry != self.id {
            return Err(LembedError::InvalidArgument(
                "model handle belongs to a different connection".to_string(),
            ));
        }
        self.slots
            .get(handle.slot)
            .and_then(Option::as_ref)
            .filter(|entry| entry.id == handle.id)
            .ok_or_else(|| {
                LembedError::InvalidArgument(format!(
                    "model handle for slot {} is no longer valid",
                    handle.slot
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> impl Iterator<Item = (usize, &ModelEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e)))
    }

    fn handle(&self, slot: usize, id: u64) -> ModelHandle {
        ModelHandle {
            registry: self.id,
            slot,
            id,
        }
    }
}
