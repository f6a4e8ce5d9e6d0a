//! Typed resource references passed between SQL calls
//!
//! A reference travels as a BLOB: the `lembed:` tag followed by the JSON of a [`ResourceRef`].
//! Consumers decode it, check that it is the kind they expect and, for model handles, that the
//! registry of their own connection issued it.

use crate::options::{ContextOptions, ModelOptions};
use crate::registry::ModelHandle;
use crate::{LembedError, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const TAG: &[u8] = b"lembed:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRef {
    /// Model file named by `lembed_model_from_file`, not yet loaded
    ModelPath { path: PathBuf },
    ModelOptions { options: ModelOptions },
    ContextOptions { options: ContextOptions },
    /// A registered model, as read from `lembed_models.model`
    Model { handle: ModelHandle },
}

impl ResourceRef {
    fn kind(&self) -> &'static str {
        match self {
            Self::ModelPath { .. } => "lembed_model_from_file()",
            Self::ModelOptions { .. } => "lembed_model_options()",
            Self::ContextOptions { .. } => "lembed_context_options()",
            Self::Model { .. } => "lembed_models.model",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| {
            LembedError::InvalidArgument(format!("cannot encode resource reference: {}", e))
        })?;
        let mut blob = Vec::new();
        blob.try_reserve_exact(TAG.len() + json.len())
            .map_err(|e| LembedError::out_of_memory("resource reference", e))?;
        blob.extend_from_slice(TAG);
        blob.extend_from_slice(&json);
        Ok(blob)
    }

    /// Decode a SQL value, or `None` if it is not a resource reference at all
    pub fn decode(value: ValueRef<'_>) -> Option<Self> {
        let blob = value.as_blob().ok()?;
        let json = blob.strip_prefix(TAG)?;
        serde_json::from_slice(json).ok()
    }

    /// Decode a SQL value that must be a reference, naming `expected` in the error otherwise
    fn expect(value: ValueRef<'_>, expected: &str) -> Result<Self> {
        Self::decode(value).ok_or_else(|| {
            LembedError::InvalidArgument(format!("expected a value produced by {}", expected))
        })
    }

    pub fn model_path(value: ValueRef<'_>) -> Result<PathBuf> {
        match Self::expect(value, "lembed_model_from_file()")? {
            Self::ModelPath { path } => Ok(path),
            other => Err(mismatch("lembed_model_from_file()", &other)),
        }
    }

    /// Model options, with NULL meaning "all defaults"
    pub fn model_options(value: ValueRef<'_>) -> Result<ModelOptions> {
        if value == ValueRef::Null {
            return Ok(ModelOptions::default());
        }
        match Self::expect(value, "lembed_model_options()")? {
            Self::ModelOptions { options } => Ok(options),
            other => Err(mismatch("lembed_model_options()", &other)),
        }
    }

    /// Context options, with NULL meaning "all defaults"
    pub fn context_options(value: ValueRef<'_>) -> Result<ContextOptions> {
        if value == ValueRef::Null {
            return Ok(ContextOptions::default());
        }
        match Self::expect(value, "lembed_context_options()")? {
            Self::ContextOptions { options } => Ok(options),
            other => Err(mismatch("lembed_context_options()", &other)),
        }
    }

    pub fn model_handle(value: ValueRef<'_>) -> Result<ModelHandle> {
        match Self::expect(value, "lembed_models.model")? {
            Self::Model { handle } => Ok(handle),
            other => Err(mismatch("lembed_models.model", &other)),
        }
    }
}

fn mismatch(expected: &str, found: &ResourceRef) -> LembedError {
    LembedError::InvalidArgument(format!(
        "expected a value produced by {}, got one from {}",
        expected,
        found.kind()
    ))
}

impl ToSql for ResourceRef {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()?))
    }
}

impl FromSql for ResourceRef {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        let json = blob.strip_prefix(TAG).ok_or(FromSqlError::InvalidType)?;
        serde_json::from_slice(json).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
