//! Error type shared by every lembed module.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LembedError {
    /// Unknown model name or unregistered default model.
    #[error("{0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Tokenization, decode, model load or context creation failed in the inference backend.
    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Model registry is full: at most {capacity} models can be registered")]
    CapacityExceeded { capacity: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Model '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl LembedError {
    pub fn unknown_model(name: &str) -> Self {
        Self::NotFound(format!(
            "Unknown model name '{}'. Was it registered with lembed_models?",
            name
        ))
    }

    pub fn no_default_model() -> Self {
        Self::NotFound("No default model has been registered yet with lembed_models".to_string())
    }

    pub(crate) fn out_of_memory(what: &str, err: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory(format!("could not allocate {}: {}", what, err))
    }
}

/// SQL callers see the message verbatim.
impl From<LembedError> for rusqlite::Error {
    fn from(err: LembedError) -> Self {
        match err {
            LembedError::Sql(inner) => inner,
            other => rusqlite::Error::UserFunctionError(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, LembedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_message() {
        let err = LembedError::unknown_model("aaaaaaaaa");
        assert_eq!(
            err.to_string(),
            "Unknown model name 'aaaaaaaaa'. Was it registered with lembed_models?"
        );
    }

    #[test]
    fn test_capacity_message_names_limit() {
        let err = LembedError::CapacityExceeded { capacity: 16 };
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_into_rusqlite_error_keeps_message() {
        let err: rusqlite::Error = LembedError::no_default_model().into();
        assert_eq!(
            err.to_string(),
            "No default model has been registered yet with lembed_models"
        );
    }
}
