//! Model-load and context-creation options
//!
//! Options arrive as flat `key, value, key, value, ...` argument lists (the variadic
//! `lembed_model_options()` / `lembed_context_options()` SQL functions). Only the keys a
//! caller sets are populated; everything else keeps the backend default.

use crate::backend::PoolingType;
use crate::{LembedError, Result};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Positional-encoding extrapolation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScaling {
    None,
    Linear,
    Yarn,
}

impl FromStr for RopeScaling {
    type Err = LembedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "yarn" => Ok(Self::Yarn),
            other => Err(LembedError::InvalidArgument(format!(
                "unknown rope_scaling_type '{}', expected none, linear or yarn",
                other
            ))),
        }
    }
}

/// Options applied when loading a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Number of layers to offload to the GPU
    pub n_gpu_layers: Option<i32>,
}

impl ModelOptions {
    /// Parse a `key, value, ...` argument list
    pub fn parse(args: &[Value]) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in pairs(args)? {
            match key.to_ascii_lowercase().as_str() {
                "n_gpu_layers" => {
                    let n = integer(key, value)?;
                    let n = i32::try_from(n).map_err(|_| out_of_range(key, n))?;
                    options.n_gpu_layers = Some(n);
                }
                _ => return Err(unknown_key("model", key)),
            }
        }
        Ok(options)
    }
}

/// Options applied when creating the inference context of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub seed: Option<u32>,
    /// Context window in tokens (`n_ctx`)
    pub context_size: Option<u32>,
    pub rope_scaling: Option<RopeScaling>,
    pub rope_freq_scale: Option<f32>,
    /// Overrides the pooling strategy stored in the model file
    pub pooling: Option<PoolingType>,
}

impl ContextOptions {
    /// Parse a `key, value, ...` argument list
    pub fn parse(args: &[Value]) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in pairs(args)? {
            match key.to_ascii_lowercase().as_str() {
                "seed" => options.seed = Some(positive_u32(key, value)?),
                "n_ctx" | "context_size" => options.context_size = Some(positive_u32(key, value)?),
                "rope_scaling_type" | "rope_scaling" => {
                    options.rope_scaling = Some(text(key, value)?.parse()?);
                }
                "rope_freq_scale" => {
                    let scale = real(key, value)?;
                    if !scale.is_finite() || scale <= 0.0 {
                        return Err(LembedError::InvalidArgument(format!(
                            "rope_freq_scale must be a positive number, got {}",
                            scale
                        )));
                    }
                    options.rope_freq_scale = Some(scale as f32);
                }
                "pooling_type" | "pooling" => {
                    options.pooling = Some(text(key, value)?.parse()?);
                }
                _ => return Err(unknown_key("context", key)),
            }
        }
        Ok(options)
    }
}

/// Split a flat argument list into `(key, value)` pairs
fn pairs(args: &[Value]) -> Result<Vec<(&str, &Value)>> {
    if args.len() % 2 != 0 {
        return Err(LembedError::InvalidArgument(format!(
            "options must be given as key/value pairs, got {} arguments",
            args.len()
        )));
    }

    args.chunks_exact(2)
        .map(|pair| match &pair[0] {
            Value::Text(key) => Ok((key.as_str(), &pair[1])),
            other => Err(LembedError::InvalidArgument(format!(
                "option keys must be text, got {:?}",
                other.data_type()
            ))),
        })
        .collect()
}

fn unknown_key(kind: &str, key: &str) -> LembedError {
    LembedError::InvalidArgument(format!("unknown {} option '{}'", kind, key))
}

fn out_of_range(key: &str, value: i64) -> LembedError {
    LembedError::InvalidArgument(format!("value {} for '{}' is out of range", value, key))
}

fn integer(key: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Integer(n) => Ok(*n),
        Value::Text(s) => s.trim().parse().map_err(|_| {
            LembedError::InvalidArgument(format!("'{}' expects an integer, got '{}'", key, s))
        }),
        other => Err(LembedError::InvalidArgument(format!(
            "'{}' expects an integer, got {:?}",
            key,
            other.data_type()
        ))),
    }
}

fn positive_u32(key: &str, value: &Value) -> Result<u32> {
    let n = integer(key, value)?;
    if n <= 0 {
        return Err(LembedError::InvalidArgument(format!(
            "'{}' must be positive, got {}",
            key, n
        )));
    }
    u32::try_from(n).map_err(|_| out_of_range(key, n))
}

fn real(key: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Real(f) => Ok(*f),
        Value::Integer(n) => Ok(*n as f64),
        Value::Text(s) => s.trim().parse().map_err(|_| {
            LembedError::InvalidArgument(format!("'{}' expects a number, got '{}'", key, s))
        }),
        other => Err(LembedError::InvalidArgument(format!(
            "'{}' expects a number, got {:?}",
            key,
            other.data_type()
        ))),
    }
}

fn text<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    match value {
        Value::Text(s) => Ok(s.as_str()),
        other => Err(LembedError::InvalidArgument(format!(
            "'{}' expects text, got {:?}",
            key,
            other.data_type()
        ))),
    }
}
