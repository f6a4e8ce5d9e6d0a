pub mod chunks;
pub mod embed;
pub mod models;
pub mod query;
pub mod tokenize;

use anyhow::Context;
use rusqlite::{params_from_iter, Connection};
use tracing::info;

/// Split a `LEFT=RIGHT` command-line argument
fn split_pair<'a>(arg: &'a str, format: &str) -> anyhow::Result<(&'a str, &'a str)> {
    arg.split_once('=')
        .filter(|(left, _)| !left.is_empty())
        .with_context(|| format!("expected {}, got '{}'", format, arg))
}

/// `?, ?, ...` with `n` placeholders
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Register every `NAME=PATH` model through `lembed_models`, with the same options for each
pub fn register_models(
    conn: &Connection,
    models: &[String],
    model_options: &[String],
    context_options: &[String],
) -> anyhow::Result<()> {
    let mut option_values = Vec::new();
    for arg in model_options {
        let (key, value) = split_pair(arg, "KEY=VALUE")?;
        option_values.push(key.to_string());
        option_values.push(value.to_string());
    }
    let n_model_values = option_values.len();
    for arg in context_options {
        let (key, value) = split_pair(arg, "KEY=VALUE")?;
        option_values.push(key.to_string());
        option_values.push(value.to_string());
    }
    let n_context_values = option_values.len() - n_model_values;

    let sql = format!(
        "INSERT INTO lembed_models(name, model, model_options, context_options) \
         VALUES (?, lembed_model_from_file(?), lembed_model_options({}), lembed_context_options({}))",
        placeholders(n_model_values),
        placeholders(n_context_values)
    );

    for arg in models {
        let (name, path) = split_pair(arg, "NAME=PATH")?;
        let values = [name.to_string(), path.to_string()]
            .into_iter()
            .chain(option_values.iter().cloned());
        conn.execute(&sql, params_from_iter(values))
            .with_context(|| format!("failed to register model '{}' from {}", name, path))?;
        info!(model = name, path, "Registered model from command line");
    }

    Ok(())
}
