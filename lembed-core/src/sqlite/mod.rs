//! SQL functions and virtual tables
//!
//! [`register`] installs the whole surface on a connection:
//!
//! | name | kind |
//! |------|------|
//! | `lembed_version()`, `lembed_debug()` | build information |
//! | `lembed([model,] text)` | little-endian float32 embedding blob, subtype [`FLOAT32_VECTOR_SUBTYPE`] |
//! | `lembed_tokenize_json(model, text)` | token ids as a JSON array |
//! | `lembed_token_score(model, token)`, `lembed_token_to_piece(model, token)` | vocabulary lookups |
//! | `lembed_model_from_file(path)`, `lembed_model_options(..)`, `lembed_context_options(..)` | arguments for `lembed_models` |
//! | `lembed_model_size(model)` | size of a registered model, from `lembed_models.model` |
//! | `lembed_models` | registered models; INSERT registers one |
//! | `lembed_chunks(model, source[, chunk_size])` | token-aligned chunks |

mod chunks_table;
mod handles;
mod models_table;

pub use handles::ResourceRef;

use crate::config::LembedConfig;
use crate::embeddings::to_le_bytes;
use crate::options::{ContextOptions, ModelOptions};
use crate::registry::{self, SharedRegistry};
use crate::Result;
use chunks_table::ChunksTable;
use models_table::ModelsTable;
use rusqlite::functions::{Context, FunctionFlags, SubType};
use rusqlite::types::{Value, ValueRef};
use rusqlite::vtab::{eponymous_only_module, update_module, Values};
use rusqlite::{Connection, Error};
use std::os::raw::c_uint;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Result subtype marking a BLOB as a little-endian float32 vector, as vector search
/// extensions such as sqlite-vec expect
pub const FLOAT32_VECTOR_SUBTYPE: c_uint = 223;

/// State every function and table of a connection works against
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) registry: SharedRegistry,
    pub(crate) config: Arc<LembedConfig>,
}

/// `v` followed by the crate version
pub fn version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

/// Version, build date and commit, one per line
pub fn debug_info() -> String {
    format!(
        "Version: {}\nDate: {}\nCommit: {}\n",
        version(),
        option_env!("LEMBED_BUILD_DATE").unwrap_or("unknown"),
        option_env!("LEMBED_BUILD_COMMIT").unwrap_or("unknown"),
    )
}

/// Register every lembed function and table on `conn`
pub fn register(conn: &Connection, registry: SharedRegistry, config: LembedConfig) -> Result<()> {
    let shared = Shared {
        registry,
        config: Arc::new(config),
    };
    let flags = FunctionFlags::SQLITE_UTF8
        | FunctionFlags::SQLITE_DETERMINISTIC
        | FunctionFlags::SQLITE_INNOCUOUS;

    conn.create_scalar_function("lembed_version", 0, flags, |_| Ok(version()))?;
    conn.create_scalar_function("lembed_debug", 0, flags, |_| Ok(debug_info()))?;

    let vector_flags = flags | FunctionFlags::SQLITE_RESULT_SUBTYPE;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed", 1, vector_flags, move |ctx| {
        let text: String = ctx.get(0)?;
        let mut registry = registry::lock(&models)?;
        let embedding = registry.lookup_default_mut()?.embed(&text)?;
        Ok(float32_vector(&embedding))
    })?;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed", 2, vector_flags, move |ctx| {
        let name: String = ctx.get(0)?;
        let text: String = ctx.get(1)?;
        let mut registry = registry::lock(&models)?;
        let embedding = registry.lookup_mut(&name)?.embed(&text)?;
        Ok(float32_vector(&embedding))
    })?;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed_tokenize_json", 2, flags, move |ctx| {
        let name: String = ctx.get(0)?;
        let text: String = ctx.get(1)?;
        let tokens = registry::lock(&models)?.lookup(&name)?.tokenize(&text)?;
        serde_json::to_string(&tokens).map_err(|e| Error::UserFunctionError(Box::new(e)))
    })?;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed_token_score", 2, flags, move |ctx| {
        let name: String = ctx.get(0)?;
        let token: i32 = ctx.get(1)?;
        let score = registry::lock(&models)?.lookup(&name)?.token_score(token)?;
        Ok(f64::from(score))
    })?;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed_token_to_piece", 2, flags, move |ctx| {
        let name: String = ctx.get(0)?;
        let token: i32 = ctx.get(1)?;
        let piece = registry::lock(&models)?.lookup(&name)?.token_piece(token)?;
        if piece.is_empty() {
            return Ok(Value::Null);
        }
        // Byte-fallback pieces are not valid UTF-8 on their own
        Ok(match String::from_utf8(piece) {
            Ok(text) => Value::Text(text),
            Err(e) => Value::Blob(e.into_bytes()),
        })
    })?;

    let models = shared.registry.clone();
    conn.create_scalar_function("lembed_model_size", 1, flags, move |ctx| {
        let handle = ResourceRef::model_handle(ctx.get_raw(0))?;
        let size = registry::lock(&models)?.resolve(&handle)?.size_bytes();
        Ok(i64::try_from(size).unwrap_or(i64::MAX))
    })?;

    conn.create_scalar_function("lembed_model_from_file", 1, flags, |ctx| {
        let path: String = ctx.get(0)?;
        Ok(ResourceRef::ModelPath {
            path: PathBuf::from(path),
        })
    })?;

    conn.create_scalar_function("lembed_model_options", -1, flags, |ctx| {
        let options = ModelOptions::parse(&variadic_args(ctx))?;
        Ok(ResourceRef::ModelOptions { options })
    })?;

    conn.create_scalar_function("lembed_context_options", -1, flags, |ctx| {
        let options = ContextOptions::parse(&variadic_args(ctx))?;
        Ok(ResourceRef::ContextOptions { options })
    })?;

    conn.create_module(
        "lembed_models",
        update_module::<ModelsTable>(),
        Some(shared.clone()),
    )?;
    conn.create_module(
        "lembed_chunks",
        eponymous_only_module::<ChunksTable>(),
        Some(shared),
    )?;

    debug!("Registered lembed functions and tables");
    Ok(())
}

/// Embedding blob tagged with [`FLOAT32_VECTOR_SUBTYPE`]
fn float32_vector(embedding: &[f32]) -> (Vec<u8>, SubType) {
    (to_le_bytes(embedding), Some(FLOAT32_VECTOR_SUBTYPE))
}

fn variadic_args(ctx: &Context<'_>) -> Vec<Value> {
    (0..ctx.len()).map(|i| Value::from(ctx.get_raw(i))).collect()
}

/// Argument `i` of a virtual table call
pub(crate) fn arg<'a>(args: &'a Values<'_>, i: usize) -> rusqlite::Result<ValueRef<'a>> {
    args.iter()
        .nth(i)
        .ok_or_else(|| Error::ModuleError(format!("missing argument {}", i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockConfig};
    use crate::registry::ModelRegistry;
    use rusqlite::params;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    struct Fixture {
        conn: Connection,
        model: NamedTempFile,
        _data_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_backend(MockConfig::default())
        }

        fn with_backend(config: MockConfig) -> Self {
            let data_dir = tempfile::tempdir().unwrap();
            let mut model = NamedTempFile::new().unwrap();
            model.write_all(b"GGUF mock weights").unwrap();

            let registry = ModelRegistry::new(Arc::new(MockBackend::new(config))).into_shared();
            let conn = Connection::open_in_memory().unwrap();
            register(&conn, registry, LembedConfig::new(data_dir.path())).unwrap();

            Self {
                conn,
                model,
                _data_dir: data_dir,
            }
        }

        fn register_model(&self, name: &str) -> rusqlite::Result<usize> {
            self.conn.execute(
                "INSERT INTO lembed_models(name, model) VALUES (?, lembed_model_from_file(?))",
                params![name, self.model.path().to_str().unwrap()],
            )
        }

        fn error(&self, sql: &str) -> String {
            self.conn
                .query_row(sql, [], |row| row.get::<_, Value>(0))
                .unwrap_err()
                .to_string()
        }
    }

    fn floats(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn test_version_and_debug() {
        let fx = Fixture::new();

        let version: String = fx
            .conn
            .query_row("SELECT lembed_version()", [], |row| row.get(0))
            .unwrap();
        assert!(version.starts_with('v'));

        let debug: String = fx
            .conn
            .query_row("SELECT lembed_debug()", [], |row| row.get(0))
            .unwrap();
        assert_eq!(debug.split('\n').count(), 4);
        assert!(debug.starts_with(&format!("Version: {}", version)));
    }

    #[test]
    fn test_lembed_named_model() {
        let fx = Fixture::new();
        fx.register_model("aaa").unwrap();

        let blob: Vec<u8> = fx
            .conn
            .query_row("SELECT lembed('aaa', 'alex garcia')", [], |row| row.get(0))
            .unwrap();

        assert_eq!(blob.len(), 384 * 4);
        let norm: f32 = floats(&blob).iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_lembed_tags_float32_vector_subtype() {
        let fx = Fixture::new();
        fx.register_model("default").unwrap();
        fx.conn
            .create_scalar_function(
                "vector_subtype",
                1,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_SUBTYPE,
                |ctx| Ok(i64::from(ctx.get_subtype(0))),
            )
            .unwrap();

        let (named, default): (i64, i64) = fx
            .conn
            .query_row(
                "SELECT vector_subtype(lembed('default', 'hello world')),
                        vector_subtype(lembed('hello world'))",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        assert_eq!(named, i64::from(FLOAT32_VECTOR_SUBTYPE));
        assert_eq!(default, 223);
    }

    #[test]
    fn test_lembed_unknown_and_default_model_errors() {
        let fx = Fixture::new();
        fx.register_model("aaa").unwrap();

        assert!(fx
            .error("SELECT lembed('aaaaaaaaa', 'alex garcia')")
            .contains("Unknown model name 'aaaaaaaaa'. Was it registered with lembed_models?"));
        assert!(fx
            .error("SELECT lembed('alex garcia')")
            .contains("No default model has been registered yet with lembed_models"));
    }

    #[test]
    fn test_lembed_default_model() {
        let fx = Fixture::new();
        fx.register_model("default").unwrap();

        let (implicit, explicit): (Vec<u8>, Vec<u8>) = fx
            .conn
            .query_row(
                "SELECT lembed('alex garcia'), lembed('default', 'alex garcia')",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        assert_eq!(implicit.len(), 384 * 4);
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn test_models_table_lists_registry() {
        let fx = Fixture::new();
        fx.register_model("first").unwrap();
        fx.register_model("second").unwrap();

        let mut stmt = fx
            .conn
            .prepare("SELECT rowid, name, lembed_model_size(model) FROM lembed_models")
            .unwrap();
        let rows: Vec<(i64, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(
            rows,
            vec![(0, "first".to_string(), 17), (1, "second".to_string(), 17)]
        );
    }

    #[test]
    fn test_models_table_is_insert_only() {
        let fx = Fixture::new();
        fx.register_model("m").unwrap();

        let err = fx
            .conn
            .execute("DELETE FROM lembed_models WHERE name = 'm'", [])
            .unwrap_err();
        assert!(err.to_string().contains("cannot be deleted"));

        let err = fx
            .conn
            .execute("UPDATE lembed_models SET name = 'n' WHERE name = 'm'", [])
            .unwrap_err();
        assert!(err.to_string().contains("cannot be updated"));

        let err = fx.register_model("m").unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_models_table_with_options() {
        let fx = Fixture::new();

        fx.conn
            .execute(
                "INSERT INTO lembed_models(name, model, model_options, context_options) VALUES (
                    'm',
                    lembed_model_from_file(?),
                    lembed_model_options('n_gpu_layers', 0),
                    lembed_context_options('seed', 42, 'n_ctx', 512, 'pooling_type', 'cls')
                )",
                [fx.model.path().to_str().unwrap()],
            )
            .unwrap();

        let blob: Vec<u8> = fx
            .conn
            .query_row("SELECT lembed('m', 'hello')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(blob.len(), 384 * 4);
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        let fx = Fixture::new();

        let err = fx.error("SELECT lembed_context_options('temperature', 1)");
        assert!(err.contains("temperature"));
    }

    #[test]
    fn test_models_table_rejects_wrong_reference_kinds() {
        let fx = Fixture::new();

        let err = fx
            .conn
            .execute(
                "INSERT INTO lembed_models(name, model) VALUES ('m', lembed_model_options())",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("lembed_model_from_file()"));

        let err = fx
            .conn
            .execute(
                "INSERT INTO lembed_models(name, model) VALUES ('m', '/some/path.gguf')",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("lembed_model_from_file()"));

        let err = fx.error("SELECT lembed_model_size(lembed_model_from_file('x.gguf'))");
        assert!(err.contains("lembed_models.model"));
    }

    #[test]
    fn test_model_load_failure_is_reported() {
        let fx = Fixture::new();

        let err = fx
            .conn
            .execute(
                "INSERT INTO lembed_models(name, model) VALUES ('m', lembed_model_from_file('/nonexistent.gguf'))",
                [],
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed to load model"));
    }

    #[test]
    fn test_context_failure_is_reported() {
        let fx = Fixture::with_backend(MockConfig {
            fail_context: true,
            ..Default::default()
        });

        let err = fx.register_model("m").unwrap_err();
        assert!(err.to_string().contains("context"));

        let count: i64 = fx
            .conn
            .query_row("SELECT count(*) FROM lembed_models", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_tokenize_json_and_pieces() {
        let fx = Fixture::new();
        fx.register_model("m").unwrap();

        let json: String = fx
            .conn
            .query_row("SELECT lembed_tokenize_json('m', 'hello world')", [], |row| {
                row.get(0)
            })
            .unwrap();
        let tokens: Vec<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(tokens.len(), 4);

        let (first, bos): (Option<String>, Option<String>) = fx
            .conn
            .query_row(
                "SELECT lembed_token_to_piece('m', ?), lembed_token_to_piece('m', ?)",
                params![tokens[1], tokens[0]],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(first.as_deref(), Some(" hello"));
        assert_eq!(bos, None);

        let score: f64 = fx
            .conn
            .query_row("SELECT lembed_token_score('m', ?)", [tokens[1]], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(score.is_finite());
    }

    #[test]
    fn test_byte_fallback_pieces_and_chunks() {
        let fx = Fixture::with_backend(MockConfig {
            byte_fallback: true,
            ..Default::default()
        });
        fx.register_model("m").unwrap();

        let json: String = fx
            .conn
            .query_row("SELECT lembed_tokenize_json('m', 'café ok')", [], |row| {
                row.get(0)
            })
            .unwrap();
        let tokens: Vec<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(tokens.len(), 6);

        let (word, lead_byte): (Value, Value) = fx
            .conn
            .query_row(
                "SELECT lembed_token_to_piece('m', ?), lembed_token_to_piece('m', ?)",
                params![tokens[1], tokens[2]],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(word, Value::Text(" caf".to_string()));
        assert_eq!(lead_byte, Value::Blob(vec![0xC3]));

        let mut stmt = fx
            .conn
            .prepare("SELECT contents FROM lembed_chunks('m', 'café ok', 2)")
            .unwrap();
        let chunks: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(chunks, vec!["caf", "é", " ok"]);
    }

    #[test]
    fn test_chunks_table() {
        let fx = Fixture::new();
        fx.register_model("m").unwrap();

        let mut stmt = fx
            .conn
            .prepare("SELECT contents, token_count FROM lembed_chunks('m', 'hello world', 2)")
            .unwrap();
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(
            rows,
            vec![("hello".to_string(), 2), (" world".to_string(), 2)]
        );
        assert!(rows.iter().all(|(c, _)| "hello world".contains(c.as_str())));
    }

    #[test]
    fn test_chunks_default_size_and_hidden_columns() {
        let fx = Fixture::new();
        fx.register_model("m").unwrap();

        let (contents, model, source, chunk_size): (String, String, String, i64) = fx
            .conn
            .query_row(
                "SELECT contents, model, source, chunk_size FROM lembed_chunks
                 WHERE model = 'm' AND source = 'Hello, world!'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();

        assert_eq!(contents, "Hello, world!");
        assert_eq!(model, "m");
        assert_eq!(source, "Hello, world!");
        assert_eq!(chunk_size, 256);
    }

    #[test]
    fn test_chunks_argument_errors() {
        let fx = Fixture::new();
        fx.register_model("m").unwrap();

        let err = fx
            .conn
            .prepare("SELECT contents FROM lembed_chunks('m')")
            .err()
            .unwrap();
        assert!(err.to_string().contains("model and source arguments are required"));

        assert!(fx
            .error("SELECT contents FROM lembed_chunks('m', 'hello', 0)")
            .contains("chunk_size"));
        assert!(fx
            .error("SELECT contents FROM lembed_chunks('m', NULL)")
            .contains("source must not be NULL"));
        assert!(fx
            .error("SELECT contents FROM lembed_chunks(NULL, 'hello')")
            .contains("model must not be NULL"));
        assert!(fx
            .error("SELECT contents FROM lembed_chunks('nope', 'hello')")
            .contains("Unknown model name 'nope'"));
    }
}
