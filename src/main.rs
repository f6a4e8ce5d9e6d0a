mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use lembed_core::registry::DEFAULT_MODEL;
use lembed_core::{Backend, LembedConfig, MockBackend, ModelRegistry};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lembed")]
#[command(about = "Embed and chunk text with local models, from SQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite database to open (in-memory when omitted)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Inference backend
    #[arg(long, global = true, value_enum, default_value_t = BackendKind::default())]
    backend: BackendKind,

    /// Register a model before running the command (repeatable)
    #[arg(long = "model", value_name = "NAME=PATH")]
    models: Vec<String>,

    /// Model load option applied to every --model (repeatable)
    #[arg(long = "model-option", value_name = "KEY=VALUE")]
    model_options: Vec<String>,

    /// Context option applied to every --model (repeatable)
    #[arg(long = "context-option", value_name = "KEY=VALUE")]
    context_options: Vec<String>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the embedding of a text as a JSON array
    Embed {
        /// Text to embed
        text: String,

        /// Registered model to use
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
    },

    /// Print the token ids of a text as a JSON array
    Tokenize {
        text: String,

        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
    },

    /// Split a text into token-aligned chunks
    Chunks {
        text: String,

        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Tokens per chunk (defaults to 256)
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// List registered models
    Models,

    /// Run SQL with the lembed functions and tables available
    Query {
        /// SQL statement
        sql: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Deterministic in-process backend, for tests and demos
    Mock,
    /// llama.cpp (GGUF models), needs the `llama` feature
    Llama,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "llama") {
            Self::Llama
        } else {
            Self::Mock
        }
    }
}

fn get_data_dir(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|p| p.join("lembed"))
            .unwrap_or_else(|| PathBuf::from(".lembed"))
    })
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "lembed=debug,lembed_core=debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn create_backend(kind: BackendKind) -> anyhow::Result<Arc<dyn Backend>> {
    match kind {
        BackendKind::Mock => Ok(Arc::new(MockBackend::default())),
        #[cfg(feature = "llama")]
        BackendKind::Llama => Ok(Arc::new(lembed_core::backend::LlamaBackend::init()?)),
        #[cfg(not(feature = "llama"))]
        BackendKind::Llama => {
            anyhow::bail!("lembed was built without llama.cpp support; rebuild with --features llama")
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = get_data_dir(cli.data_dir);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let conn = match &cli.db {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };

    let registry = ModelRegistry::new(create_backend(cli.backend)?).into_shared();
    lembed_core::sqlite::register(&conn, registry.clone(), LembedConfig::new(&data_dir))?;

    commands::register_models(
        &conn,
        &cli.models,
        &cli.model_options,
        &cli.context_options,
    )?;

    match cli.command {
        Commands::Embed { text, model } => {
            commands::embed::run(&conn, &model, &text)?;
        }
        Commands::Tokenize { text, model } => {
            commands::tokenize::run(&conn, &model, &text)?;
        }
        Commands::Chunks {
            text,
            model,
            chunk_size,
        } => {
            commands::chunks::run(&conn, &model, &text, chunk_size)?;
        }
        Commands::Models => {
            commands::models::run(&registry)?;
        }
        Commands::Query { sql } => {
            commands::query::run(&conn, &sql)?;
        }
    }

    Ok(())
}
