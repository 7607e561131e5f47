//! # Tessera CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Create the database and register the schema's classes
//! - `status` - Show registered classes and record counts
//! - `seq` - Reserve a block of ids from a named sequence
//! - `translate` - Print the native form of a query
//! - `query` - Run a query and print the materialized rows

mod commands;
pub mod json;
pub mod schema;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tessera_core::primitives::LOCAL_URL_PREFIX;
use tessera_core::{FetchSize, PersistenceConfig, RetentionPolicy, TesseraError};

pub use commands::*;

/// Database used when neither `--database` nor a config file names one.
pub const DEFAULT_DATABASE: &str = "tessera.redb";

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Tessera - identity-stable objects over schemaless records
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Persistence configuration (TOML)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the redb database; overrides the config's connection_url
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Class metadata (TOML)
    #[arg(short = 'S', long, global = true)]
    pub schema: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and register the schema's classes
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,
    },

    /// Show registered classes and record counts
    Status,

    /// Reserve ids from a named sequence
    Seq {
        /// Sequence name
        #[arg(long)]
        name: String,

        /// Number of ids to reserve
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Print the native query for a filter
    Translate {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Run a query and print the materialized rows
    Query {
        #[command(flatten)]
        query: QueryArgs,

        /// Retention of materialized rows (none, weak, soft, hard)
        #[arg(long)]
        cache: Option<RetentionPolicy>,

        /// Rows to materialize eagerly (greedy, optimal or a count)
        #[arg(long)]
        fetch_size: Option<FetchSize>,
    },
}

/// Query description shared by `translate` and `query`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Fully qualified candidate class
    #[arg(short = 'C', long)]
    pub class: String,

    /// Filter expression tree as JSON
    #[arg(short = 'f', long)]
    pub filter_json: Option<String>,

    /// Parameter bindings as a JSON object
    #[arg(short = 'p', long)]
    pub params_json: Option<String>,

    /// Ordering clauses, `path` or `path:desc`, most significant first
    #[arg(short = 'o', long)]
    pub order_by: Vec<String>,

    /// Rows to skip
    #[arg(long)]
    pub skip: Option<usize>,

    /// Maximum rows
    #[arg(long)]
    pub limit: Option<usize>,

    /// Leave out instances of subclasses
    #[arg(long)]
    pub exact: bool,

    /// Project these paths instead of materializing objects
    #[arg(long)]
    pub project: Vec<String>,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration from `config_path` (or defaults), with `database` taking
/// precedence over the configured connection URL.
pub fn resolve_config(
    config_path: Option<&Path>,
    database: Option<&Path>,
) -> Result<PersistenceConfig, TesseraError> {
    let mut config = match config_path {
        Some(path) => PersistenceConfig::from_file(path)?,
        None => PersistenceConfig {
            connection_url: format!("{}{}", LOCAL_URL_PREFIX, DEFAULT_DATABASE),
            ..PersistenceConfig::default()
        },
    };
    if let Some(path) = database {
        config.connection_url = format!("{}{}", LOCAL_URL_PREFIX, path.display());
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), TesseraError> {
    let config = resolve_config(cli.config.as_deref(), cli.database.as_deref())?;
    let metadata = schema::load_schema(cli.schema.as_deref())?;
    let json_mode = cli.json_mode;
    if cli.verbose {
        tracing::info!(url = %config.connection_url, classes = metadata.classes().count(), "configuration loaded");
    }

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&config, &metadata, force, json_mode),
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Seq { name, count }) => cmd_seq(&config, &name, count, json_mode),
        Some(Commands::Translate { query }) => cmd_translate(&config, &metadata, &query, json_mode),
        Some(Commands::Query {
            query,
            cache,
            fetch_size,
        }) => cmd_query(&config, metadata, &query, cache, fetch_size, json_mode),
    }
}

// =============================================================================
// TESTS
// =============================================================================
