//! # CLI Command Implementations
//!
//! Each `cmd_*` prints its result; the functions they call return plain
//! data so the commands can be tested without capturing stdout.

use super::QueryArgs;
use super::json::{parse_parameters, row_to_json};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::primitives::SEQUENCE_CLASS;
use tessera_core::{
    ConnectionProvider, Direction, Expr, FetchSize, MetadataRegistry, NativeQuery,
    PersistenceConfig, QueryOptions, QuerySpec, QueryTranslator, RetentionPolicy, Sequence,
    SchemaRegistry, SequenceAllocator, Session, SharedStoreProvider, StoreClient, StoreTarget,
    TesseraError,
};

fn print_json(value: &impl Serialize) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the database named by `config` and register every schema class.
///
/// Returns the store name and cluster id of each registered class.
pub fn init_database(
    config: &PersistenceConfig,
    metadata: &MetadataRegistry,
    force: bool,
) -> Result<Vec<(String, u16)>, TesseraError> {
    if let Some(path) = database_path(config)? {
        if path.exists() {
            if !force {
                return Err(TesseraError::IoError(format!(
                    "Database {} already exists. Use --force to overwrite.",
                    path.display()
                )));
            }
            std::fs::remove_file(&path).map_err(|e| {
                TesseraError::IoError(format!("cannot remove {}: {}", path.display(), e))
            })?;
            tracing::warn!(path = %path.display(), "existing database removed");
        }
    }

    let provider = SharedStoreProvider::from_config(config)?;
    let store = provider.store();
    metadata
        .classes()
        .map(|class| -> Result<(String, u16), TesseraError> {
            let cluster = store.ensure_type_registered(class)?;
            Ok((class.store_name().to_string(), cluster))
        })
        .collect()
}

/// Initialize a new database.
pub fn cmd_init(
    config: &PersistenceConfig,
    metadata: &MetadataRegistry,
    force: bool,
    json_mode: bool,
) -> Result<(), TesseraError> {
    let registered = init_database(config, metadata, force)?;

    if json_mode {
        print_json(&serde_json::json!({
            "database": config.connection_url,
            "classes": registered
                .iter()
                .map(|(name, cluster)| serde_json::json!({ "name": name, "cluster": cluster }))
                .collect::<Vec<_>>(),
        }));
        return Ok(());
    }

    println!("Initialized {}", config.connection_url);
    for (name, cluster) in &registered {
        println!("  {:<24} cluster {}", name, cluster);
    }
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Record count of one registered class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStatus {
    pub name: String,
    pub cluster: u16,
    pub records: usize,
}

/// Summary of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub records: usize,
    pub classes: Vec<ClassStatus>,
}

/// Registered classes and record counts of the configured store.
pub fn status_report(config: &PersistenceConfig) -> Result<StatusReport, TesseraError> {
    let provider = SharedStoreProvider::from_config(config)?;
    let store = provider.store();

    let mut classes = Vec::new();
    for (name, cluster) in store.registered_types()? {
        // Exact-class scan: no predicate, only this store name.
        let scan = NativeQuery {
            text: format!("select from {}", name),
            candidate: name.clone(),
            targets: vec![name.clone()],
            predicate: None,
            ordering: Vec::new(),
            skip: None,
            limit: None,
            projection: None,
        };
        let records = store.execute_query(&scan)?.len();
        classes.push(ClassStatus {
            name,
            cluster,
            records,
        });
    }

    Ok(StatusReport {
        database: config.connection_url.clone(),
        records: store.count_records()?,
        classes,
    })
}

/// Show store status.
pub fn cmd_status(config: &PersistenceConfig, json_mode: bool) -> Result<(), TesseraError> {
    let report = status_report(config)?;

    if json_mode {
        print_json(&report);
        return Ok(());
    }

    println!("Tessera Store Status");
    println!("====================");
    println!("Database: {}", report.database);
    println!("Records:  {}", report.records);
    println!();
    for class in &report.classes {
        println!(
            "  {:<24} cluster {:<4} {} record(s)",
            class.name, class.cluster, class.records
        );
    }
    Ok(())
}

// =============================================================================
// SEQUENCE COMMAND
// =============================================================================

/// Reserve `count` ids from the sequence `name`.
pub fn reserve_ids(
    config: &PersistenceConfig,
    name: &str,
    count: usize,
) -> Result<Vec<i64>, TesseraError> {
    let provider: Arc<dyn ConnectionProvider> = Arc::new(SharedStoreProvider::from_config(config)?);
    let sequence = Sequence::new(name, SequenceAllocator::from_config(config)?, provider);
    sequence.allocate(count)
}

/// Reserve a block of ids.
pub fn cmd_seq(
    config: &PersistenceConfig,
    name: &str,
    count: usize,
    json_mode: bool,
) -> Result<(), TesseraError> {
    let ids = reserve_ids(config, name, count)?;

    if json_mode {
        print_json(&serde_json::json!({
            "sequence": name,
            "counter_class": SEQUENCE_CLASS,
            "ids": ids,
        }));
        return Ok(());
    }

    let rendered: Vec<String> = ids.iter().map(i64::to_string).collect();
    println!("{}: {}", name, rendered.join(", "));
    Ok(())
}

// =============================================================================
// QUERY COMMANDS
// =============================================================================

fn parse_order(clause: &str) -> Result<(&str, Direction), TesseraError> {
    let (path, direction) = clause.split_once(':').unwrap_or((clause, "asc"));
    let direction = match direction.to_ascii_lowercase().as_str() {
        "asc" => Direction::Ascending,
        "desc" => Direction::Descending,
        other => {
            return Err(TesseraError::Translation(format!(
                "unknown ordering direction '{}'",
                other
            )));
        }
    };
    Ok((path, direction))
}

/// Query description from command-line arguments.
pub fn build_spec(args: &QueryArgs) -> Result<QuerySpec, TesseraError> {
    let mut spec = QuerySpec::new(&args.class);
    if let Some(text) = &args.filter_json {
        let filter: Expr = serde_json::from_str(text)
            .map_err(|e| TesseraError::DeserializationError(format!("filter: {}", e)))?;
        spec = spec.filter(filter);
    }
    for clause in &args.order_by {
        let (path, direction) = parse_order(clause)?;
        spec = spec.order_by(path, direction);
    }
    if args.exact {
        spec = spec.exclude_subclasses();
    }
    if !args.project.is_empty() {
        let paths: Vec<&str> = args.project.iter().map(String::as_str).collect();
        spec = spec.project(&paths);
    }
    spec.skip = args.skip;
    spec.limit = args.limit;
    Ok(spec)
}

/// Native form of the query `args` describe.
pub fn translate_query(
    config: &PersistenceConfig,
    metadata: &MetadataRegistry,
    args: &QueryArgs,
) -> Result<NativeQuery, TesseraError> {
    let spec = build_spec(args)?;
    let params = parse_parameters(args.params_json.as_deref())?;
    let provider = SharedStoreProvider::from_config(config)?;
    let store = provider.store();
    QueryTranslator::new(metadata).translate(&spec, &params, store.as_ref())
}

/// Print the native query.
pub fn cmd_translate(
    config: &PersistenceConfig,
    metadata: &MetadataRegistry,
    args: &QueryArgs,
    json_mode: bool,
) -> Result<(), TesseraError> {
    let native = translate_query(config, metadata, args)?;

    if json_mode {
        print_json(&serde_json::json!({
            "query": native.text,
            "targets": native.targets,
        }));
        return Ok(());
    }

    println!("{}", native);
    Ok(())
}

/// Run the query `args` describe and render every row.
pub fn run_query(
    config: &PersistenceConfig,
    metadata: MetadataRegistry,
    args: &QueryArgs,
    options: &QueryOptions,
) -> Result<Vec<serde_json::Value>, TesseraError> {
    let spec = build_spec(args)?;
    let params = parse_parameters(args.params_json.as_deref())?;
    let provider: Arc<dyn ConnectionProvider> = Arc::new(SharedStoreProvider::from_config(config)?);
    let mut session = Session::new(Arc::new(metadata), provider, config.clone());

    let result = session.query(&spec, &params, options)?;
    let rows = result
        .iter()
        .map(|row| row.map(|row| row_to_json(&row)))
        .collect::<Result<Vec<_>, _>>()?;
    result.close();
    Ok(rows)
}

/// Run a query and print the rows.
pub fn cmd_query(
    config: &PersistenceConfig,
    metadata: MetadataRegistry,
    args: &QueryArgs,
    cache: Option<RetentionPolicy>,
    fetch_size: Option<FetchSize>,
    json_mode: bool,
) -> Result<(), TesseraError> {
    let options = QueryOptions {
        result_cache: cache,
        fetch_size,
        load_results_at_commit: None,
    };
    let rows = run_query(config, metadata, args, &options)?;

    if json_mode {
        print_json(&serde_json::json!({
            "class": args.class,
            "count": rows.len(),
            "rows": rows,
        }));
        return Ok(());
    }

    for row in &rows {
        println!("{}", row);
    }
    println!("{} row(s)", rows.len());
    Ok(())
}

/// Database file named by `config`, if it is a local store.
pub fn database_path(config: &PersistenceConfig) -> Result<Option<PathBuf>, TesseraError> {
    Ok(match config.store_target()? {
        StoreTarget::Local(path) => Some(path),
        StoreTarget::Memory => None,
    })
}
