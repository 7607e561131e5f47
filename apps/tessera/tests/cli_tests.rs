//! Command tests against a temporary redb database.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use tessera::cli::schema::SchemaFile;
use tessera::cli::{
    QueryArgs, build_spec, init_database, reserve_ids, resolve_config, run_query, status_report,
    translate_query,
};
use tessera_core::{
    ConnectionProvider, Expr, MetadataRegistry, PersistenceConfig, QueryOptions, Record,
    RetentionPolicy, Session, SharedStoreProvider, TesseraError, Value,
};

const SCHEMA: &str = r#"
    [[classes]]
    name = "app.Person"
    versioned = true

    [[classes.fields]]
    name = "name"

    [[classes.fields]]
    name = "age"

    [[classes.fields]]
    name = "friend"
    shape = "reference"
    target = "app.Person"

    [[classes]]
    name = "app.Employee"
    superclass = "app.Person"

    [[classes.fields]]
    name = "name"

    [[classes.fields]]
    name = "age"

    [[classes.fields]]
    name = "friend"
    shape = "reference"
    target = "app.Person"

    [[classes.fields]]
    name = "salary"
"#;

fn metadata() -> MetadataRegistry {
    SchemaFile::from_toml_str(SCHEMA).unwrap().registry().unwrap()
}

fn config(db: &Path) -> PersistenceConfig {
    resolve_config(None, Some(db)).unwrap()
}

fn seed_people(config: &PersistenceConfig) {
    let provider: Arc<dyn ConnectionProvider> =
        Arc::new(SharedStoreProvider::from_config(config).unwrap());
    let mut session = Session::new(Arc::new(metadata()), provider, config.clone());
    for (class, name, age) in [
        ("app.Person", "Ann", 41),
        ("app.Person", "Bob", 17),
        ("app.Employee", "Cid", 35),
    ] {
        let handle = session
            .make_transient(
                Record::new(class)
                    .with("name", Value::text(name))
                    .with("age", Value::Int(age)),
            )
            .unwrap();
        session.insert(handle).unwrap();
    }
}

fn person_query() -> QueryArgs {
    QueryArgs {
        class: "app.Person".to_string(),
        ..QueryArgs::default()
    }
}

// =============================================================================
// INIT & STATUS
// =============================================================================

#[test]
fn init_registers_schema_classes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));

    let registered = init_database(&config, &metadata(), false).unwrap();
    let names: Vec<&str> = registered.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["Employee", "Person"]);

    let report = status_report(&config).unwrap();
    assert_eq!(report.records, 0);
    assert_eq!(report.classes.len(), 2);
}

#[test]
fn init_refuses_existing_database_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));
    init_database(&config, &metadata(), false).unwrap();
    seed_people(&config);

    assert!(matches!(
        init_database(&config, &metadata(), false),
        Err(TesseraError::IoError(_))
    ));

    init_database(&config, &metadata(), true).unwrap();
    assert_eq!(status_report(&config).unwrap().records, 0);
}

#[test]
fn status_counts_records_per_class() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));
    seed_people(&config);

    let report = status_report(&config).unwrap();
    assert_eq!(report.records, 3);
    let person = report.classes.iter().find(|c| c.name == "Person").unwrap();
    let employee = report.classes.iter().find(|c| c.name == "Employee").unwrap();
    assert_eq!(person.records, 2);
    assert_eq!(employee.records, 1);
}

// =============================================================================
// SEQUENCES
// =============================================================================

#[test]
fn sequence_blocks_survive_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));

    assert_eq!(reserve_ids(&config, "Order", 2).unwrap(), vec![1, 2]);
    // The first call advanced the counter by the allocation size.
    assert_eq!(reserve_ids(&config, "Order", 1).unwrap(), vec![6]);
    assert_eq!(reserve_ids(&config, "Invoice", 1).unwrap(), vec![1]);
}

// =============================================================================
// QUERIES
// =============================================================================

#[test]
fn translate_renders_bound_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));
    let filter = Expr::path("age").gt(Expr::param("min"));

    let args = QueryArgs {
        filter_json: Some(serde_json::to_string(&filter).unwrap()),
        params_json: Some(r#"{"min": 30}"#.to_string()),
        ..person_query()
    };
    let native = translate_query(&config, &metadata(), &args).unwrap();
    assert!(native.text.starts_with("select from Person where age > 30"));
    assert_eq!(native.targets, vec!["Person".to_string(), "Employee".to_string()]);
}

#[test]
fn bad_ordering_direction_is_rejected() {
    let args = QueryArgs {
        order_by: vec!["age:sideways".to_string()],
        ..person_query()
    };
    assert!(matches!(build_spec(&args), Err(TesseraError::Translation(_))));
}

#[test]
fn query_materializes_ordered_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));
    seed_people(&config);

    let args = QueryArgs {
        filter_json: Some(serde_json::to_string(&Expr::path("age").ge(Expr::param("min"))).unwrap()),
        params_json: Some(r#"{"min": 18}"#.to_string()),
        order_by: vec!["age:desc".to_string()],
        ..person_query()
    };
    let options = QueryOptions {
        result_cache: Some(RetentionPolicy::Hard),
        ..QueryOptions::default()
    };
    let rows = run_query(&config, metadata(), &args, &options).unwrap();

    let names: Vec<&str> = rows
        .iter()
        .map(|r| r["fields"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Ann", "Cid"]);
    assert_eq!(rows[1]["class"], "app.Employee");
    assert_eq!(rows[0]["state"], "clean");
}

#[test]
fn exact_projection_skips_subclasses() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("t.redb"));
    seed_people(&config);

    let args = QueryArgs {
        exact: true,
        project: vec!["name".to_string()],
        order_by: vec!["name".to_string()],
        ..person_query()
    };
    let rows = run_query(&config, metadata(), &args, &QueryOptions::default()).unwrap();
    assert_eq!(rows, vec![serde_json::json!(["Ann"]), serde_json::json!(["Bob"])]);
}
