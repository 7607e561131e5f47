//! # redb-backed Record Store
//!
//! A disk-backed store using the redb embedded database.
//!
//! Every save, delete and registration runs in its own write transaction, so
//! the version check of an update and the write itself are one atomic step.
//! Rows are encoded with postcard.

use crate::metadata::ClassDescriptor;
use crate::query::{NativeQuery, eval};
use crate::store::{
    DeleteRequest, SaveOutcome, SchemaRegistry, StoreClient, check_version, check_writable,
};
use crate::{RecordId, StoredRecord, TesseraError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};

/// Table for records: (cluster, position) -> serialized StoredRecord bytes
const RECORDS: TableDefinition<(u16, i64), &[u8]> = TableDefinition::new("records");

/// Table for clusters: store name -> cluster id
const CLUSTERS: TableDefinition<&str, u16> = TableDefinition::new("clusters");

/// Table for position counters: cluster id -> next position
const POSITIONS: TableDefinition<u16, i64> = TableDefinition::new("positions");

fn encode(record: &StoredRecord) -> Result<Vec<u8>, TesseraError> {
    postcard::to_allocvec(record).map_err(|e| TesseraError::SerializationError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<StoredRecord, TesseraError> {
    postcard::from_bytes(bytes).map_err(|e| TesseraError::DeserializationError(e.to_string()))
}

/// A disk-backed record store.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TesseraError> {
        let db = Database::create(path.as_ref())
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;

        // Initialize tables if they don't exist
        let write_txn = db
            .begin_write()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        {
            let _ = write_txn
                .open_table(RECORDS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            let _ = write_txn
                .open_table(CLUSTERS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            let _ = write_txn
                .open_table(POSITIONS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), "opened redb store");
        Ok(Self {
            db,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// SCHEMA REGISTRY
// =============================================================================

impl SchemaRegistry for RedbStore {
    fn ensure_type_registered(&self, class: &ClassDescriptor) -> Result<u16, TesseraError> {
        let name = class.store_name();
        if let Some(cluster) = self.cluster_of(name)? {
            return Ok(cluster);
        }

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let cluster = {
            let mut clusters = write_txn
                .open_table(CLUSTERS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            let existing = clusters
                .get(name)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?
                .map(|v| v.value());
            match existing {
                Some(cluster) => cluster,
                None => {
                    let count = clusters
                        .len()
                        .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                    let cluster = u16::try_from(count + 1).map_err(|_| {
                        TesseraError::Connectivity("cluster id space exhausted".to_string())
                    })?;
                    clusters
                        .insert(name, cluster)
                        .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                    let mut positions = write_txn
                        .open_table(POSITIONS)
                        .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                    positions
                        .insert(cluster, 0_i64)
                        .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                    tracing::debug!(class = %class.name, cluster, "registered class");
                    cluster
                }
            }
        };
        write_txn
            .commit()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        Ok(cluster)
    }

    fn cluster_of(&self, store_name: &str) -> Result<Option<u16>, TesseraError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let clusters = read_txn
            .open_table(CLUSTERS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        Ok(clusters
            .get(store_name)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?
            .map(|v| v.value()))
    }

    fn registered_types(&self) -> Result<Vec<(String, u16)>, TesseraError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let clusters = read_txn
            .open_table(CLUSTERS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;

        let mut out = Vec::new();
        for entry in clusters
            .iter()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?
        {
            let (key, value) = entry.map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            out.push((key.value().to_string(), value.value()));
        }
        Ok(out)
    }
}

// =============================================================================
// STORE CLIENT
// =============================================================================

impl StoreClient for RedbStore {
    fn save(
        &self,
        record: &StoredRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome, TesseraError> {
        check_writable(record)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let outcome = {
            let mut records = write_txn
                .open_table(RECORDS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;

            let mut stored = record.clone();
            if record.rid.is_persistent() {
                let key = (record.rid.cluster, record.rid.position);
                let current = match records
                    .get(key)
                    .map_err(|e| TesseraError::Connectivity(e.to_string()))?
                {
                    Some(bytes) => decode(bytes.value())?,
                    None => return Err(TesseraError::ObjectNotFound(record.rid.to_string())),
                };
                check_version(record.rid, expected_version, current.version)?;
                stored.version = current.version.saturating_add(1);
            } else {
                let cluster = record.rid.cluster;
                let mut positions = write_txn
                    .open_table(POSITIONS)
                    .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                let next = positions
                    .get(cluster)
                    .map_err(|e| TesseraError::Connectivity(e.to_string()))?
                    .map(|v| v.value())
                    .ok_or_else(|| TesseraError::UnknownClass(format!("cluster {}", cluster)))?;
                positions
                    .insert(cluster, next.saturating_add(1))
                    .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                stored.rid = RecordId::new(cluster, next);
                stored.version = 1;
            }

            let bytes = encode(&stored)?;
            records
                .insert((stored.rid.cluster, stored.rid.position), bytes.as_slice())
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            SaveOutcome {
                rid: stored.rid,
                version: stored.version,
            }
        };
        write_txn
            .commit()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        Ok(outcome)
    }

    fn delete(&self, request: &DeleteRequest) -> Result<(), TesseraError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        {
            let mut records = write_txn
                .open_table(RECORDS)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            let key = (request.rid.cluster, request.rid.position);
            let current = match records
                .get(key)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?
            {
                Some(bytes) => decode(bytes.value())?,
                None => return Err(TesseraError::ObjectNotFound(request.rid.to_string())),
            };
            check_version(request.rid, request.expected_version, current.version)?;

            records
                .remove(key)
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            for rid in &request.cascade {
                records
                    .remove((rid.cluster, rid.position))
                    .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        Ok(())
    }

    fn load(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let records = read_txn
            .open_table(RECORDS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        records
            .get((rid.cluster, rid.position))
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?
            .map(|bytes| decode(bytes.value()))
            .transpose()
    }

    fn execute_query(&self, query: &NativeQuery) -> Result<Vec<StoredRecord>, TesseraError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let records = read_txn
            .open_table(RECORDS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let clusters = read_txn
            .open_table(CLUSTERS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;

        let mut candidates = Vec::new();
        for target in &query.targets {
            let Some(cluster) = clusters
                .get(target.as_str())
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?
                .map(|v| v.value())
            else {
                continue;
            };
            for entry in records
                .range((cluster, 0_i64)..=(cluster, i64::MAX))
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?
            {
                let (_, value) = entry.map_err(|e| TesseraError::Connectivity(e.to_string()))?;
                candidates.push(decode(value.value())?);
            }
        }

        let loader = |rid: RecordId| -> Result<Option<StoredRecord>, TesseraError> {
            records
                .get((rid.cluster, rid.position))
                .map_err(|e| TesseraError::Connectivity(e.to_string()))?
                .map(|bytes| decode(bytes.value()))
                .transpose()
        };
        eval::apply(query, candidates, &loader)
    }

    fn count_records(&self) -> Result<usize, TesseraError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let records = read_txn
            .open_table(RECORDS)
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        let count = records
            .len()
            .map_err(|e| TesseraError::Connectivity(e.to_string()))?;
        Ok(count as usize)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::metadata::{FieldDescriptor, MetadataRegistry};
    use crate::query::{Direction, Expr, Parameters, QuerySpec, QueryTranslator};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn item_class() -> ClassDescriptor {
        ClassDescriptor::new("inv.Item")
            .field(FieldDescriptor::scalar("sku"))
            .field(FieldDescriptor::scalar("qty"))
    }

    fn item(cluster: u16, sku: &str, qty: i64) -> StoredRecord {
        StoredRecord {
            rid: RecordId::unassigned(cluster),
            version: 0,
            class: "inv.Item".into(),
            fields: BTreeMap::from([
                ("sku".to_string(), Value::text(sku)),
                ("qty".to_string(), Value::Int(qty)),
            ]),
        }
    }

    #[test]
    fn insert_and_load() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let cluster = store.ensure_type_registered(&item_class()).expect("register");

        let outcome = store.save(&item(cluster, "A-1", 4), None).expect("save");
        assert_eq!(outcome.rid, RecordId::new(cluster, 0));
        assert_eq!(outcome.version, 1);

        let loaded = store.load(outcome.rid).expect("load").expect("present");
        assert_eq!(loaded.get("sku"), Some(&Value::text("A-1")));
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn persistence() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let rid = {
            let store = RedbStore::open(&db_path).expect("open db");
            let cluster = store.ensure_type_registered(&item_class()).expect("register");
            store.save(&item(cluster, "A-1", 4), None).expect("save").rid
        };

        let store = RedbStore::open(&db_path).expect("reopen db");
        assert_eq!(store.count_records().expect("count"), 1);
        assert!(store.load(rid).expect("load").is_some());
        let cluster = store.ensure_type_registered(&item_class()).expect("register");
        assert_eq!(cluster, rid.cluster);
        let next = store.save(&item(cluster, "B-2", 1), None).expect("save");
        assert_eq!(next.rid.position, 1);
    }

    #[test]
    fn stale_update_leaves_record_untouched() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let cluster = store.ensure_type_registered(&item_class()).expect("register");
        let saved = store.save(&item(cluster, "A-1", 4), None).expect("save");

        let mut update = store.load(saved.rid).expect("load").expect("present");
        update.fields.insert("qty".into(), Value::Int(9));
        let result = store.save(&update, Some(7));
        assert!(matches!(
            result,
            Err(TesseraError::OptimisticConflict {
                expected: 7,
                actual: 1,
                ..
            })
        ));
        let after = store.load(saved.rid).expect("load").expect("present");
        assert_eq!(after.get("qty"), Some(&Value::Int(4)));
        assert_eq!(after.version, 1);
    }

    #[test]
    fn delete_missing_record_fails() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let result = store.delete(&DeleteRequest {
            rid: RecordId::new(1, 0),
            expected_version: None,
            cascade: Vec::new(),
        });
        assert!(matches!(result, Err(TesseraError::ObjectNotFound(_))));
    }

    #[test]
    fn query_orders_rows() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let meta = MetadataRegistry::new().with(item_class()).expect("meta");
        let cluster = store.ensure_type_registered(&item_class()).expect("register");
        for (sku, qty) in [("A", 3), ("B", 9), ("C", 1)] {
            store.save(&item(cluster, sku, qty), None).expect("save");
        }

        let spec = QuerySpec::new("inv.Item")
            .filter(Expr::path("qty").ge(Expr::literal(2)))
            .order_by("qty", Direction::Descending);
        let query = QueryTranslator::new(&meta)
            .translate(&spec, &Parameters::new(), &store)
            .expect("translate");
        let skus: Vec<_> = store
            .execute_query(&query)
            .expect("query")
            .into_iter()
            .map(|r| r.get("sku").cloned())
            .collect();
        assert_eq!(skus, vec![Some(Value::text("B")), Some(Value::text("A"))]);
    }
}
