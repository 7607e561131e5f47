//! # In-Memory Store
//!
//! A volatile record store. One cluster per registered class, positions
//! assigned sequentially per cluster, versions bumped on every write.

use crate::metadata::ClassDescriptor;
use crate::query::{NativeQuery, eval};
use crate::store::{
    DeleteRequest, SaveOutcome, SchemaRegistry, StoreClient, check_version, check_writable,
};
use crate::{RecordId, StoredRecord, TesseraError};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct MemoryState {
    clusters: BTreeMap<String, u16>,
    next_position: BTreeMap<u16, i64>,
    records: BTreeMap<RecordId, StoredRecord>,
}

impl MemoryState {
    fn cluster_records(&self, cluster: u16) -> impl Iterator<Item = &StoredRecord> {
        self.records
            .range(RecordId::new(cluster, 0)..=RecordId::new(cluster, i64::MAX))
            .map(|(_, record)| record)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaRegistry for MemoryStore {
    fn ensure_type_registered(&self, class: &ClassDescriptor) -> Result<u16, TesseraError> {
        let name = class.store_name();
        if let Some(&cluster) = self.state.read().clusters.get(name) {
            return Ok(cluster);
        }
        let mut state = self.state.write();
        if let Some(&cluster) = state.clusters.get(name) {
            return Ok(cluster);
        }
        let cluster = u16::try_from(state.clusters.len() + 1).map_err(|_| {
            TesseraError::Connectivity("cluster id space exhausted".to_string())
        })?;
        state.clusters.insert(name.to_string(), cluster);
        state.next_position.insert(cluster, 0);
        tracing::debug!(class = %class.name, cluster, "registered class");
        Ok(cluster)
    }

    fn cluster_of(&self, store_name: &str) -> Result<Option<u16>, TesseraError> {
        Ok(self.state.read().clusters.get(store_name).copied())
    }

    fn registered_types(&self) -> Result<Vec<(String, u16)>, TesseraError> {
        Ok(self
            .state
            .read()
            .clusters
            .iter()
            .map(|(name, &cluster)| (name.clone(), cluster))
            .collect())
    }
}

impl StoreClient for MemoryStore {
    fn save(
        &self,
        record: &StoredRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome, TesseraError> {
        check_writable(record)?;
        let mut state = self.state.write();

        if record.rid.is_persistent() {
            let current = state
                .records
                .get_mut(&record.rid)
                .ok_or_else(|| TesseraError::ObjectNotFound(record.rid.to_string()))?;
            check_version(record.rid, expected_version, current.version)?;
            let version = current.version.saturating_add(1);
            current.class.clone_from(&record.class);
            current.fields.clone_from(&record.fields);
            current.version = version;
            return Ok(SaveOutcome {
                rid: record.rid,
                version,
            });
        }

        let cluster = record.rid.cluster;
        let next = state
            .next_position
            .get_mut(&cluster)
            .ok_or_else(|| TesseraError::UnknownClass(format!("cluster {}", cluster)))?;
        let rid = RecordId::new(cluster, *next);
        *next = next.saturating_add(1);

        let mut stored = record.clone();
        stored.rid = rid;
        stored.version = 1;
        state.records.insert(rid, stored);
        Ok(SaveOutcome { rid, version: 1 })
    }

    fn delete(&self, request: &DeleteRequest) -> Result<(), TesseraError> {
        let mut state = self.state.write();
        let current = state
            .records
            .get(&request.rid)
            .ok_or_else(|| TesseraError::ObjectNotFound(request.rid.to_string()))?;
        check_version(request.rid, request.expected_version, current.version)?;

        state.records.remove(&request.rid);
        for rid in &request.cascade {
            state.records.remove(rid);
        }
        Ok(())
    }

    fn load(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError> {
        Ok(self.state.read().records.get(&rid).cloned())
    }

    fn execute_query(&self, query: &NativeQuery) -> Result<Vec<StoredRecord>, TesseraError> {
        let guard = self.state.read();
        let state: &MemoryState = &guard;
        let candidates: Vec<StoredRecord> = query
            .targets
            .iter()
            .filter_map(|name| state.clusters.get(name).copied())
            .flat_map(|cluster| state.cluster_records(cluster).cloned())
            .collect();
        let loader = |rid: RecordId| -> Result<Option<StoredRecord>, TesseraError> {
            Ok(state.records.get(&rid).cloned())
        };
        eval::apply(query, candidates, &loader)
    }

    fn count_records(&self) -> Result<usize, TesseraError> {
        Ok(self.state.read().records.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldDescriptor, MetadataRegistry};
    use crate::query::{Expr, Parameters, QuerySpec, QueryTranslator};
    use crate::{ObjectHandle, Value};
    use std::collections::BTreeMap;

    fn person_class() -> ClassDescriptor {
        ClassDescriptor::new("app.Person")
            .field(FieldDescriptor::scalar("name"))
            .field(FieldDescriptor::scalar("age"))
    }

    fn row(cluster: u16, name: &str, age: i64) -> StoredRecord {
        StoredRecord {
            rid: RecordId::unassigned(cluster),
            version: 0,
            class: "app.Person".into(),
            fields: BTreeMap::from([
                ("name".to_string(), Value::text(name)),
                ("age".to_string(), Value::Int(age)),
            ]),
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.ensure_type_registered(&person_class()).expect("register");
        let b = store.ensure_type_registered(&person_class()).expect("register");
        assert_eq!(a, b);
        assert_eq!(store.registered_types().expect("types"), vec![("Person".to_string(), a)]);
    }

    #[test]
    fn insert_assigns_positions_and_version() {
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&person_class()).expect("register");
        let first = store.save(&row(cluster, "Ann", 30), None).expect("save");
        let second = store.save(&row(cluster, "Bob", 20), None).expect("save");
        assert_eq!(first.rid, RecordId::new(cluster, 0));
        assert_eq!(second.rid, RecordId::new(cluster, 1));
        assert_eq!(first.version, 1);
        assert_eq!(store.count_records().expect("count"), 2);
    }

    #[test]
    fn update_checks_version() {
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&person_class()).expect("register");
        let saved = store.save(&row(cluster, "Ann", 30), None).expect("save");

        let mut update = store.load(saved.rid).expect("load").expect("present");
        update.fields.insert("age".into(), Value::Int(31));
        let outcome = store.save(&update, Some(1)).expect("update");
        assert_eq!(outcome.version, 2);

        let stale = store.save(&update, Some(1));
        assert!(matches!(
            stale,
            Err(TesseraError::OptimisticConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn rejects_unsaved_references() {
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&person_class()).expect("register");
        let mut rec = row(cluster, "Ann", 30);
        rec.fields
            .insert("friend".into(), Value::managed_link(ObjectHandle(1)));
        assert!(matches!(store.save(&rec, None), Err(TesseraError::Unsupported(_))));
        assert_eq!(store.count_records().expect("count"), 0);
    }

    #[test]
    fn delete_cascades() {
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&person_class()).expect("register");
        let a = store.save(&row(cluster, "Ann", 30), None).expect("save");
        let b = store.save(&row(cluster, "Bob", 20), None).expect("save");
        store
            .delete(&DeleteRequest {
                rid: a.rid,
                expected_version: Some(1),
                cascade: vec![b.rid, RecordId::new(cluster, 99)],
            })
            .expect("delete");
        assert_eq!(store.count_records().expect("count"), 0);
    }

    #[test]
    fn query_filters_rows() {
        let meta = MetadataRegistry::new().with(person_class()).expect("meta");
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&person_class()).expect("register");
        store.save(&row(cluster, "Ann", 30), None).expect("save");
        store.save(&row(cluster, "Bob", 12), None).expect("save");

        let spec = QuerySpec::new("app.Person").filter(Expr::path("age").gt(Expr::literal(18)));
        let query = QueryTranslator::new(&meta)
            .translate(&spec, &Parameters::new(), &store)
            .expect("translate");
        let rows = store.execute_query(&query).expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::text("Ann")));
    }
}
