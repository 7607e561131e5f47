//! # Store Seam
//!
//! The contract between the mediation layer and a record store.
//!
//! Two capabilities are kept apart:
//! - `SchemaRegistry` knows which classes exist in the store and which cluster
//!   each one occupies
//! - `StoreClient` reads and writes individual records and runs queries
//!
//! `Store` is the combination every backend implements. All calls block.

use crate::metadata::ClassDescriptor;
use crate::query::NativeQuery;
use crate::{Identity, RecordId, StoredRecord, TesseraError, Value};

/// Result of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Record id, assigned by the store on insert.
    pub rid: RecordId,
    /// Version after the write.
    pub version: u64,
}

/// A delete of one record plus its dependents, applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Primary record.
    pub rid: RecordId,
    /// Version the caller last saw; `None` skips the check.
    pub expected_version: Option<u64>,
    /// Dependent records deleted with the primary. Missing ones are ignored.
    pub cascade: Vec<RecordId>,
}

/// Class registration in the store.
pub trait SchemaRegistry {
    /// Make sure the class exists in the store; returns its cluster.
    ///
    /// Idempotent: registering twice returns the same cluster.
    fn ensure_type_registered(&self, class: &ClassDescriptor) -> Result<u16, TesseraError>;

    /// Cluster of a registered store name, `None` if not registered.
    fn cluster_of(&self, store_name: &str) -> Result<Option<u16>, TesseraError>;

    /// Every registered store name with its cluster, in name order.
    fn registered_types(&self) -> Result<Vec<(String, u16)>, TesseraError>;
}

/// Record-level access to the store.
pub trait StoreClient {
    /// Insert (unassigned rid) or update (assigned rid) a record.
    ///
    /// Updates compare `expected_version` against the stored version inside
    /// the same atomic step as the write.
    ///
    /// # Errors
    ///
    /// - `OptimisticConflict` if the stored version differs from `expected_version`
    /// - `ObjectNotFound` if an update targets a missing record
    /// - `Unsupported` if the record still refers to an unsaved object
    fn save(
        &self,
        record: &StoredRecord,
        expected_version: Option<u64>,
    ) -> Result<SaveOutcome, TesseraError>;

    /// Delete a record and its dependents.
    fn delete(&self, request: &DeleteRequest) -> Result<(), TesseraError>;

    /// Load a record by id.
    fn load(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError>;

    /// Run a translated query.
    fn execute_query(&self, query: &NativeQuery) -> Result<Vec<StoredRecord>, TesseraError>;

    /// Number of stored records across all clusters.
    fn count_records(&self) -> Result<usize, TesseraError>;
}

/// A complete store backend.
pub trait Store: StoreClient + SchemaRegistry + Send + Sync {}

impl<T> Store for T where T: StoreClient + SchemaRegistry + Send + Sync {}

// =============================================================================
// SHARED CHECKS
// =============================================================================

/// Reject rows that still carry session handles.
pub(crate) fn check_writable(record: &StoredRecord) -> Result<(), TesseraError> {
    if record.fields.values().any(Value::contains_managed_link) {
        return Err(TesseraError::Unsupported(format!(
            "record of {} refers to an object that has not been stored",
            record.class
        )));
    }
    Ok(())
}

/// Compare a caller's version against the stored one.
pub(crate) fn check_version(
    rid: RecordId,
    expected: Option<u64>,
    actual: u64,
) -> Result<(), TesseraError> {
    match expected {
        Some(expected) if expected != actual => Err(TesseraError::OptimisticConflict {
            identity: Identity::Datastore(rid),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}
