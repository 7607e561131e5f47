//! # Sequences
//!
//! Blocks of ascending integer ids backed by one counter record per name.
//!
//! The counter record `{ entityName, currentValue }` holds the next id to
//! hand out. Reserving a block reads it, advances it and writes it back with
//! a version check, so a concurrent writer that moved the counter first makes
//! the reservation fail instead of overlap.
//!
//! The counter advances by the allocation size, or by the block size when a
//! larger block is requested.

use crate::config::PersistenceConfig;
use crate::connection::{ConnectionGuard, ConnectionProvider, SessionContext};
use crate::metadata::{ClassDescriptor, FieldDescriptor, MetadataRegistry};
use crate::primitives::{
    SEQUENCE_CLASS, SEQUENCE_INITIAL_VALUE, SEQUENCE_NAME_FIELD, SEQUENCE_VALUE_FIELD,
};
use crate::query::{Expr, Parameters, QuerySpec, QueryTranslator};
use crate::store::{SchemaRegistry, Store, StoreClient};
use crate::{RecordId, StoredRecord, TesseraError, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Descriptor of the counter record class.
#[must_use]
pub fn sequence_class() -> ClassDescriptor {
    ClassDescriptor::new(SEQUENCE_CLASS)
        .field(FieldDescriptor::scalar(SEQUENCE_NAME_FIELD))
        .field(FieldDescriptor::scalar(SEQUENCE_VALUE_FIELD))
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// Reserves id blocks from counter records.
#[derive(Debug)]
pub struct SequenceAllocator {
    metadata: MetadataRegistry,
    counter: Arc<ClassDescriptor>,
    allocation_size: i64,
}

impl SequenceAllocator {
    /// Allocator advancing counters by `allocation_size`.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::InvalidConfig` unless `allocation_size` is positive.
    pub fn new(allocation_size: i64) -> Result<Self, TesseraError> {
        if allocation_size < 1 {
            return Err(TesseraError::InvalidConfig(format!(
                "allocation size must be positive, got {}",
                allocation_size
            )));
        }
        let mut metadata = MetadataRegistry::new();
        let counter = metadata.register(sequence_class())?;
        Ok(Self {
            metadata,
            counter,
            allocation_size,
        })
    }

    /// Allocator using `config.allocation_size`.
    pub fn from_config(config: &PersistenceConfig) -> Result<Self, TesseraError> {
        Self::new(config.allocation_size)
    }

    /// Counter advance per reservation.
    #[must_use]
    pub const fn allocation_size(&self) -> i64 {
        self.allocation_size
    }

    /// Reserve `size` ascending ids for `name`.
    ///
    /// An absent counter starts at the initial value. A zero-size request
    /// returns nothing and leaves the counter alone.
    ///
    /// # Errors
    ///
    /// - `OptimisticConflict` if another writer moved the counter meanwhile
    /// - `DeserializationError` if the counter record holds no integer
    pub fn reserve_block(
        &self,
        store: &dyn Store,
        name: &str,
        size: usize,
    ) -> Result<Vec<i64>, TesseraError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let count = i64::try_from(size).map_err(|_| {
            TesseraError::Unsupported(format!("block of {} ids is too large", size))
        })?;

        let spec = QuerySpec::new(SEQUENCE_CLASS)
            .filter(Expr::path(SEQUENCE_NAME_FIELD).eq(Expr::param("name")));
        let params = Parameters::from([("name".to_string(), Value::text(name))]);
        let native = QueryTranslator::new(&self.metadata).translate(&spec, &params, store)?;

        let (mut row, expected) = match store.execute_query(&native)?.into_iter().next() {
            Some(row) => {
                let version = row.version;
                (row, Some(version))
            }
            None => {
                let cluster = store.ensure_type_registered(&self.counter)?;
                let row = StoredRecord {
                    rid: RecordId::unassigned(cluster),
                    version: 0,
                    class: SEQUENCE_CLASS.to_string(),
                    fields: [(SEQUENCE_NAME_FIELD.to_string(), Value::text(name))].into(),
                };
                (row, None)
            }
        };

        let first = match row.get(SEQUENCE_VALUE_FIELD) {
            None | Some(Value::Null) => SEQUENCE_INITIAL_VALUE,
            Some(value) => value.as_int().ok_or_else(|| {
                TesseraError::DeserializationError(format!(
                    "sequence {} holds a {} counter",
                    name,
                    value.kind()
                ))
            })?,
        };
        let overflow = || TesseraError::Unsupported(format!("sequence {} overflowed", name));
        let next = first
            .checked_add(self.allocation_size.max(count))
            .ok_or_else(overflow)?;
        let end = first.checked_add(count).ok_or_else(overflow)?;

        row.fields
            .insert(SEQUENCE_VALUE_FIELD.to_string(), Value::Int(next));
        store.save(&row, expected)?;
        tracing::debug!(sequence = name, first, size, next, "reserved id block");
        Ok((first..end).collect())
    }
}

// =============================================================================
// GENERATORS
// =============================================================================

/// Hands out ids one at a time from a cached reserved block.
#[derive(Debug)]
pub struct IncrementGenerator {
    name: String,
    allocator: SequenceAllocator,
    reserved: VecDeque<i64>,
    current: Option<i64>,
}

impl IncrementGenerator {
    /// Generator for the counter `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, allocator: SequenceAllocator) -> Self {
        Self {
            name: name.into(),
            allocator,
            reserved: VecDeque::new(),
            current: None,
        }
    }

    /// Counter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last id handed out.
    #[must_use]
    pub const fn current(&self) -> Option<i64> {
        self.current
    }

    /// Next id, reserving a new block when the cached one is used up.
    pub fn next(&mut self, store: &dyn Store) -> Result<i64, TesseraError> {
        let mut ids = self.allocate(store, 1)?;
        ids.pop()
            .ok_or_else(|| TesseraError::Unsupported(format!("sequence {} is empty", self.name)))
    }

    /// The next `count` ids.
    pub fn allocate(&mut self, store: &dyn Store, count: usize) -> Result<Vec<i64>, TesseraError> {
        if self.reserved.len() < count {
            let step = usize::try_from(self.allocator.allocation_size()).map_err(|_| {
                TesseraError::Unsupported(format!(
                    "allocation size {} does not fit in memory",
                    self.allocator.allocation_size()
                ))
            })?;
            let size = step.max(count - self.reserved.len());
            let block = self.allocator.reserve_block(store, &self.name, size)?;
            self.reserved.extend(block);
        }
        let ids: Vec<i64> = self.reserved.drain(..count).collect();
        if let Some(&last) = ids.last() {
            self.current = Some(last);
        }
        Ok(ids)
    }
}

/// A named sequence over a connection provider.
pub struct Sequence {
    generator: Mutex<IncrementGenerator>,
    provider: Arc<dyn ConnectionProvider>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("generator", &*self.generator.lock())
            .finish_non_exhaustive()
    }
}

impl Sequence {
    /// Sequence `name` drawing blocks through `provider`.
    pub fn new(
        name: impl Into<String>,
        allocator: SequenceAllocator,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            generator: Mutex::new(IncrementGenerator::new(name, allocator)),
            provider,
        }
    }

    /// Next id.
    pub fn next(&self) -> Result<i64, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider.as_ref(), &SessionContext::default())?;
        self.generator.lock().next(guard.store()?)
    }

    /// Last id handed out.
    #[must_use]
    pub fn current(&self) -> Option<i64> {
        self.generator.lock().current()
    }

    /// The next `count` ids.
    pub fn allocate(&self, count: usize) -> Result<Vec<i64>, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider.as_ref(), &SessionContext::default())?;
        self.generator.lock().allocate(guard.store()?, count)
    }
}

// =============================================================================
// TESTS
// =============================================================================
