//! # Session
//!
//! One logical unit of work: a private identity registry plus the collaborators
//! every operation needs (metadata, a connection provider, configuration).
//!
//! A session is used from one thread at a time. Every operation that reaches
//! the store acquires its own connection and releases it before returning.

use crate::activation::{ActivationReport, GraphActivator};
use crate::config::{PersistenceConfig, QueryOptions};
use crate::connection::{ConnectionGuard, ConnectionProvider, SessionContext};
use crate::identity::{FieldAccessor, IdentityResolver, ManagedObject};
use crate::metadata::MetadataRegistry;
use crate::persistence::PersistenceExecutor;
use crate::query::{NativeQuery, Parameters, QuerySpec, QueryTranslator, eval};
use crate::result::{ManagedRow, QueryResult, ResultRow, RowConverter};
use crate::store::StoreClient;
use crate::tracked::TrackedContainer;
use crate::{
    FieldMask, Identity, ObjectHandle, Record, RecordId, StoredRecord, TesseraError, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of work over one store.
pub struct Session {
    id: u64,
    metadata: Arc<MetadataRegistry>,
    provider: Arc<dyn ConnectionProvider>,
    config: PersistenceConfig,
    resolver: IdentityResolver,
    transaction_active: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("objects", &self.resolver.len())
            .field("transaction_active", &self.transaction_active)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a session.
    #[must_use]
    pub fn new(
        metadata: Arc<MetadataRegistry>,
        provider: Arc<dyn ConnectionProvider>,
        config: PersistenceConfig,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "session opened");
        Self {
            id,
            resolver: IdentityResolver::new(Arc::clone(&metadata)),
            metadata,
            provider,
            config,
            transaction_active: false,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Configuration the session was opened with.
    #[must_use]
    pub const fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Class metadata.
    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    /// The session's identity registry.
    #[must_use]
    pub const fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Check if a transaction is active.
    #[must_use]
    pub const fn is_transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Record transaction demarcation done by the caller.
    pub fn set_transaction_active(&mut self, active: bool) {
        self.transaction_active = active;
    }

    /// What connection providers are told about this session.
    #[must_use]
    pub const fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id,
            transaction_active: self.transaction_active,
        }
    }

    /// Register a new object, not yet stored.
    pub fn make_transient(&mut self, record: Record) -> Result<ObjectHandle, TesseraError> {
        self.resolver.register_transient(record)
    }

    /// Managed object behind `handle`.
    pub fn object(&self, handle: ObjectHandle) -> Result<&ManagedObject, TesseraError> {
        self.resolver.get(handle)
    }

    /// Read a field, activating it first if it is not loaded.
    pub fn field(&mut self, handle: ObjectHandle, name: &str) -> Result<Value, TesseraError> {
        let object = self.resolver.get(handle)?;
        let index = object.class().require_field(name)?;
        if object.state().is_persistent() && !object.loaded_fields().contains(index) {
            self.activate_mask(handle, FieldMask::single(index))?;
        }
        self.resolver.get(handle)?.read_field(index)
    }

    /// Replace a field value.
    pub fn set_field(
        &mut self,
        handle: ObjectHandle,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), TesseraError> {
        let object = self.resolver.get_mut(handle)?;
        let index = object.class().require_field(name)?;
        object.write_field(index, value.into())
    }

    /// Mutate a container field in place through its tracking wrapper.
    pub fn with_container<R>(
        &mut self,
        handle: ObjectHandle,
        name: &str,
        f: impl FnOnce(&mut TrackedContainer) -> Result<R, TesseraError>,
    ) -> Result<R, TesseraError> {
        let object = self.resolver.get(handle)?;
        let index = object.class().require_field(name)?;
        if object.state().is_persistent() && !object.loaded_fields().contains(index) {
            self.activate_mask(handle, FieldMask::single(index))?;
        }
        let object = self.resolver.get_mut(handle)?;
        object.wrap_container(index)?;
        let outcome = f(object.container_mut(index)?);
        object.note_container_change(index);
        outcome
    }

    /// Activate the named fields of a managed object.
    pub fn activate<S: AsRef<str>>(
        &mut self,
        handle: ObjectHandle,
        fields: &[S],
    ) -> Result<ActivationReport, TesseraError> {
        let mask = self.resolver.get(handle)?.class().mask_of(fields)?;
        self.activate_mask(handle, mask)
    }

    /// Activate the fields in `mask`.
    pub fn activate_mask(
        &mut self,
        handle: ObjectHandle,
        mask: FieldMask,
    ) -> Result<ActivationReport, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider.as_ref(), &self.context())?;
        GraphActivator::new(&mut self.resolver, guard.store()?).activate(handle, mask)
    }

    /// Translate a query without running it.
    pub fn translate(
        &self,
        spec: &QuerySpec,
        params: &Parameters,
    ) -> Result<NativeQuery, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider.as_ref(), &self.context())?;
        QueryTranslator::new(&self.metadata).translate(spec, params, guard.store()?)
    }

    /// Translate and run a query.
    ///
    /// Outside a transaction the query's connection closes before this
    /// returns, which pins every row when load-at-close is in effect.
    pub fn query(
        &mut self,
        spec: &QuerySpec,
        params: &Parameters,
        options: &QueryOptions,
    ) -> Result<QueryResult<SessionRows<'_>>, TesseraError> {
        let context = self.context();
        let settings = options.settings(&self.config, self.transaction_active);
        let guard = ConnectionGuard::acquire(self.provider.as_ref(), &context)?;
        let store = guard.store()?;
        let native = QueryTranslator::new(&self.metadata).translate(spec, params, store)?;
        let rows = store.execute_query(&native)?;
        tracing::debug!(query = %native, rows = rows.len(), "query executed");

        let converter = SessionRows {
            resolver: &mut self.resolver,
            provider: self.provider.as_ref(),
            context,
            candidate: native.candidate.clone(),
            projection: native.projection.clone(),
        };
        let result = QueryResult::new(rows, converter, settings)?;
        if !context.transaction_active {
            result.on_connection_closing()?;
        }
        drop(guard);
        Ok(result)
    }

    /// Write executor bound to this session.
    pub fn executor(&mut self) -> PersistenceExecutor<'_> {
        let context = self.context();
        PersistenceExecutor::new(
            &mut self.resolver,
            self.provider.as_ref(),
            context,
            self.config.optimistic,
        )
    }

    /// Insert a transient object and the transient objects it reaches.
    pub fn insert(&mut self, handle: ObjectHandle) -> Result<RecordId, TesseraError> {
        self.executor().insert(handle)
    }

    /// Write the dirty fields of a stored object.
    pub fn update(&mut self, handle: ObjectHandle) -> Result<bool, TesseraError> {
        self.executor().update(handle)
    }

    /// Delete a stored object and its dependents.
    pub fn delete(&mut self, handle: ObjectHandle) -> Result<(), TesseraError> {
        self.executor().delete(handle)
    }

    /// Refresh a stored object and activate `mask`.
    pub fn fetch(
        &mut self,
        handle: ObjectHandle,
        mask: FieldMask,
    ) -> Result<ActivationReport, TesseraError> {
        self.executor().fetch(handle, mask)
    }

    /// Object registered under `identity`, loaded if needed.
    pub fn find(
        &mut self,
        identity: &Identity,
        declared: &str,
    ) -> Result<Option<ObjectHandle>, TesseraError> {
        self.executor().find(identity, declared)
    }

    /// Check that a stored object still exists.
    pub fn locate(&mut self, handle: ObjectHandle) -> Result<(), TesseraError> {
        self.executor().locate(handle)
    }
}

// =============================================================================
// ROW CONVERSION
// =============================================================================

/// Converts query rows into session-managed rows.
///
/// Candidate rows are resolved through the session registry and their fields
/// activated; projected rows are evaluated against the raw record.
pub struct SessionRows<'s> {
    resolver: &'s mut IdentityResolver,
    provider: &'s dyn ConnectionProvider,
    context: SessionContext,
    candidate: String,
    projection: Option<Vec<Vec<String>>>,
}

impl RowConverter for SessionRows<'_> {
    fn convert(&mut self, raw: &StoredRecord) -> Result<ResultRow, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;

        if let Some(paths) = &self.projection {
            let loader = |rid: RecordId| store.load(rid);
            return eval::project(paths, raw, &loader).map(ResultRow::Projection);
        }

        let handle = self.resolver.resolve(raw, &self.candidate)?;
        let mask = self.resolver.get(handle)?.class().all_fields();
        GraphActivator::new(self.resolver, store).activate(handle, mask)?;

        let object = self.resolver.get(handle)?;
        let identity = object
            .identity()
            .cloned()
            .ok_or_else(|| TesseraError::IdentityDerivation(format!("{} has no identity", handle)))?;
        Ok(ResultRow::Object(ManagedRow {
            handle,
            identity,
            state: object.state(),
            record: object.current_record(),
        }))
    }
}

// =============================================================================
// TESTS
// =============================================================================
