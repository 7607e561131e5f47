//! # Persistence Executor
//!
//! Orchestrates writes and lookups through the identity registry, the graph
//! activator and one store connection per call.
//!
//! ## Write sequence
//!
//! ```text
//! begin -> read version (optimistic + versioned) -> compare or fail
//!       -> push field values -> store write -> capture identity + version
//!       -> commit tracking state
//! ```
//!
//! A version mismatch aborts before anything is written.
//!
//! ## Insert by reachability
//!
//! Links to transient objects are followed and those objects inserted first,
//! within one `InsertContext`. When two new objects refer to each other, the
//! one reached second is written with a placeholder and re-saved once its
//! partner has a record id.
//!
//! If a write fails partway, objects already written stay `Clean` under
//! their new identity, and links that still point at unsaved partners are
//! kept as dirty fields for the next update. The failed object stays
//! `Transient`.

use crate::activation::{ActivationReport, GraphActivator, referenced_records};
use crate::connection::{ConnectionGuard, ConnectionProvider, SessionContext};
use crate::identity::{FieldAccessor, IdentityResolver};
use crate::metadata::IdentityStrategy;
use crate::query::{Expr, Parameters, QuerySpec, QueryTranslator};
use crate::store::{DeleteRequest, SchemaRegistry, Store, StoreClient};
use crate::{
    FieldMask, Identity, LifecycleState, Link, ObjectHandle, Record, RecordId, StoredRecord,
    TesseraError, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// INSERT CONTEXT
// =============================================================================

/// Objects touched by one insert call.
#[derive(Debug, Default)]
pub struct InsertContext {
    affected: Vec<ObjectHandle>,
    in_progress: BTreeSet<ObjectHandle>,
    fixups: Vec<(ObjectHandle, Record)>,
}

impl InsertContext {
    /// Objects inserted so far, in write order.
    #[must_use]
    pub fn affected(&self) -> &[ObjectHandle] {
        &self.affected
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Runs insert, update, delete and lookup calls for one session.
pub struct PersistenceExecutor<'s> {
    resolver: &'s mut IdentityResolver,
    provider: &'s dyn ConnectionProvider,
    context: SessionContext,
    optimistic: bool,
}

impl<'s> PersistenceExecutor<'s> {
    /// Create an executor over a session registry.
    pub fn new(
        resolver: &'s mut IdentityResolver,
        provider: &'s dyn ConnectionProvider,
        context: SessionContext,
        optimistic: bool,
    ) -> Self {
        Self {
            resolver,
            provider,
            context,
            optimistic,
        }
    }

    /// Insert a transient object and every transient object it reaches.
    ///
    /// Returns the record id of `handle`. Inserting an already stored object
    /// returns its record id without writing.
    ///
    /// # Errors
    ///
    /// - `DuplicateIdentity` if an application key is already registered
    /// - `IdentityDerivation` if no identity can be captured after the write
    /// - `ObjectDeleted` if a reached object has been deleted
    pub fn insert(&mut self, handle: ObjectHandle) -> Result<RecordId, TesseraError> {
        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;
        let mut ctx = InsertContext::default();
        let rid = match self.insert_object(store, handle, &mut ctx) {
            Ok(rid) => rid,
            Err(e) => return Err(self.abandon_inserts(&mut ctx, e)),
        };
        self.finish_inserts(store, &mut ctx)?;
        tracing::debug!(%handle, %rid, inserted = ctx.affected.len(), "insert complete");
        Ok(rid)
    }

    /// Write the dirty fields of a stored object.
    ///
    /// Returns `false` when nothing was dirty and no write happened.
    ///
    /// # Errors
    ///
    /// - `OptimisticConflict` if the stored version moved since it was read
    /// - `ObjectNotFound` if the record is gone
    /// - `ObjectDeleted` if the object has been deleted
    pub fn update(&mut self, handle: ObjectHandle) -> Result<bool, TesseraError> {
        let object = self.resolver.get(handle)?;
        let rid = Self::stored_rid(handle, object.state(), object.rid())?;
        if object.dirty_fields().is_empty() {
            return Ok(false);
        }
        let class = Arc::clone(object.class());
        let record = object.current_record();

        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;
        let expected = if self.optimistic && class.versioned {
            self.check_version(store, handle, rid)?
        } else {
            None
        };

        let mut ctx = InsertContext::default();
        let fields = match self.store_fields(store, record, &mut ctx, &mut false) {
            Ok(fields) => fields,
            Err(e) => return Err(self.abandon_inserts(&mut ctx, e)),
        };
        self.finish_inserts(store, &mut ctx)?;

        let row = StoredRecord {
            rid,
            version: expected.unwrap_or_default(),
            class: class.name.clone(),
            fields,
        };
        let outcome = store.save(&row, expected)?;

        let object = self.resolver.get_mut(handle)?;
        object.mark_flushed();
        object.set_version(Some(outcome.version));
        object.set_state(LifecycleState::Clean);
        tracing::debug!(%handle, %rid, version = outcome.version, "update complete");
        Ok(true)
    }

    /// Delete a stored object together with its dependent objects.
    ///
    /// Every field of the object (and of each dependent) is activated first so
    /// the full cascade is known before the store delete.
    pub fn delete(&mut self, handle: ObjectHandle) -> Result<(), TesseraError> {
        let object = self.resolver.get(handle)?;
        let rid = Self::stored_rid(handle, object.state(), object.rid())?;
        let versioned = object.class().versioned;

        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;

        let mut visited = BTreeSet::from([rid]);
        let mut cascade = Vec::new();
        let mut doomed = vec![handle];
        let mut pending = vec![handle];
        while let Some(current) = pending.pop() {
            let mask = self.resolver.get(current)?.class().all_fields();
            GraphActivator::new(self.resolver, store).activate(current, mask)?;
            let object = self.resolver.get(current)?;
            let class = Arc::clone(object.class());
            for (index, field) in class.fields.iter().enumerate() {
                if !field.dependent {
                    continue;
                }
                let value = object.read_field(index)?;
                for (dependent, _) in referenced_records(&field.shape, &value) {
                    if !visited.insert(dependent) {
                        continue;
                    }
                    cascade.push(dependent);
                    if let Some(dep) = self.resolver.lookup_rid(dependent) {
                        doomed.push(dep);
                        pending.push(dep);
                    }
                }
            }
        }

        let expected_version = if self.optimistic && versioned {
            self.check_version(store, handle, rid)?
        } else {
            None
        };
        let cascaded = cascade.len();
        store.delete(&DeleteRequest {
            rid,
            expected_version,
            cascade,
        })?;

        for doomed in doomed {
            if let Some(identity) = self.resolver.get(doomed)?.identity().cloned() {
                self.resolver.detach(&identity);
            }
            self.resolver.get_mut(doomed)?.set_state(LifecycleState::Deleted);
        }
        tracing::debug!(%handle, %rid, cascaded, "delete complete");
        Ok(())
    }

    /// Reload a stored object's clean fields and activate `mask`.
    pub fn fetch(
        &mut self,
        handle: ObjectHandle,
        mask: FieldMask,
    ) -> Result<ActivationReport, TesseraError> {
        let object = self.resolver.get(handle)?;
        let rid = Self::stored_rid(handle, object.state(), object.rid())?;
        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;
        let raw = store
            .load(rid)?
            .ok_or_else(|| TesseraError::ObjectNotFound(rid.to_string()))?;
        self.resolver.get_mut(handle)?.refresh_from(&raw);
        GraphActivator::new(self.resolver, store).activate(handle, mask)
    }

    /// Object registered under `identity`, loading it `Hollow` if needed.
    ///
    /// Application identities are looked up with a key-equality query over
    /// `declared` and its subclasses.
    pub fn find(
        &mut self,
        identity: &Identity,
        declared: &str,
    ) -> Result<Option<ObjectHandle>, TesseraError> {
        if let Some(handle) = self.resolver.lookup(identity) {
            return Ok(Some(handle));
        }
        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        let store = guard.store()?;
        let raw = match identity {
            Identity::Datastore(rid) => store.load(*rid)?,
            Identity::Application { key, .. } => {
                let class = self.resolver.metadata().get(declared)?;
                let mut filter: Option<Expr> = None;
                for (field, value) in class.key_fields().iter().zip(key) {
                    let term = Expr::path(field).eq(Expr::literal(value.clone()));
                    filter = Some(match filter {
                        Some(f) => f.and(term),
                        None => term,
                    });
                }
                let mut spec = QuerySpec::new(declared);
                if let Some(filter) = filter {
                    spec = spec.filter(filter);
                }
                let native = QueryTranslator::new(self.resolver.metadata())
                    .translate(&spec, &Parameters::new(), store)?;
                store.execute_query(&native)?.into_iter().next()
            }
        };
        raw.map(|raw| self.resolver.resolve(&raw, declared)).transpose()
    }

    /// Check that a stored object still exists in the store.
    pub fn locate(&mut self, handle: ObjectHandle) -> Result<(), TesseraError> {
        let object = self.resolver.get(handle)?;
        let rid = Self::stored_rid(handle, object.state(), object.rid())?;
        let guard = ConnectionGuard::acquire(self.provider, &self.context)?;
        match guard.store()?.load(rid)? {
            Some(_) => Ok(()),
            None => Err(TesseraError::ObjectNotFound(rid.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    fn stored_rid(
        handle: ObjectHandle,
        state: LifecycleState,
        rid: Option<RecordId>,
    ) -> Result<RecordId, TesseraError> {
        match (state, rid) {
            (LifecycleState::Deleted, _) => Err(TesseraError::ObjectDeleted(handle)),
            (state, Some(rid)) if state.is_persistent() => Ok(rid),
            _ => Err(TesseraError::ObjectNotFound(format!("{} is not stored", handle))),
        }
    }

    /// Compare the version the object was read at with the stored one.
    fn check_version(
        &self,
        store: &dyn Store,
        handle: ObjectHandle,
        rid: RecordId,
    ) -> Result<Option<u64>, TesseraError> {
        let object = self.resolver.get(handle)?;
        let current = store
            .load(rid)?
            .ok_or_else(|| TesseraError::ObjectNotFound(rid.to_string()))?;
        let seen = object.version().unwrap_or_default();
        if current.version != seen {
            tracing::debug!(%handle, %rid, seen, actual = current.version, "version moved");
            return Err(TesseraError::OptimisticConflict {
                identity: object
                    .identity()
                    .cloned()
                    .unwrap_or(Identity::Datastore(rid)),
                expected: seen,
                actual: current.version,
            });
        }
        Ok(Some(seen))
    }

    fn insert_object(
        &mut self,
        store: &dyn Store,
        handle: ObjectHandle,
        ctx: &mut InsertContext,
    ) -> Result<RecordId, TesseraError> {
        let object = self.resolver.get(handle)?;
        match (object.state(), object.rid()) {
            (LifecycleState::Deleted, _) => return Err(TesseraError::ObjectDeleted(handle)),
            (state, Some(rid)) if state.is_persistent() => return Ok(rid),
            _ => {}
        }
        let class = Arc::clone(object.class());
        let record = object.current_record();

        if matches!(class.identity, IdentityStrategy::Application { .. }) {
            let identity = self.resolver.application_identity(&class, &record)?;
            if self.resolver.lookup(&identity).is_some_and(|h| h != handle) {
                return Err(TesseraError::DuplicateIdentity(identity));
            }
        }

        ctx.in_progress.insert(handle);
        let mut placeholder = false;
        let fields = self.store_fields(store, record.clone(), ctx, &mut placeholder)?;
        ctx.in_progress.remove(&handle);

        let cluster = store.ensure_type_registered(&class)?;
        let row = StoredRecord {
            rid: RecordId::unassigned(cluster),
            version: 0,
            class: class.name.clone(),
            fields,
        };
        let outcome = store.save(&row, None)?;
        let stored = StoredRecord {
            rid: outcome.rid,
            version: outcome.version,
            ..row
        };

        let identity = self.resolver.derive_identity(&class, &stored).inspect_err(|e| {
            tracing::warn!(%handle, rid = %outcome.rid, error = %e, "no identity after insert");
        })?;
        self.resolver
            .attach_identity(handle, identity, outcome.rid, outcome.version)?;

        let object = self.resolver.get_mut(handle)?;
        object.mark_flushed();
        object.refresh_from(&stored);
        object.mark_loaded(class.all_fields());
        object.set_state(LifecycleState::Clean);

        ctx.affected.push(handle);
        if placeholder {
            ctx.fixups.push((handle, record));
        }
        tracing::debug!(%handle, rid = %outcome.rid, class = %class.name, "inserted");
        Ok(outcome.rid)
    }

    /// Re-save cycle placeholders, then wrap containers of every inserted object.
    fn finish_inserts(
        &mut self,
        store: &dyn Store,
        ctx: &mut InsertContext,
    ) -> Result<(), TesseraError> {
        for (handle, record) in std::mem::take(&mut ctx.fixups) {
            let class = record.class.clone();
            let fields = self.store_fields(store, record, ctx, &mut false)?;
            let object = self.resolver.get(handle)?;
            let rid = Self::stored_rid(handle, object.state(), object.rid())?;
            let version = object.version();
            let row = StoredRecord {
                rid,
                version: version.unwrap_or_default(),
                class,
                fields,
            };
            let outcome = store.save(&row, version)?;
            self.resolver.get_mut(handle)?.refresh_from(&StoredRecord {
                version: outcome.version,
                ..row
            });
            tracing::debug!(%handle, %rid, "cycle placeholder patched");
        }
        for &handle in &ctx.affected {
            self.resolver.get_mut(handle)?.wrap_all_containers()?;
        }
        Ok(())
    }

    /// Settle the objects a failed insert already wrote, then hand back `error`.
    ///
    /// Placeholder links are restored as dirty fields since their partner
    /// never reached the store.
    fn abandon_inserts(&mut self, ctx: &mut InsertContext, error: TesseraError) -> TesseraError {
        ctx.in_progress.clear();
        if let Err(settle) = self.settle_written(ctx) {
            tracing::warn!(error = %settle, "could not settle partially inserted objects");
        }
        tracing::debug!(written = ctx.affected.len(), error = %error, "insert abandoned");
        error
    }

    fn settle_written(&mut self, ctx: &mut InsertContext) -> Result<(), TesseraError> {
        for (handle, record) in std::mem::take(&mut ctx.fixups) {
            let object = self.resolver.get_mut(handle)?;
            let class = Arc::clone(object.class());
            for (index, field) in class.fields.iter().enumerate() {
                if let Some(value) = record.get(&field.name).filter(|v| v.contains_managed_link()) {
                    object.write_field(index, value.clone())?;
                }
            }
        }
        for &handle in &ctx.affected {
            self.resolver.get_mut(handle)?.wrap_all_containers()?;
        }
        Ok(())
    }

    fn store_fields(
        &mut self,
        store: &dyn Store,
        record: Record,
        ctx: &mut InsertContext,
        placeholder: &mut bool,
    ) -> Result<BTreeMap<String, Value>, TesseraError> {
        let mut fields = BTreeMap::new();
        for (name, value) in record.fields {
            fields.insert(name, self.store_links(store, value, ctx, placeholder)?);
        }
        Ok(fields)
    }

    /// Replace session links with store links, inserting transient targets.
    fn store_links(
        &mut self,
        store: &dyn Store,
        value: Value,
        ctx: &mut InsertContext,
        placeholder: &mut bool,
    ) -> Result<Value, TesseraError> {
        match value {
            Value::Link(Link::Managed(target)) => {
                if ctx.in_progress.contains(&target) {
                    *placeholder = true;
                    return Ok(Value::Null);
                }
                let rid = self.insert_object(store, target, ctx)?;
                Ok(Value::stored_link(rid))
            }
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.store_links(store, item, ctx, placeholder)?);
                }
                Ok(Value::List(out))
            }
            Value::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, item) in entries {
                    let key = self.store_links(store, key, ctx, placeholder)?;
                    out.insert(key, self.store_links(store, item, ctx, placeholder)?);
                }
                Ok(Value::Map(out))
            }
            other => Ok(other),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::connection::SharedStoreProvider;
    use crate::metadata::{ClassDescriptor, ElementKind, FieldDescriptor, MetadataRegistry};
    use crate::query::NativeQuery;
    use crate::session::Session;
    use crate::storage::MemoryStore;
    use crate::store::SaveOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metadata() -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                ClassDescriptor::new("app.Node")
                    .versioned()
                    .field(FieldDescriptor::scalar("label"))
                    .field(FieldDescriptor::reference("next", "app.Node"))
                    .field(FieldDescriptor::collection("tags", ElementKind::Scalar))
                    .field(FieldDescriptor::reference("part", "app.Node").dependent()),
            )
            .expect("node")
            .with(
                ClassDescriptor::new("app.Account")
                    .application_identity(["code"])
                    .field(FieldDescriptor::scalar("code")),
            )
            .expect("account")
    }

    fn session_over(store: Arc<dyn Store>) -> Session {
        let provider = Arc::new(SharedStoreProvider::new(store));
        Session::new(Arc::new(metadata()), provider, PersistenceConfig::default())
    }

    fn session() -> (Session, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (session_over(store.clone()), store)
    }

    /// Memory store whose saves can fail or lose the assigned record id.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        saves: AtomicUsize,
        fail_at: Option<usize>,
        drop_rid: bool,
    }

    impl SchemaRegistry for FaultyStore {
        fn ensure_type_registered(&self, class: &ClassDescriptor) -> Result<u16, TesseraError> {
            self.inner.ensure_type_registered(class)
        }

        fn cluster_of(&self, store_name: &str) -> Result<Option<u16>, TesseraError> {
            self.inner.cluster_of(store_name)
        }

        fn registered_types(&self) -> Result<Vec<(String, u16)>, TesseraError> {
            self.inner.registered_types()
        }
    }

    impl StoreClient for FaultyStore {
        fn save(
            &self,
            record: &StoredRecord,
            expected_version: Option<u64>,
        ) -> Result<SaveOutcome, TesseraError> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(n) {
                return Err(TesseraError::Connectivity(format!("save {} refused", n)));
            }
            let outcome = self.inner.save(record, expected_version)?;
            if self.drop_rid {
                return Ok(SaveOutcome {
                    rid: RecordId::unassigned(outcome.rid.cluster),
                    version: outcome.version,
                });
            }
            Ok(outcome)
        }

        fn delete(&self, request: &DeleteRequest) -> Result<(), TesseraError> {
            self.inner.delete(request)
        }

        fn load(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError> {
            self.inner.load(rid)
        }

        fn execute_query(&self, query: &NativeQuery) -> Result<Vec<StoredRecord>, TesseraError> {
            self.inner.execute_query(query)
        }

        fn count_records(&self) -> Result<usize, TesseraError> {
            self.inner.count_records()
        }
    }

    fn node(session: &mut Session, label: &str) -> ObjectHandle {
        session
            .make_transient(Record::new("app.Node").with("label", label))
            .expect("transient")
    }

    #[test]
    fn insert_follows_reachable_transients() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let b = node(&mut s, "b");
        s.set_field(a, "next", Value::managed_link(b)).expect("link");
        let rid = s.insert(a).expect("insert");
        let b_rid = s.object(b).expect("b").rid().expect("b stored");
        let raw = store.load(rid).expect("load").expect("present");
        assert_eq!(raw.get("next"), Some(&Value::stored_link(b_rid)));
        assert_eq!(s.object(a).expect("a").state(), LifecycleState::Clean);
        assert_eq!(store.count_records().expect("count"), 2);
    }

    #[test]
    fn insert_patches_cycles() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let b = node(&mut s, "b");
        s.set_field(a, "next", Value::managed_link(b)).expect("link");
        s.set_field(b, "next", Value::managed_link(a)).expect("link");
        let a_rid = s.insert(a).expect("insert");
        let b_rid = s.object(b).expect("b").rid().expect("b stored");
        let a_raw = store.load(a_rid).expect("load").expect("a");
        let b_raw = store.load(b_rid).expect("load").expect("b");
        assert_eq!(a_raw.get("next"), Some(&Value::stored_link(b_rid)));
        assert_eq!(b_raw.get("next"), Some(&Value::stored_link(a_rid)));
        assert_eq!(s.object(b).expect("b").version(), Some(b_raw.version));
    }

    #[test]
    fn insert_wraps_containers() {
        let (mut s, _store) = session();
        let a = node(&mut s, "a");
        s.insert(a).expect("insert");
        let object = s.object(a).expect("a");
        assert!(object.is_wrapped(2));
        assert!(object.dirty_fields().is_empty());
    }

    #[test]
    fn duplicate_application_key_is_rejected_before_write() {
        let (mut s, store) = session();
        let first = s
            .make_transient(Record::new("app.Account").with("code", "X1"))
            .expect("transient");
        s.insert(first).expect("insert");
        let second = s
            .make_transient(Record::new("app.Account").with("code", "X1"))
            .expect("transient");
        assert!(matches!(
            s.insert(second),
            Err(TesseraError::DuplicateIdentity(_))
        ));
        assert_eq!(store.count_records().expect("count"), 1);
    }

    #[test]
    fn update_writes_only_when_dirty() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let rid = s.insert(a).expect("insert");
        assert!(!s.update(a).expect("noop"));
        s.set_field(a, "label", "renamed").expect("set");
        assert!(s.update(a).expect("update"));
        let raw = store.load(rid).expect("load").expect("a");
        assert_eq!(raw.get("label"), Some(&Value::text("renamed")));
        assert_eq!(s.object(a).expect("a").version(), Some(raw.version));
    }

    #[test]
    fn delete_cascades_to_dependents() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let part = node(&mut s, "part");
        let other = node(&mut s, "other");
        s.set_field(a, "part", Value::managed_link(part)).expect("link");
        s.set_field(a, "next", Value::managed_link(other)).expect("link");
        s.insert(a).expect("insert");
        s.delete(a).expect("delete");
        assert_eq!(store.count_records().expect("count"), 1);
        assert_eq!(s.object(a).expect("a").state(), LifecycleState::Deleted);
        assert_eq!(s.object(part).expect("part").state(), LifecycleState::Deleted);
        assert_eq!(s.object(other).expect("other").state(), LifecycleState::Clean);
        assert!(matches!(s.update(a), Err(TesseraError::ObjectDeleted(_))));
    }

    #[test]
    fn find_by_application_key() {
        let (mut s, _store) = session();
        let account = s
            .make_transient(Record::new("app.Account").with("code", "K9"))
            .expect("transient");
        s.insert(account).expect("insert");
        let identity = s.object(account).expect("account").identity().cloned().expect("identity");
        assert_eq!(s.find(&identity, "app.Account").expect("find"), Some(account));
    }

    #[test]
    fn locate_reports_missing_records() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let rid = s.insert(a).expect("insert");
        s.locate(a).expect("present");
        store
            .delete(&DeleteRequest {
                rid,
                expected_version: None,
                cascade: Vec::new(),
            })
            .expect("external delete");
        assert!(matches!(s.locate(a), Err(TesseraError::ObjectNotFound(_))));
        let t = node(&mut s, "t");
        assert!(matches!(s.locate(t), Err(TesseraError::ObjectNotFound(_))));
    }

    #[test]
    fn insert_without_record_id_leaves_object_transient() {
        let store = Arc::new(FaultyStore {
            drop_rid: true,
            ..FaultyStore::default()
        });
        let mut s = session_over(store.clone());
        let a = node(&mut s, "a");
        assert!(matches!(s.insert(a), Err(TesseraError::IdentityDerivation(_))));
        let object = s.object(a).expect("a");
        assert_eq!(object.state(), LifecycleState::Transient);
        assert_eq!(object.rid(), None);
        assert!(object.identity().is_none());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_insert_keeps_written_objects_consistent() {
        let store = Arc::new(FaultyStore {
            fail_at: Some(2),
            ..FaultyStore::default()
        });
        let mut s = session_over(store.clone());
        let a = node(&mut s, "a");
        let b = node(&mut s, "b");
        s.set_field(a, "next", Value::managed_link(b)).expect("link");
        assert!(matches!(s.insert(a), Err(TesseraError::Connectivity(_))));

        let object = s.object(a).expect("a");
        assert_eq!(object.state(), LifecycleState::Transient);
        assert_eq!(object.rid(), None);

        let object = s.object(b).expect("b");
        let b_rid = object.rid().expect("b stored");
        assert_eq!(object.state(), LifecycleState::Clean);
        assert!(object.is_wrapped(2));
        assert_eq!(s.find(&Identity::Datastore(b_rid), "app.Node").expect("find"), Some(b));
        assert_eq!(store.count_records().expect("count"), 1);

        let a_rid = s.insert(a).expect("retry");
        let raw = store.load(a_rid).expect("load").expect("a");
        assert_eq!(raw.get("next"), Some(&Value::stored_link(b_rid)));
        assert_eq!(store.count_records().expect("count"), 2);
    }

    #[test]
    fn failed_cycle_insert_keeps_pending_link_dirty() {
        let store = Arc::new(FaultyStore {
            fail_at: Some(2),
            ..FaultyStore::default()
        });
        let mut s = session_over(store.clone());
        let a = node(&mut s, "a");
        let b = node(&mut s, "b");
        s.set_field(a, "next", Value::managed_link(b)).expect("link");
        s.set_field(b, "next", Value::managed_link(a)).expect("link");
        assert!(s.insert(a).is_err());

        let object = s.object(b).expect("b");
        assert_eq!(object.state(), LifecycleState::Dirty);
        assert!(object.dirty_fields().contains(1));
        assert_eq!(object.current_record().get("next"), Some(&Value::managed_link(a)));

        assert!(s.update(b).expect("update"));
        let a_rid = s.object(a).expect("a").rid().expect("a stored");
        let b_rid = s.object(b).expect("b").rid().expect("b stored");
        let b_raw = store.load(b_rid).expect("load").expect("b");
        assert_eq!(b_raw.get("next"), Some(&Value::stored_link(a_rid)));
        assert_eq!(s.object(a).expect("a").state(), LifecycleState::Clean);
        assert_eq!(s.object(b).expect("b").state(), LifecycleState::Clean);
    }

    #[test]
    fn container_change_is_written_by_update() {
        let (mut s, store) = session();
        let a = node(&mut s, "a");
        let rid = s.insert(a).expect("insert");
        s.with_container(a, "tags", |c| c.push(Value::text("red")))
            .expect("push");
        assert_eq!(s.object(a).expect("a").state(), LifecycleState::Dirty);
        assert!(s.update(a).expect("update"));
        let raw = store.load(rid).expect("load").expect("a");
        assert_eq!(raw.get("tags"), Some(&Value::List(vec![Value::text("red")])));
        assert_eq!(s.object(a).expect("a").state(), LifecycleState::Clean);
    }
}
