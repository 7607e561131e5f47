//! # Identity Resolver
//!
//! Session-scoped registry of managed objects.
//!
//! Objects live in an arena indexed by `ObjectHandle`; identities and record
//! ids index into it. A second sighting of the same store record resolves to
//! the existing entry, so reference cycles reduce to a membership check and
//! two handles for one logical record never exist.
//!
//! The registry never touches the store.

use crate::metadata::{ClassDescriptor, IdentityStrategy, MetadataRegistry};
use crate::tracked::{ContainerKind, TrackedContainer};
use crate::{
    FieldMask, Identity, LifecycleState, ObjectHandle, Record, RecordId, StoredRecord,
    TesseraError, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// FIELD ACCESS
// =============================================================================

/// Positional access to the fields of a managed object.
pub trait FieldAccessor {
    /// Current value of the field at `index`.
    fn read_field(&self, index: usize) -> Result<Value, TesseraError>;

    /// Replace the field at `index`, marking it dirty.
    fn write_field(&mut self, index: usize, value: Value) -> Result<(), TesseraError>;

    /// Positions of fields modified since the last flush.
    fn dirty_field_indices(&self) -> Vec<usize>;
}

// =============================================================================
// MANAGED OBJECT
// =============================================================================

/// A domain record plus the tracking metadata attached to it.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    handle: ObjectHandle,
    class: Arc<ClassDescriptor>,
    identity: Option<Identity>,
    rid: Option<RecordId>,
    state: LifecycleState,
    version: Option<u64>,
    loaded: FieldMask,
    dirty: FieldMask,
    value: Record,
    containers: BTreeMap<usize, TrackedContainer>,
}

impl ManagedObject {
    fn new(handle: ObjectHandle, class: Arc<ClassDescriptor>, value: Record) -> Self {
        Self {
            handle,
            class,
            identity: None,
            rid: None,
            state: LifecycleState::Transient,
            version: None,
            loaded: FieldMask::empty(),
            dirty: FieldMask::empty(),
            value,
            containers: BTreeMap::new(),
        }
    }

    /// Registry handle.
    #[must_use]
    pub const fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Descriptor of the object's actual class.
    #[must_use]
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    /// Identity, once known.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Store coordinates, once stored.
    #[must_use]
    pub const fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Version last seen in the store.
    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    /// Fields known to be in sync with the store.
    #[must_use]
    pub const fn loaded_fields(&self) -> FieldMask {
        self.loaded
    }

    /// Fields modified since the last flush, including mutated containers.
    #[must_use]
    pub fn dirty_fields(&self) -> FieldMask {
        self.containers
            .iter()
            .filter(|(_, c)| c.is_modified())
            .fold(self.dirty, |mask, (&i, _)| mask.with(i))
    }

    /// Check if the container field at `index` is wrapped.
    #[must_use]
    pub fn is_wrapped(&self, index: usize) -> bool {
        self.containers.contains_key(&index)
    }

    /// Number of wrapped container fields.
    #[must_use]
    pub fn wrapped_count(&self) -> usize {
        self.containers.len()
    }

    /// The domain record with tracked container contents folded in.
    #[must_use]
    pub fn current_record(&self) -> Record {
        let mut record = self.value.clone();
        for (&index, container) in &self.containers {
            if let Some(field) = self.class.field_at(index) {
                record.set(field.name.clone(), container.value().clone());
            }
        }
        record
    }

    /// Mutable access to a wrapped container field.
    pub fn container_mut(&mut self, index: usize) -> Result<&mut TrackedContainer, TesseraError> {
        self.ensure_live()?;
        let class = &self.class;
        self.containers
            .get_mut(&index)
            .ok_or_else(|| TesseraError::Unsupported(format!(
                "field {} of {} is not a tracked container",
                index, class.name
            )))
    }

    /// Wrap the container field at `index` unless already wrapped.
    ///
    /// Returns whether a new wrapper was created.
    pub(crate) fn wrap_container(&mut self, index: usize) -> Result<bool, TesseraError> {
        if self.containers.contains_key(&index) {
            return Ok(false);
        }
        let field = self.field(index)?;
        let Some(kind) = ContainerKind::of(&field.shape) else {
            return Ok(false);
        };
        let name = field.name.clone();
        let current = self.value.get(&name).cloned().unwrap_or_default();
        let container = TrackedContainer::wrap(kind, current)?;
        self.containers.insert(index, container);
        Ok(true)
    }

    /// Wrap every container field.
    pub(crate) fn wrap_all_containers(&mut self) -> Result<usize, TesseraError> {
        let mut wrapped = 0;
        for index in 0..self.class.fields.len() {
            if self.wrap_container(index)? {
                wrapped += 1;
            }
        }
        Ok(wrapped)
    }

    /// Move a stored object to `Dirty` once the container at `index` has recorded a change.
    pub(crate) fn note_container_change(&mut self, index: usize) {
        let modified = self.containers.get(&index).is_some_and(TrackedContainer::is_modified);
        if modified && matches!(self.state, LifecycleState::Hollow | LifecycleState::Clean) {
            self.state = LifecycleState::Dirty;
        }
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn set_version(&mut self, version: Option<u64>) {
        self.version = version;
    }

    pub(crate) fn mark_loaded(&mut self, mask: FieldMask) {
        self.loaded = self.loaded.union(mask);
    }

    pub(crate) fn mark_unloaded(&mut self, index: usize) {
        self.loaded.remove(index);
    }

    /// Forget dirty state after a successful write.
    pub(crate) fn mark_flushed(&mut self) {
        self.dirty = FieldMask::empty();
        for container in self.containers.values_mut() {
            container.mark_flushed();
        }
    }

    /// Replace non-dirty field values with a fresh store copy.
    pub(crate) fn refresh_from(&mut self, raw: &StoredRecord) {
        let dirty = self.dirty_fields();
        for (index, field) in self.class.fields.iter().enumerate() {
            if dirty.contains(index) {
                continue;
            }
            let fresh = raw.get(&field.name).cloned().unwrap_or_default();
            self.containers.remove(&index);
            self.value.set(field.name.clone(), fresh);
        }
        self.version = Some(raw.version);
    }

    fn field(&self, index: usize) -> Result<&crate::metadata::FieldDescriptor, TesseraError> {
        self.class
            .field_at(index)
            .ok_or_else(|| TesseraError::UnknownField {
                class: self.class.name.clone(),
                field: index.to_string(),
            })
    }

    fn ensure_live(&self) -> Result<(), TesseraError> {
        if self.state == LifecycleState::Deleted {
            return Err(TesseraError::ObjectDeleted(self.handle));
        }
        Ok(())
    }
}

impl FieldAccessor for ManagedObject {
    fn read_field(&self, index: usize) -> Result<Value, TesseraError> {
        self.ensure_live()?;
        let field = self.field(index)?;
        if let Some(container) = self.containers.get(&index) {
            return Ok(container.value().clone());
        }
        Ok(self.value.get(&field.name).cloned().unwrap_or_default())
    }

    fn write_field(&mut self, index: usize, value: Value) -> Result<(), TesseraError> {
        self.ensure_live()?;
        let name = self.field(index)?.name.clone();
        self.containers.remove(&index);
        self.value.set(name, value);
        self.dirty.insert(index);
        self.loaded.insert(index);
        if matches!(self.state, LifecycleState::Hollow | LifecycleState::Clean) {
            self.state = LifecycleState::Dirty;
        }
        Ok(())
    }

    fn dirty_field_indices(&self) -> Vec<usize> {
        self.dirty_fields().iter().collect()
    }
}

// =============================================================================
// IDENTITY RESOLVER
// =============================================================================

/// Session registry mapping identities to managed objects.
#[derive(Debug)]
pub struct IdentityResolver {
    metadata: Arc<MetadataRegistry>,
    objects: Vec<ManagedObject>,
    by_identity: BTreeMap<Identity, ObjectHandle>,
    by_rid: BTreeMap<RecordId, ObjectHandle>,
}

impl IdentityResolver {
    /// Create an empty registry.
    #[must_use]
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self {
            metadata,
            objects: Vec::new(),
            by_identity: BTreeMap::new(),
            by_rid: BTreeMap::new(),
        }
    }

    /// Metadata the registry resolves against.
    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    /// Resolve a raw store row as an instance of `declared`.
    ///
    /// An existing entry with the same identity is returned unchanged, after a
    /// type check; its in-memory values are never overwritten. Otherwise a new
    /// `Hollow` entry is registered holding the row's values.
    ///
    /// # Errors
    ///
    /// - `IdentityDerivation` if the row carries no usable key
    /// - `TypeConflict` if the entry (or row) class is not assignable to `declared`
    /// - `UnknownClass` if either class is not in the metadata
    pub fn resolve(
        &mut self,
        raw: &StoredRecord,
        declared: &str,
    ) -> Result<ObjectHandle, TesseraError> {
        self.metadata.get(declared)?;
        let class = self.metadata.get(&raw.class)?;
        let identity = self.derive_identity(&class, raw)?;

        if let Some(&handle) = self.by_identity.get(&identity) {
            let registered = &self.objects[handle.index()].class.name;
            if !self.metadata.is_assignable(registered, declared) {
                return Err(TesseraError::TypeConflict {
                    identity,
                    registered: registered.clone(),
                    requested: declared.to_string(),
                });
            }
            return Ok(handle);
        }

        if !self.metadata.is_assignable(&class.name, declared) {
            return Err(TesseraError::TypeConflict {
                identity,
                registered: class.name.clone(),
                requested: declared.to_string(),
            });
        }

        let handle = self.next_handle()?;
        let mut object = ManagedObject::new(handle, class, raw.to_record());
        object.identity = Some(identity.clone());
        object.rid = Some(raw.rid);
        object.version = Some(raw.version);
        object.state = LifecycleState::Hollow;
        self.objects.push(object);
        self.by_identity.insert(identity, handle);
        self.by_rid.insert(raw.rid, handle);
        tracing::debug!(%handle, rid = %raw.rid, class = %raw.class, "resolved hollow object");
        Ok(handle)
    }

    /// Derive the identity of a row of `class`.
    pub fn derive_identity(
        &self,
        class: &ClassDescriptor,
        raw: &StoredRecord,
    ) -> Result<Identity, TesseraError> {
        match &class.identity {
            IdentityStrategy::Datastore => {
                if raw.rid.is_persistent() {
                    Ok(Identity::Datastore(raw.rid))
                } else {
                    Err(TesseraError::IdentityDerivation(format!(
                        "record of {} has no assigned record id",
                        class.name
                    )))
                }
            }
            IdentityStrategy::Application { .. } => {
                self.application_identity(class, &raw.to_record())
            }
        }
    }

    /// Identity from the key fields of a domain record.
    ///
    /// The identity is keyed by the root class so subclasses share a key space.
    pub fn application_identity(
        &self,
        class: &ClassDescriptor,
        record: &Record,
    ) -> Result<Identity, TesseraError> {
        let root = self.metadata.root_of(&class.name)?;
        let mut key = Vec::with_capacity(class.key_fields().len());
        for field in class.key_fields() {
            match record.get(field) {
                Some(value) if !value.is_null() => key.push(value.clone()),
                _ => {
                    return Err(TesseraError::IdentityDerivation(format!(
                        "key field {} of {} is not set",
                        field, class.name
                    )));
                }
            }
        }
        Ok(Identity::Application {
            class: root.name.clone(),
            key,
        })
    }

    /// Register a new, not store-backed object.
    pub fn register_transient(&mut self, record: Record) -> Result<ObjectHandle, TesseraError> {
        let class = self.metadata.get(&record.class)?;
        let handle = self.next_handle()?;
        let mut object = ManagedObject::new(handle, Arc::clone(&class), record);
        object.loaded = class.all_fields();
        self.objects.push(object);
        Ok(handle)
    }

    /// Index an object under its store identity after a successful insert.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::DuplicateIdentity` if another object holds `identity`.
    pub fn attach_identity(
        &mut self,
        handle: ObjectHandle,
        identity: Identity,
        rid: RecordId,
        version: u64,
    ) -> Result<(), TesseraError> {
        if let Some(&other) = self.by_identity.get(&identity) {
            if other != handle {
                return Err(TesseraError::DuplicateIdentity(identity));
            }
        }
        let object = self.get_mut(handle)?;
        object.identity = Some(identity.clone());
        object.rid = Some(rid);
        object.version = Some(version);
        self.by_identity.insert(identity, handle);
        self.by_rid.insert(rid, handle);
        Ok(())
    }

    /// Remove an identity from the registry. The arena slot stays valid.
    pub fn detach(&mut self, identity: &Identity) -> Option<ObjectHandle> {
        let handle = self.by_identity.remove(identity)?;
        if let Some(rid) = self.objects.get(handle.index()).and_then(ManagedObject::rid) {
            self.by_rid.remove(&rid);
        }
        Some(handle)
    }

    /// Handle registered under an identity.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<ObjectHandle> {
        self.by_identity.get(identity).copied()
    }

    /// Handle registered under a record id.
    #[must_use]
    pub fn lookup_rid(&self, rid: RecordId) -> Option<ObjectHandle> {
        self.by_rid.get(&rid).copied()
    }

    /// Object behind a handle.
    pub fn get(&self, handle: ObjectHandle) -> Result<&ManagedObject, TesseraError> {
        self.objects
            .get(handle.index())
            .ok_or_else(|| TesseraError::ObjectNotFound(handle.to_string()))
    }

    /// Mutable object behind a handle.
    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut ManagedObject, TesseraError> {
        self.objects
            .get_mut(handle.index())
            .ok_or_else(|| TesseraError::ObjectNotFound(handle.to_string()))
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    /// Check if no identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Every handle ever issued, in issue order.
    pub fn handles(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.objects.iter().map(ManagedObject::handle)
    }

    fn next_handle(&self) -> Result<ObjectHandle, TesseraError> {
        u32::try_from(self.objects.len())
            .map(ObjectHandle)
            .map_err(|_| TesseraError::Unsupported("session registry is full".to_string()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
