//! # Graph Activator
//!
//! Loads the requested fields of a managed object and resolves the persistable
//! objects those fields reach.
//!
//! ## Rules
//!
//! - Scalars pass through untouched
//! - Each referenced record not yet in the registry is loaded once and resolved
//!   to `Hollow`; its own fields are not activated (one level per call)
//! - A reference to a record that no longer exists marks the owning field as
//!   unloaded instead of failing
//! - Container fields are wrapped in a change-tracking container, once
//! - References already in the registry are skipped, which is what keeps
//!   cyclic graphs finite
//!
//! Activating the same mask twice resolves nothing new, wraps nothing new and
//! leaves the loaded mask as it was.

use crate::identity::{FieldAccessor, IdentityResolver};
use crate::metadata::{ElementKind, FieldShape};
use crate::store::{Store, StoreClient};
use crate::{FieldMask, LifecycleState, Link, ObjectHandle, RecordId, TesseraError, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// FIELD VALUE VIEW
// =============================================================================

/// A field value seen through its declared shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Plain value.
    Scalar(&'a Value),
    /// Single reference; `None` when unset.
    SingleRef(Option<&'a Link>),
    /// Collection elements.
    Collection(&'a [Value]),
    /// Map entries.
    Map(&'a BTreeMap<Value, Value>),
    /// Array elements.
    Array(&'a [Value]),
    /// Value does not match the declared shape.
    Mismatch(&'a Value),
}

impl<'a> FieldValue<'a> {
    /// View `value` through `shape`.
    #[must_use]
    pub fn view(shape: &FieldShape, value: &'a Value) -> Self {
        match (shape, value) {
            (FieldShape::Scalar, v) => Self::Scalar(v),
            (FieldShape::Reference { .. }, Value::Null) => Self::SingleRef(None),
            (FieldShape::Reference { .. }, Value::Link(link)) => Self::SingleRef(Some(link)),
            (FieldShape::Collection { .. }, Value::List(items)) => Self::Collection(items),
            (FieldShape::Collection { .. } | FieldShape::Array { .. }, Value::Null) => {
                Self::Collection(&[])
            }
            (FieldShape::Array { .. }, Value::List(items)) => Self::Array(items),
            (FieldShape::Map { .. }, Value::Map(entries)) => Self::Map(entries),
            (_, v) => Self::Mismatch(v),
        }
    }
}

/// Stored record ids reachable from one field, with the class each is declared as.
pub(crate) fn referenced_records(shape: &FieldShape, value: &Value) -> Vec<(RecordId, String)> {
    fn stored(value: &Value) -> Option<RecordId> {
        match value {
            Value::Link(Link::Stored(rid)) => Some(*rid),
            _ => None,
        }
    }
    fn collect(items: &[&Value], kind: &ElementKind, out: &mut Vec<(RecordId, String)>) {
        if let Some(class) = kind.persistable_class() {
            out.extend(items.iter().filter_map(|v| stored(v)).map(|rid| (rid, class.to_string())));
        }
    }

    let mut out = Vec::new();
    match (shape, FieldValue::view(shape, value)) {
        (FieldShape::Reference { target }, FieldValue::SingleRef(Some(Link::Stored(rid)))) => {
            out.push((*rid, target.clone()));
        }
        (
            FieldShape::Collection { element } | FieldShape::Array { element },
            FieldValue::Collection(items) | FieldValue::Array(items),
        ) => {
            let items: Vec<&Value> = items.iter().collect();
            collect(&items, element, &mut out);
        }
        (FieldShape::Map { key, value }, FieldValue::Map(entries)) => {
            let keys: Vec<&Value> = entries.keys().collect();
            let values: Vec<&Value> = entries.values().collect();
            collect(&keys, key, &mut out);
            collect(&values, value, &mut out);
        }
        _ => {}
    }
    out
}

// =============================================================================
// ACTIVATOR
// =============================================================================

/// What one activation call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Objects newly registered, in discovery order.
    pub resolved: Vec<ObjectHandle>,
    /// Fields left unloaded because a referenced record is gone.
    pub unloaded: FieldMask,
    /// Container fields wrapped by this call.
    pub wrapped: usize,
}

/// Activates fields of managed objects against one store.
pub struct GraphActivator<'a> {
    resolver: &'a mut IdentityResolver,
    store: &'a dyn Store,
}

impl<'a> GraphActivator<'a> {
    /// Create an activator over a session registry and a store.
    pub fn new(resolver: &'a mut IdentityResolver, store: &'a dyn Store) -> Self {
        Self { resolver, store }
    }

    /// Activate the fields in `mask` of the object behind `handle`.
    ///
    /// # Errors
    ///
    /// - `ObjectDeleted` if the object has been deleted
    /// - `UnknownField` if `mask` names a position the class does not declare
    /// - `TypeConflict` if a referenced record is registered as an incompatible class
    /// - `Connectivity` for store failures
    pub fn activate(
        &mut self,
        handle: ObjectHandle,
        mask: FieldMask,
    ) -> Result<ActivationReport, TesseraError> {
        let object = self.resolver.get(handle)?;
        if object.state() == LifecycleState::Deleted {
            return Err(TesseraError::ObjectDeleted(handle));
        }
        let class = Arc::clone(object.class());

        let mut report = ActivationReport::default();
        let mut populated = FieldMask::empty();

        for index in mask.iter() {
            let field = class
                .field_at(index)
                .ok_or_else(|| TesseraError::UnknownField {
                    class: class.name.clone(),
                    field: index.to_string(),
                })?;
            let value = self.resolver.get(handle)?.read_field(index)?;

            let mut missing = false;
            for (rid, declared) in referenced_records(&field.shape, &value) {
                if self.resolver.lookup_rid(rid).is_some() {
                    continue;
                }
                match self.store.load(rid)? {
                    Some(raw) => {
                        // A second row can carry an identity that is already registered.
                        let known = self.resolver.len();
                        let resolved = self.resolver.resolve(&raw, &declared)?;
                        if self.resolver.len() > known {
                            report.resolved.push(resolved);
                        }
                    }
                    None => {
                        tracing::debug!(%handle, field = %field.name, %rid, "referenced record is gone");
                        missing = true;
                    }
                }
            }

            let object = self.resolver.get_mut(handle)?;
            if missing {
                object.mark_unloaded(index);
                report.unloaded.insert(index);
                continue;
            }
            if field.shape.is_container() && object.wrap_container(index)? {
                report.wrapped += 1;
            }
            populated.insert(index);
        }

        let object = self.resolver.get_mut(handle)?;
        object.mark_loaded(populated);
        if object.state() == LifecycleState::Hollow && object.loaded_fields().is_superset(mask) {
            object.set_state(LifecycleState::Clean);
        }
        tracing::debug!(
            %handle,
            resolved = report.resolved.len(),
            wrapped = report.wrapped,
            "activated fields"
        );
        Ok(report)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoredRecord;
    use crate::metadata::{ClassDescriptor, FieldDescriptor, MetadataRegistry};
    use crate::storage::MemoryStore;
    use crate::store::SchemaRegistry;

    struct Fixture {
        store: MemoryStore,
        resolver: IdentityResolver,
        node: Arc<ClassDescriptor>,
        cluster: u16,
    }

    fn fixture() -> Fixture {
        let mut meta = MetadataRegistry::new();
        let node = meta
            .register(
                ClassDescriptor::new("g.Node")
                    .field(FieldDescriptor::scalar("label"))
                    .field(FieldDescriptor::reference("next", "g.Node"))
                    .field(FieldDescriptor::collection(
                        "peers",
                        ElementKind::Persistable("g.Node".into()),
                    ))
                    .field(FieldDescriptor::map(
                        "tags",
                        ElementKind::Scalar,
                        ElementKind::Scalar,
                    )),
            )
            .expect("register");
        let store = MemoryStore::new();
        let cluster = store.ensure_type_registered(&node).expect("cluster");
        Fixture {
            store,
            resolver: IdentityResolver::new(Arc::new(meta)),
            node,
            cluster,
        }
    }

    fn insert(store: &MemoryStore, cluster: u16, label: &str) -> RecordId {
        store
            .save(
                &StoredRecord {
                    rid: RecordId::unassigned(cluster),
                    version: 0,
                    class: "g.Node".into(),
                    fields: [("label".to_string(), Value::text(label))].into(),
                },
                None,
            )
            .expect("save")
            .rid
    }

    fn link(store: &MemoryStore, from: RecordId, field: &str, value: Value) {
        let mut rec = store.load(from).expect("load").expect("present");
        rec.fields.insert(field.to_string(), value);
        store.save(&rec, None).expect("save");
    }

    #[test]
    fn cycle_resolves_each_object_once() {
        let mut fx = fixture();
        let a = insert(&fx.store, fx.cluster, "A");
        let b = insert(&fx.store, fx.cluster, "B");
        link(&fx.store, a, "next", Value::stored_link(b));
        link(&fx.store, b, "next", Value::stored_link(a));

        let raw_a = fx.store.load(a).expect("load").expect("present");
        let ha = fx.resolver.resolve(&raw_a, "g.Node").expect("resolve");
        let mask = fx.node.all_fields();

        let report = GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(ha, mask)
            .expect("activate a");
        assert_eq!(report.resolved.len(), 1);
        let hb = report.resolved[0];

        let report = GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(hb, mask)
            .expect("activate b");
        assert!(report.resolved.is_empty());
        assert_eq!(fx.resolver.len(), 2);
        assert_eq!(fx.resolver.lookup_rid(a), Some(ha));
    }

    #[test]
    fn activation_is_idempotent() {
        let mut fx = fixture();
        let a = insert(&fx.store, fx.cluster, "A");
        let b = insert(&fx.store, fx.cluster, "B");
        link(&fx.store, a, "peers", Value::List(vec![Value::stored_link(b), Value::stored_link(b)]));

        let raw = fx.store.load(a).expect("load").expect("present");
        let h = fx.resolver.resolve(&raw, "g.Node").expect("resolve");
        let mask = fx.node.all_fields();

        let first = GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(h, mask)
            .expect("activate");
        assert_eq!(first.resolved.len(), 1);
        assert_eq!(first.wrapped, 2);
        let loaded = fx.resolver.get(h).expect("object").loaded_fields();

        let second = GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(h, mask)
            .expect("activate");
        assert!(second.resolved.is_empty());
        assert_eq!(second.wrapped, 0);
        assert_eq!(fx.resolver.get(h).expect("object").loaded_fields(), loaded);
        assert_eq!(fx.resolver.len(), 2);
        assert_eq!(fx.resolver.get(h).expect("object").state(), LifecycleState::Clean);
    }

    #[test]
    fn missing_reference_marks_field_unloaded() {
        let mut fx = fixture();
        let a = insert(&fx.store, fx.cluster, "A");
        link(&fx.store, a, "next", Value::stored_link(RecordId::new(fx.cluster, 404)));

        let raw = fx.store.load(a).expect("load").expect("present");
        let h = fx.resolver.resolve(&raw, "g.Node").expect("resolve");
        let report = GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(h, fx.node.all_fields())
            .expect("activate");

        assert!(report.unloaded.contains(1));
        let obj = fx.resolver.get(h).expect("object");
        assert!(!obj.loaded_fields().contains(1));
        assert!(obj.loaded_fields().contains(0));
        assert_eq!(obj.state(), LifecycleState::Hollow);
    }

    #[test]
    fn requested_fields_complete_activation() {
        let mut fx = fixture();
        let a = insert(&fx.store, fx.cluster, "A");
        let raw = fx.store.load(a).expect("load").expect("present");
        let h = fx.resolver.resolve(&raw, "g.Node").expect("resolve");

        GraphActivator::new(&mut fx.resolver, &fx.store)
            .activate(h, FieldMask::single(0))
            .expect("activate");
        let obj = fx.resolver.get(h).expect("object");
        assert_eq!(obj.state(), LifecycleState::Clean);
        assert_eq!(obj.read_field(0).expect("read"), Value::text("A"));
    }

    #[test]
    fn unknown_position_is_rejected() {
        let mut fx = fixture();
        let a = insert(&fx.store, fx.cluster, "A");
        let raw = fx.store.load(a).expect("load").expect("present");
        let h = fx.resolver.resolve(&raw, "g.Node").expect("resolve");
        let result = GraphActivator::new(&mut fx.resolver, &fx.store).activate(h, FieldMask::single(9));
        assert!(matches!(result, Err(TesseraError::UnknownField { .. })));
    }

    #[test]
    fn view_classifies_shapes() {
        let list = Value::List(vec![Value::Int(1)]);
        let coll = FieldShape::Collection {
            element: ElementKind::Scalar,
        };
        assert!(matches!(FieldValue::view(&coll, &list), FieldValue::Collection(items) if items.len() == 1));
        assert!(matches!(
            FieldValue::view(&FieldShape::Reference { target: "X".into() }, &Value::Int(3)),
            FieldValue::Mismatch(_)
        ));
        assert!(matches!(
            FieldValue::view(&coll, &Value::Null),
            FieldValue::Collection(items) if items.is_empty()
        ));
    }

    #[test]
    fn rows_sharing_a_key_resolve_once() {
        let meta = MetadataRegistry::new()
            .with(
                ClassDescriptor::new("g.Tag")
                    .application_identity(["code"])
                    .field(FieldDescriptor::scalar("code")),
            )
            .and_then(|m| {
                m.with(ClassDescriptor::new("g.Post").field(FieldDescriptor::collection(
                    "tags",
                    ElementKind::Persistable("g.Tag".into()),
                )))
            })
            .expect("metadata");
        let store = MemoryStore::new();
        let tag = meta.get("g.Tag").expect("tag");
        let post = meta.get("g.Post").expect("post");
        let tag_cluster = store.ensure_type_registered(&tag).expect("cluster");
        let post_cluster = store.ensure_type_registered(&post).expect("cluster");
        let save = |cluster: u16, class: &str, field: &str, value: Value| {
            store
                .save(
                    &StoredRecord {
                        rid: RecordId::unassigned(cluster),
                        version: 0,
                        class: class.into(),
                        fields: [(field.to_string(), value)].into(),
                    },
                    None,
                )
                .expect("save")
                .rid
        };
        let first = save(tag_cluster, "g.Tag", "code", Value::text("rust"));
        let second = save(tag_cluster, "g.Tag", "code", Value::text("rust"));
        let p = save(
            post_cluster,
            "g.Post",
            "tags",
            Value::List(vec![Value::stored_link(first), Value::stored_link(second)]),
        );

        let mut resolver = IdentityResolver::new(Arc::new(meta));
        let raw = store.load(p).expect("load").expect("present");
        let h = resolver.resolve(&raw, "g.Post").expect("resolve");
        let report = GraphActivator::new(&mut resolver, &store)
            .activate(h, post.all_fields())
            .expect("activate");

        assert_eq!(report.resolved.len(), 1);
        assert_eq!(resolver.len(), 2);
        assert_eq!(resolver.lookup_rid(second), None);
        assert_eq!(resolver.lookup_rid(first), Some(report.resolved[0]));
    }
}
