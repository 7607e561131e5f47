//! # Metadata
//!
//! Static class and field descriptors.
//!
//! Descriptors are loaded by the surrounding runtime and handed to the core
//! read-only; one `ClassDescriptor` is shared (through `Arc`) by every
//! managed object of that class.

use crate::primitives::{MAX_FIELDS, MAX_HIERARCHY_DEPTH};
use crate::{FieldMask, TesseraError};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// FIELD DESCRIPTORS
// =============================================================================

/// Kind of the elements held by a container field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// Plain values, never tracked.
    Scalar,
    /// Persistable objects of the named class (or a subclass).
    Persistable(String),
}

impl ElementKind {
    /// Target class if the elements are persistable.
    #[must_use]
    pub fn persistable_class(&self) -> Option<&str> {
        match self {
            Self::Scalar => None,
            Self::Persistable(class) => Some(class),
        }
    }
}

/// Shape of a field's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldShape {
    /// Plain value.
    Scalar,
    /// Single reference to a persistable object.
    Reference {
        /// Declared class of the referenced object.
        target: String,
    },
    /// Growable collection.
    Collection {
        /// Element kind.
        element: ElementKind,
    },
    /// Keyed map.
    Map {
        /// Key kind.
        key: ElementKind,
        /// Value kind.
        value: ElementKind,
    },
    /// Fixed-length array.
    Array {
        /// Element kind.
        element: ElementKind,
    },
}

impl FieldShape {
    /// Whether values of this shape are wrapped in change-tracking containers.
    #[must_use]
    pub const fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Collection { .. } | Self::Map { .. } | Self::Array { .. }
        )
    }

    /// Whether values of this shape may reference persistable objects.
    #[must_use]
    pub fn references_persistables(&self) -> bool {
        match self {
            Self::Scalar => false,
            Self::Reference { .. } => true,
            Self::Collection { element } | Self::Array { element } => {
                element.persistable_class().is_some()
            }
            Self::Map { key, value } => {
                key.persistable_class().is_some() || value.persistable_class().is_some()
            }
        }
    }
}

/// Descriptor of one field of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name, also the key in stored records.
    pub name: String,
    /// Value shape.
    pub shape: FieldShape,
    /// Referenced persistables are deleted together with the owner.
    pub dependent: bool,
}

impl FieldDescriptor {
    /// A plain value field.
    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::with_shape(name, FieldShape::Scalar)
    }

    /// A single-reference field.
    #[must_use]
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_shape(
            name,
            FieldShape::Reference {
                target: target.into(),
            },
        )
    }

    /// A collection field.
    #[must_use]
    pub fn collection(name: impl Into<String>, element: ElementKind) -> Self {
        Self::with_shape(name, FieldShape::Collection { element })
    }

    /// A map field.
    #[must_use]
    pub fn map(name: impl Into<String>, key: ElementKind, value: ElementKind) -> Self {
        Self::with_shape(name, FieldShape::Map { key, value })
    }

    /// An array field.
    #[must_use]
    pub fn array(name: impl Into<String>, element: ElementKind) -> Self {
        Self::with_shape(name, FieldShape::Array { element })
    }

    /// A field with an explicit shape.
    #[must_use]
    pub fn with_shape(name: impl Into<String>, shape: FieldShape) -> Self {
        Self {
            name: name.into(),
            shape,
            dependent: false,
        }
    }

    /// Mark referenced objects as dependent (cascade-delete).
    #[must_use]
    pub fn dependent(mut self) -> Self {
        self.dependent = true;
        self
    }
}

// =============================================================================
// CLASS DESCRIPTORS
// =============================================================================

/// How the identity of a class's objects is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// Store-assigned record coordinates.
    Datastore,
    /// Values of the listed key fields.
    Application {
        /// Key field names in declaration order.
        key_fields: Vec<String>,
    },
}

/// Descriptor of a persistable class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    /// Fully qualified class name.
    pub name: String,
    /// Direct superclass, if any.
    pub superclass: Option<String>,
    /// Identity strategy.
    pub identity: IdentityStrategy,
    /// Whether writes are version-checked and versions are tracked.
    pub versioned: bool,
    /// Fields in absolute position order.
    pub fields: Vec<FieldDescriptor>,
}

impl ClassDescriptor {
    /// A datastore-identity, unversioned class with no fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            identity: IdentityStrategy::Datastore,
            versioned: false,
            fields: Vec::new(),
        }
    }

    /// Use application identity over the given key fields.
    #[must_use]
    pub fn application_identity<S: Into<String>>(
        mut self,
        key_fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.identity = IdentityStrategy::Application {
            key_fields: key_fields.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Enable version tracking.
    #[must_use]
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    /// Declare the direct superclass.
    #[must_use]
    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    /// Append a field.
    #[must_use]
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Name of the class in the store: the last dotted segment.
    #[must_use]
    pub fn store_name(&self) -> &str {
        simple_name(&self.name)
    }

    /// Position of a field by name.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Position of a field by name, or `UnknownField`.
    pub fn require_field(&self, name: &str) -> Result<usize, TesseraError> {
        self.field_index(name)
            .ok_or_else(|| TesseraError::UnknownField {
                class: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Field at a position.
    #[must_use]
    pub fn field_at(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// Mask of every field.
    #[must_use]
    pub fn all_fields(&self) -> FieldMask {
        FieldMask::all(self.fields.len())
    }

    /// Mask of the named fields.
    pub fn mask_of<S: AsRef<str>>(&self, names: &[S]) -> Result<FieldMask, TesseraError> {
        let mut mask = FieldMask::empty();
        for name in names {
            mask.insert(self.require_field(name.as_ref())?);
        }
        Ok(mask)
    }

    /// Key field names for application identity, empty otherwise.
    #[must_use]
    pub fn key_fields(&self) -> &[String] {
        match &self.identity {
            IdentityStrategy::Datastore => &[],
            IdentityStrategy::Application { key_fields } => key_fields,
        }
    }
}

/// Last dotted segment of a class name.
#[must_use]
pub fn simple_name(class: &str) -> &str {
    class.rsplit('.').next().unwrap_or(class)
}

// =============================================================================
// METADATA REGISTRY
// =============================================================================

/// Read-only lookup of class descriptors.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    classes: BTreeMap<String, Arc<ClassDescriptor>>,
}

impl MetadataRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class descriptor.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::InvalidConfig` if:
    /// - The class declares more than `MAX_FIELDS` fields
    /// - Two fields share a name
    /// - An application key field is not a declared field
    pub fn register(&mut self, class: ClassDescriptor) -> Result<Arc<ClassDescriptor>, TesseraError> {
        if class.fields.len() > MAX_FIELDS {
            return Err(TesseraError::InvalidConfig(format!(
                "class {} declares {} fields, at most {} are supported",
                class.name,
                class.fields.len(),
                MAX_FIELDS
            )));
        }
        for (i, field) in class.fields.iter().enumerate() {
            if class.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(TesseraError::InvalidConfig(format!(
                    "class {} declares field {} twice",
                    class.name, field.name
                )));
            }
        }
        for key in class.key_fields() {
            if class.field_index(key).is_none() {
                return Err(TesseraError::InvalidConfig(format!(
                    "class {} uses undeclared key field {}",
                    class.name, key
                )));
            }
        }

        let class = Arc::new(class);
        self.classes.insert(class.name.clone(), Arc::clone(&class));
        Ok(class)
    }

    /// Builder-style registration.
    pub fn with(mut self, class: ClassDescriptor) -> Result<Self, TesseraError> {
        self.register(class)?;
        Ok(self)
    }

    /// Get a descriptor by fully qualified name.
    pub fn get(&self, class: &str) -> Result<Arc<ClassDescriptor>, TesseraError> {
        self.classes
            .get(class)
            .cloned()
            .ok_or_else(|| TesseraError::UnknownClass(class.to_string()))
    }

    /// Check if a class is registered.
    #[must_use]
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// All registered classes in name order.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDescriptor>> {
        self.classes.values()
    }

    /// Whether `sub` is `sup` or one of its descendants.
    #[must_use]
    pub fn is_assignable(&self, sub: &str, sup: &str) -> bool {
        let mut current = sub.to_string();
        for _ in 0..MAX_HIERARCHY_DEPTH {
            if current == sup {
                return true;
            }
            match self.classes.get(&current).and_then(|c| c.superclass.clone()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Topmost registered ancestor of a class.
    pub fn root_of(&self, class: &str) -> Result<Arc<ClassDescriptor>, TesseraError> {
        let mut current = self.get(class)?;
        for _ in 0..MAX_HIERARCHY_DEPTH {
            match current.superclass.as_deref().map(|s| self.get(s)) {
                Some(Ok(parent)) => current = parent,
                // An unregistered superclass ends the chain.
                Some(Err(_)) | None => return Ok(current),
            }
        }
        Err(TesseraError::InvalidConfig(format!(
            "class hierarchy of {} is deeper than {} levels",
            class, MAX_HIERARCHY_DEPTH
        )))
    }

    /// The class and all its registered descendants, class first then by name.
    #[must_use]
    pub fn with_subclasses(&self, class: &str) -> Vec<Arc<ClassDescriptor>> {
        let mut out: Vec<_> = self.classes.get(class).cloned().into_iter().collect();
        out.extend(
            self.classes
                .values()
                .filter(|c| c.name != class && self.is_assignable(&c.name, class))
                .cloned(),
        );
        out
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                ClassDescriptor::new("shop.Party")
                    .application_identity(["code"])
                    .field(FieldDescriptor::scalar("code")),
            )
            .and_then(|r| {
                r.with(
                    ClassDescriptor::new("shop.Customer")
                        .extends("shop.Party")
                        .application_identity(["code"])
                        .field(FieldDescriptor::scalar("code"))
                        .field(FieldDescriptor::collection(
                            "orders",
                            ElementKind::Persistable("shop.Order".into()),
                        )),
                )
            })
            .and_then(|r| r.with(ClassDescriptor::new("shop.Order")))
            .expect("registry")
    }

    #[test]
    fn store_name_is_last_segment() {
        assert_eq!(ClassDescriptor::new("a.b.Person").store_name(), "Person");
        assert_eq!(ClassDescriptor::new("Person").store_name(), "Person");
    }

    #[test]
    fn assignability_walks_superclasses() {
        let reg = registry();
        assert!(reg.is_assignable("shop.Customer", "shop.Party"));
        assert!(reg.is_assignable("shop.Party", "shop.Party"));
        assert!(!reg.is_assignable("shop.Party", "shop.Customer"));
        assert!(!reg.is_assignable("shop.Order", "shop.Party"));
    }

    #[test]
    fn root_and_subclasses() {
        let reg = registry();
        assert_eq!(reg.root_of("shop.Customer").expect("root").name, "shop.Party");
        let names: Vec<_> = reg
            .with_subclasses("shop.Party")
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, vec!["shop.Party", "shop.Customer"]);
    }

    #[test]
    fn register_rejects_undeclared_key() {
        let result = MetadataRegistry::new()
            .register(ClassDescriptor::new("X").application_identity(["missing"]));
        assert!(matches!(result, Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn register_rejects_duplicate_field() {
        let result = MetadataRegistry::new().register(
            ClassDescriptor::new("X")
                .field(FieldDescriptor::scalar("a"))
                .field(FieldDescriptor::scalar("a")),
        );
        assert!(matches!(result, Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn container_shapes() {
        let coll = FieldDescriptor::collection("c", ElementKind::Scalar);
        assert!(coll.shape.is_container());
        assert!(!coll.shape.references_persistables());
        let map = FieldDescriptor::map(
            "m",
            ElementKind::Scalar,
            ElementKind::Persistable("X".into()),
        );
        assert!(map.shape.references_persistables());
        assert!(!FieldShape::Scalar.is_container());
    }

    #[test]
    fn mask_of_unknown_field_fails() {
        let reg = registry();
        let customer = reg.get("shop.Customer").expect("class");
        assert_eq!(
            customer.mask_of(&["orders"]).expect("mask"),
            FieldMask::single(1)
        );
        assert!(matches!(
            customer.mask_of(&["nope"]),
            Err(TesseraError::UnknownField { .. })
        ));
    }
}
