//! # Core Type Definitions
//!
//! This module contains the value model shared by every other module:
//! - Store coordinates and session handles (`RecordId`, `ObjectHandle`, `Link`)
//! - The dynamic field value (`Value`) and the two record shapes
//!   (`Record` for domain values, `StoredRecord` for raw store rows)
//! - Identity and lifecycle tracking (`Identity`, `LifecycleState`, `FieldMask`)
//! - Error types (`TesseraError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use crate::primitives::MAX_FIELDS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// STORE COORDINATES & SESSION HANDLES
// =============================================================================

/// Store-native coordinates of a record: the cluster the record lives in and
/// its position inside that cluster.
///
/// A negative position means the record has not been written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Cluster (one per registered class).
    pub cluster: u16,
    /// Position inside the cluster.
    pub position: i64,
}

impl RecordId {
    /// Create a record id from explicit coordinates.
    #[must_use]
    pub const fn new(cluster: u16, position: i64) -> Self {
        Self { cluster, position }
    }

    /// A record id for a record that will be inserted into `cluster`.
    #[must_use]
    pub const fn unassigned(cluster: u16) -> Self {
        Self {
            cluster,
            position: -1,
        }
    }

    /// Whether the store has assigned a position to this record.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        self.position >= 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Index of a managed object inside a session's registry.
///
/// Handles are only meaningful within the session that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

impl ObjectHandle {
    /// Arena slot of this handle.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A reference from one object to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Link {
    /// Reference to a record already in the store.
    Stored(RecordId),
    /// Reference to an object of the current session that may not be stored
    /// yet. Never written to a store; converted to `Stored` on flush.
    Managed(ObjectHandle),
}

// =============================================================================
// VALUE
// =============================================================================

/// A field value as held by domain records and store rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Reference to another persistable object.
    Link(Link),
    /// Ordered container (collections and arrays).
    List(Vec<Value>),
    /// Keyed container.
    Map(BTreeMap<Value, Value>),
}

impl Value {
    /// Create a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a link to a stored record.
    #[must_use]
    pub const fn stored_link(rid: RecordId) -> Self {
        Self::Link(Link::Stored(rid))
    }

    /// Create a link to a managed object of the current session.
    #[must_use]
    pub const fn managed_link(handle: ObjectHandle) -> Self {
        Self::Link(Link::Managed(handle))
    }

    /// Check if the value is `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the integer payload, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the text payload, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the link payload, if any.
    #[must_use]
    pub const fn as_link(&self) -> Option<&Link> {
        match self {
            Self::Link(link) => Some(link),
            _ => None,
        }
    }

    /// Whether this value (or anything nested in it) refers to a session handle.
    #[must_use]
    pub fn contains_managed_link(&self) -> bool {
        match self {
            Self::Link(Link::Managed(_)) => true,
            Self::List(items) => items.iter().any(Self::contains_managed_link),
            Self::Map(entries) => entries
                .iter()
                .any(|(k, v)| k.contains_managed_link() || v.contains_managed_link()),
            _ => false,
        }
    }

    /// Short name of the variant, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::Link(_) => "link",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<RecordId> for Value {
    fn from(rid: RecordId) -> Self {
        Self::stored_link(rid)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Link(Link::Stored(rid)) => write!(f, "{}", rid),
            Self::Link(Link::Managed(h)) => write!(f, "{}", h),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A domain value: the class it is declared as plus its named fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Record {
    /// Fully qualified class name.
    pub class: String,
    /// Field values by field name. Missing fields read as `Null`.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record of the given class.
    #[must_use]
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Read a field; missing fields are `None`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Replace a field value, returning the previous one.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }
}

/// A raw row as returned by (and written to) the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Store coordinates. Unassigned for a record about to be inserted.
    pub rid: RecordId,
    /// Store-maintained version, incremented on every successful write.
    pub version: u64,
    /// Fully qualified class name of the record.
    pub class: String,
    /// Field values by name.
    pub fields: BTreeMap<String, Value>,
}

impl StoredRecord {
    /// Copy of the row as a domain record.
    #[must_use]
    pub fn to_record(&self) -> Record {
        Record {
            class: self.class.clone(),
            fields: self.fields.clone(),
        }
    }

    /// Read a field; missing fields are `None`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

// =============================================================================
// IDENTITY & LIFECYCLE
// =============================================================================

/// Stable, serializable key of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Identity {
    /// Identity assigned by the store: the record coordinates.
    Datastore(RecordId),
    /// Identity declared by the application through key fields.
    /// `class` is the root of the class hierarchy, so subclasses share a key space.
    Application {
        /// Root class name.
        class: String,
        /// Key field values in declaration order.
        key: Vec<Value>,
    },
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datastore(rid) => write!(f, "{}", rid),
            Self::Application { class, key } => {
                write!(f, "{}(", class)?;
                for (i, k) in key.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Lifecycle state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Not store-backed.
    Transient,
    /// Identity known, fields not loaded.
    Hollow,
    /// Fields loaded and in sync with the store.
    Clean,
    /// Fields loaded and modified, not yet flushed.
    Dirty,
    /// Removed. Terminal.
    Deleted,
}

impl LifecycleState {
    /// Whether the object is backed by a store record.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(self, Self::Hollow | Self::Clean | Self::Dirty)
    }

    /// Get the state name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Hollow => "hollow",
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitset of field positions (at most `MAX_FIELDS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FieldMask(pub u64);

impl FieldMask {
    /// The empty mask.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask covering fields `0..count`.
    #[must_use]
    pub const fn all(count: usize) -> Self {
        if count >= MAX_FIELDS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Mask with a single field.
    #[must_use]
    pub const fn single(index: usize) -> Self {
        Self::empty().with(index)
    }

    /// Mask built from explicit field positions. Positions beyond `MAX_FIELDS` are ignored.
    #[must_use]
    pub fn of(indices: &[usize]) -> Self {
        indices.iter().fold(Self::empty(), |m, &i| m.with(i))
    }

    /// Copy of this mask with `index` added.
    #[must_use]
    pub const fn with(self, index: usize) -> Self {
        if index >= MAX_FIELDS {
            self
        } else {
            Self(self.0 | (1u64 << index))
        }
    }

    /// Check if `index` is in the mask.
    #[must_use]
    pub const fn contains(self, index: usize) -> bool {
        index < MAX_FIELDS && (self.0 >> index) & 1 == 1
    }

    /// Add a field.
    pub fn insert(&mut self, index: usize) {
        *self = self.with(index);
    }

    /// Remove a field.
    pub fn remove(&mut self, index: usize) {
        if index < MAX_FIELDS {
            self.0 &= !(1u64 << index);
        }
    }

    /// Union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every field of `other` is also in `self`.
    #[must_use]
    pub const fn is_superset(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if no field is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of fields set.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Field positions in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_FIELDS).filter(move |&i| self.contains(i))
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the mediation layer.
///
/// - No silent failures
/// - Use `Result<T, TesseraError>` for fallible operations
/// - Nothing is retried internally; the caller decides whether to retry
#[derive(Debug, Error)]
pub enum TesseraError {
    /// A raw record carries no usable key.
    #[error("Cannot derive identity: {0}")]
    IdentityDerivation(String),

    /// An identity was requested as a type incompatible with its registry entry.
    #[error("Type conflict for {identity}: registered as {registered}, requested as {requested}")]
    TypeConflict {
        /// The contested identity.
        identity: Identity,
        /// Class of the existing registry entry.
        registered: String,
        /// Class the caller asked for.
        requested: String,
    },

    /// The expression tree contains something the store cannot express.
    #[error("Query translation failed: {0}")]
    Translation(String),

    /// The stored version does not match the version the caller last saw.
    #[error("Optimistic conflict on {identity}: expected version {expected}, store has {actual}")]
    OptimisticConflict {
        /// The object being written.
        identity: Identity,
        /// Version held in memory.
        expected: u64,
        /// Version found in the store.
        actual: u64,
    },

    /// An expected record is missing.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// The result set was accessed after `close()`.
    #[error("Result set is closed")]
    ResultSetClosed,

    /// Opaque store or network failure.
    #[error("Store connectivity failure: {0}")]
    Connectivity(String),

    /// The object was deleted; no further operation is valid.
    #[error("Object has been deleted: {0}")]
    ObjectDeleted(ObjectHandle),

    /// An insert would register a second object under an existing identity.
    #[error("Identity already registered: {0}")]
    DuplicateIdentity(Identity),

    /// No class descriptor under this name.
    #[error("Unknown class: {0}")]
    UnknownClass(String),

    /// No field under this name or position.
    #[error("Unknown field {field} on {class}")]
    UnknownField {
        /// Class searched.
        class: String,
        /// Requested field name or position.
        field: String,
    },

    /// Positional access past the end of a result set.
    #[error("Index {index} out of range for result of size {size}")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of rows.
        size: usize,
    },

    /// The operation does not apply to this value or object.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
