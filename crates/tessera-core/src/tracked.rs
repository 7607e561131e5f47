//! # Change-Tracking Containers
//!
//! Container fields (collections, maps, arrays) of a managed object are
//! wrapped once they are activated or inserted. In-place mutation goes through
//! the wrapper, which records that the owning field needs flushing, so no full
//! field re-scan is needed to notice it.

use crate::metadata::FieldShape;
use crate::{TesseraError, Value};
use std::collections::BTreeMap;

/// Which container shape a wrapper enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Growable list.
    Collection,
    /// Keyed map.
    Map,
    /// Fixed-length list.
    Array,
}

impl ContainerKind {
    /// Container kind of a field shape, `None` for scalars and references.
    #[must_use]
    pub const fn of(shape: &FieldShape) -> Option<Self> {
        match shape {
            FieldShape::Collection { .. } => Some(Self::Collection),
            FieldShape::Map { .. } => Some(Self::Map),
            FieldShape::Array { .. } => Some(Self::Array),
            FieldShape::Scalar | FieldShape::Reference { .. } => None,
        }
    }
}

/// A container value plus its modification flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContainer {
    kind: ContainerKind,
    value: Value,
    modified: bool,
}

impl TrackedContainer {
    /// Wrap a field value. `Null` becomes an empty container.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::Unsupported` if the value's shape does not match `kind`.
    pub fn wrap(kind: ContainerKind, value: Value) -> Result<Self, TesseraError> {
        let value = match (kind, value) {
            (ContainerKind::Collection | ContainerKind::Array, Value::Null) => Value::List(Vec::new()),
            (ContainerKind::Map, Value::Null) => Value::Map(BTreeMap::new()),
            (ContainerKind::Collection | ContainerKind::Array, v @ Value::List(_))
            | (ContainerKind::Map, v @ Value::Map(_)) => v,
            (kind, other) => {
                return Err(TesseraError::Unsupported(format!(
                    "cannot track a {} value as {:?}",
                    other.kind(),
                    kind
                )));
            }
        };
        Ok(Self {
            kind,
            value,
            modified: false,
        })
    }

    /// Container kind.
    #[must_use]
    pub const fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Current contents.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the contents changed since wrapping or the last flush.
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        self.modified
    }

    /// Number of elements (entries for maps).
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.value {
            Value::List(items) => items.len(),
            Value::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    /// Check if the container holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements for lists; keys followed by values for maps.
    #[must_use]
    pub fn elements(&self) -> Vec<&Value> {
        match &self.value {
            Value::List(items) => items.iter().collect(),
            Value::Map(entries) => entries.keys().chain(entries.values()).collect(),
            _ => Vec::new(),
        }
    }

    /// Append to a collection.
    pub fn push(&mut self, item: Value) -> Result<(), TesseraError> {
        if self.kind != ContainerKind::Collection {
            return Err(self.unsupported("push"));
        }
        self.list_mut()?.push(item);
        self.modified = true;
        Ok(())
    }

    /// Replace the element at `index` of a collection or array.
    pub fn set_at(&mut self, index: usize, item: Value) -> Result<Value, TesseraError> {
        let items = self.list_mut()?;
        let size = items.len();
        let slot = items
            .get_mut(index)
            .ok_or(TesseraError::IndexOutOfRange { index, size })?;
        let previous = std::mem::replace(slot, item);
        self.modified = true;
        Ok(previous)
    }

    /// Remove the element at `index` of a collection.
    pub fn remove_at(&mut self, index: usize) -> Result<Value, TesseraError> {
        if self.kind != ContainerKind::Collection {
            return Err(self.unsupported("remove_at"));
        }
        let items = self.list_mut()?;
        if index >= items.len() {
            return Err(TesseraError::IndexOutOfRange {
                index,
                size: items.len(),
            });
        }
        let removed = items.remove(index);
        self.modified = true;
        Ok(removed)
    }

    /// Insert or replace a map entry.
    pub fn insert_entry(&mut self, key: Value, item: Value) -> Result<Option<Value>, TesseraError> {
        let previous = self.map_mut()?.insert(key, item);
        self.modified = true;
        Ok(previous)
    }

    /// Remove a map entry.
    pub fn remove_key(&mut self, key: &Value) -> Result<Option<Value>, TesseraError> {
        let removed = self.map_mut()?.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        Ok(removed)
    }

    /// Remove every element of a collection or map.
    pub fn clear(&mut self) -> Result<(), TesseraError> {
        let kind = self.kind;
        match (kind, &mut self.value) {
            (ContainerKind::Collection, Value::List(items)) => items.clear(),
            (ContainerKind::Map, Value::Map(entries)) => entries.clear(),
            _ => {
                return Err(TesseraError::Unsupported(format!(
                    "clear on a {:?} container",
                    kind
                )));
            }
        }
        self.modified = true;
        Ok(())
    }

    /// Forget pending modifications after a successful write.
    pub fn mark_flushed(&mut self) {
        self.modified = false;
    }

    fn list_mut(&mut self) -> Result<&mut Vec<Value>, TesseraError> {
        let kind = self.kind;
        match &mut self.value {
            Value::List(items) => Ok(items),
            _ => Err(TesseraError::Unsupported(format!(
                "{:?} container holds no list",
                kind
            ))),
        }
    }

    fn map_mut(&mut self) -> Result<&mut BTreeMap<Value, Value>, TesseraError> {
        let kind = self.kind;
        match &mut self.value {
            Value::Map(entries) => Ok(entries),
            _ => Err(TesseraError::Unsupported(format!(
                "{:?} container holds no map",
                kind
            ))),
        }
    }

    fn unsupported(&self, op: &str) -> TesseraError {
        TesseraError::Unsupported(format!("{} on a {:?} container", op, self.kind))
    }
}

// =============================================================================
// TESTS
// =============================================================================
