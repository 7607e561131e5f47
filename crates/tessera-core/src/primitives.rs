//! # Primitives
//!
//! Hardcoded runtime constants for the mediation layer.
//!
//! These values are compiled into the binary and are immutable at runtime;
//! anything a deployment may want to change lives in `config` instead.

/// Maximum number of fields a class may declare.
///
/// Loaded/dirty tracking uses a 64-bit mask per managed object.
pub const MAX_FIELDS: usize = 64;

/// Default number of identifiers a sequence counter advances per reservation.
pub const DEFAULT_ALLOCATION_SIZE: i64 = 5;

/// First identifier handed out by a sequence counter that does not exist yet.
pub const SEQUENCE_INITIAL_VALUE: i64 = 1;

/// Class name of the persisted sequence counter records.
pub const SEQUENCE_CLASS: &str = "tessera.SequenceCounter";

/// Field of a sequence counter holding the allocator name.
pub const SEQUENCE_NAME_FIELD: &str = "entityName";

/// Field of a sequence counter holding the next value to hand out.
pub const SEQUENCE_VALUE_FIELD: &str = "currentValue";

/// Capacity of a soft-retention result cache when none is configured.
pub const DEFAULT_SOFT_CACHE_CAPACITY: usize = 256;

/// Pseudo-field resolving to the simple class name of a stored record.
pub const CLASS_ATTRIBUTE: &str = "@class";

/// Pseudo-field resolving to the record id of a stored record.
pub const RID_ATTRIBUTE: &str = "@rid";

/// Upper bound on superclass chain walks.
///
/// Guards against malformed metadata that declares a cyclic hierarchy.
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// URL scheme selecting the in-process memory store.
pub const MEMORY_URL_PREFIX: &str = "memory:";

/// URL scheme selecting the embedded redb store.
pub const LOCAL_URL_PREFIX: &str = "local:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_defaults() {
        assert_eq!(DEFAULT_ALLOCATION_SIZE, 5);
        assert_eq!(SEQUENCE_INITIAL_VALUE, 1);
    }

    #[test]
    fn mask_width_matches_field_limit() {
        assert_eq!(MAX_FIELDS, u64::BITS as usize);
    }
}
