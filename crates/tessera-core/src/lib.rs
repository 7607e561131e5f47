//! # tessera-core
//!
//! The mediation layer between an in-memory graph of managed objects and a
//! schemaless record store.
//!
//! ## Pieces
//!
//! - `identity`: session registry, one entry per store identity
//! - `activation`: lazy field loading that resolves referenced objects
//! - `query`: declarative query model, translation to native text, evaluation
//! - `result`: lazily materialized, cached result sets
//! - `persistence`: insert/update/delete/fetch orchestration
//! - `sequence`: blocks of ascending ids from counter records
//!
//! Query results flow into identity resolution, which drives activation,
//! which calls back into identity resolution for nested objects.
//!
//! ## Constraints
//!
//! - Synchronous: every store call blocks the caller
//! - Deterministic: BTreeMap only, no floats
//! - One session per thread; result sets may be shared across threads

// =============================================================================
// MODULES
// =============================================================================

pub mod activation;
pub mod config;
pub mod connection;
pub mod identity;
pub mod metadata;
pub mod persistence;
pub mod primitives;
pub mod query;
pub mod result;
pub mod sequence;
pub mod session;
pub mod storage;
pub mod store;
pub mod tracked;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    FieldMask, Identity, LifecycleState, Link, ObjectHandle, Record, RecordId, StoredRecord,
    TesseraError, Value,
};

// =============================================================================
// RE-EXPORTS: Mediation Layer
// =============================================================================

pub use activation::{ActivationReport, FieldValue, GraphActivator};
pub use identity::{FieldAccessor, IdentityResolver, ManagedObject};
pub use metadata::{
    ClassDescriptor, ElementKind, FieldDescriptor, FieldShape, IdentityStrategy, MetadataRegistry,
};
pub use persistence::{InsertContext, PersistenceExecutor};
pub use query::{
    Direction, Expr, NativeQuery, Operator, OrderBy, Parameters, Predicate, QuerySpec,
    QueryTranslator,
};
pub use result::{ManagedRow, QueryResult, ResultIterator, ResultRow, RowConverter, RowRef};
pub use sequence::{IncrementGenerator, Sequence, SequenceAllocator, sequence_class};
pub use session::{Session, SessionRows};
pub use tracked::{ContainerKind, TrackedContainer};

// =============================================================================
// RE-EXPORTS: Stores & Configuration
// =============================================================================

pub use config::{
    FetchSize, PersistenceConfig, QueryOptions, ResultSettings, RetentionPolicy, StoreTarget,
};
pub use connection::{
    Connection, ConnectionGuard, ConnectionListener, ConnectionProvider, SessionContext,
    SharedStoreProvider,
};
pub use storage::{MemoryStore, RedbStore};
pub use store::{DeleteRequest, SaveOutcome, SchemaRegistry, Store, StoreClient};
