//! # Connections
//!
//! Scoped access to a store.
//!
//! Every logical operation acquires one `Connection` through a
//! `ConnectionProvider` and hands it back when done. `ConnectionGuard` does
//! the handing back in `Drop`, so release happens on every exit path,
//! including `?` returns.
//!
//! Closing a connection notifies its listeners before and after. Listener
//! failures are logged and suppressed: they happen during cleanup and must
//! not mask the outcome of the operation that used the connection.

use crate::config::{PersistenceConfig, StoreTarget};
use crate::storage::{MemoryStore, RedbStore};
use crate::store::Store;
use crate::TesseraError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// SESSION CONTEXT & LISTENERS
// =============================================================================

/// What a provider knows about the session asking for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionContext {
    /// Session identifier, for diagnostics.
    pub session_id: u64,
    /// Whether the session is inside a transaction.
    pub transaction_active: bool,
}

/// Observer of a connection's close.
pub trait ConnectionListener: Send + Sync {
    /// Called while the connection is still usable.
    fn pre_close(&self, _connection_id: u64) -> Result<(), TesseraError> {
        Ok(())
    }

    /// Called after the connection has been closed.
    fn post_close(&self, _connection_id: u64) -> Result<(), TesseraError> {
        Ok(())
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// A handle on the store for the duration of one operation.
pub struct Connection {
    id: u64,
    store: Arc<dyn Store>,
    open: bool,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.open)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection on `store`.
    #[must_use]
    pub fn new(id: u64, store: Arc<dyn Store>) -> Self {
        Self {
            id,
            store,
            open: true,
            listeners: Vec::new(),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Check if the connection has not been closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Register a close listener.
    pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    /// The underlying store.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::Connectivity` once the connection is closed.
    pub fn store(&self) -> Result<&dyn Store, TesseraError> {
        if !self.open {
            return Err(TesseraError::Connectivity(format!(
                "connection {} is closed",
                self.id
            )));
        }
        Ok(self.store.as_ref())
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        for listener in &self.listeners {
            if let Err(e) = listener.pre_close(self.id) {
                tracing::warn!(connection = self.id, error = %e, "pre-close listener failed");
            }
        }
        self.open = false;
        for listener in &self.listeners {
            if let Err(e) = listener.post_close(self.id) {
                tracing::warn!(connection = self.id, error = %e, "post-close listener failed");
            }
        }
        tracing::debug!(connection = self.id, "connection closed");
    }
}

// =============================================================================
// PROVIDER
// =============================================================================

/// Source of connections.
pub trait ConnectionProvider: Send + Sync {
    /// Hand out a connection for one operation.
    fn acquire(&self, context: &SessionContext) -> Result<Connection, TesseraError>;

    /// Take a connection back. The provider closes it.
    fn release(&self, connection: Connection);
}

/// A connection that is released when dropped.
pub struct ConnectionGuard<'p> {
    provider: &'p dyn ConnectionProvider,
    connection: Option<Connection>,
}

impl<'p> ConnectionGuard<'p> {
    /// Acquire a connection from `provider`.
    pub fn acquire(
        provider: &'p dyn ConnectionProvider,
        context: &SessionContext,
    ) -> Result<Self, TesseraError> {
        let connection = provider.acquire(context)?;
        Ok(Self {
            provider,
            connection: Some(connection),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> Result<&dyn Store, TesseraError> {
        self.connection
            .as_ref()
            .ok_or_else(|| TesseraError::Connectivity("connection released".to_string()))?
            .store()
    }

    /// Identifier of the held connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(Connection::id)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.provider.release(connection);
        }
    }
}

/// Provider handing out connections to one shared store.
pub struct SharedStoreProvider {
    store: Arc<dyn Store>,
    next_id: AtomicU64,
    active: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl std::fmt::Debug for SharedStoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStoreProvider")
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SharedStoreProvider {
    /// Provider over an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Provider over the store `config.connection_url` selects.
    pub fn from_config(config: &PersistenceConfig) -> Result<Self, TesseraError> {
        let store: Arc<dyn Store> = match config.store_target()? {
            StoreTarget::Memory => Arc::new(MemoryStore::new()),
            StoreTarget::Local(path) => Arc::new(RedbStore::open(path)?),
        };
        tracing::info!(url = %config.connection_url, "store opened");
        Ok(Self::new(store))
    }

    /// Attach a listener to every connection acquired from now on.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    /// Connections acquired and not yet released.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }
}

impl ConnectionProvider for SharedStoreProvider {
    fn acquire(&self, context: &SessionContext) -> Result<Connection, TesseraError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut connection = Connection::new(id, Arc::clone(&self.store));
        for listener in self.listeners.lock().iter() {
            connection.add_listener(Arc::clone(listener));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            connection = id,
            session = context.session_id,
            "connection acquired"
        );
        Ok(connection)
    }

    fn release(&self, mut connection: Connection) {
        connection.close();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// TESTS
// =============================================================================
