//! # Query Results
//!
//! A lazily materialized, index-addressable view over the raw rows of one
//! query.
//!
//! Rows are converted on first access through a `RowConverter` and kept
//! according to the result's `RetentionPolicy`:
//!
//! | Policy | Cache                                  |
//! |--------|----------------------------------------|
//! | None   | nothing; every access converts again   |
//! | Weak   | entry lives while a caller holds it    |
//! | Soft   | bounded LRU                            |
//! | Hard   | every converted row, until close       |
//!
//! All state sits behind one mutex, so iterators over the same result can be
//! driven from several threads. `has_next` and `has_previous` read the
//! position and the open flag under that lock.

use crate::config::{FetchSize, ResultSettings, RetentionPolicy};
use crate::{Identity, LifecycleState, ObjectHandle, Record, StoredRecord, TesseraError, Value};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

// =============================================================================
// ROWS
// =============================================================================

/// One materialized row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRow {
    /// A managed object of the candidate class.
    Object(ManagedRow),
    /// Projected values, in projection order.
    Projection(Vec<Value>),
}

impl ResultRow {
    /// Managed row, if this is one.
    #[must_use]
    pub const fn as_object(&self) -> Option<&ManagedRow> {
        match self {
            Self::Object(row) => Some(row),
            Self::Projection(_) => None,
        }
    }
}

/// Snapshot of a managed object taken when its row was materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRow {
    /// Session handle of the object.
    pub handle: ObjectHandle,
    /// Identity the object is registered under.
    pub identity: Identity,
    /// Lifecycle state at materialization.
    pub state: LifecycleState,
    /// Field values at materialization.
    pub record: Record,
}

/// Shared reference to a materialized row.
pub type RowRef = Arc<ResultRow>;

/// Turns a raw store row into a result row.
pub trait RowConverter {
    /// Convert one raw row.
    fn convert(&mut self, raw: &StoredRecord) -> Result<ResultRow, TesseraError>;
}

impl<F> RowConverter for F
where
    F: FnMut(&StoredRecord) -> Result<ResultRow, TesseraError>,
{
    fn convert(&mut self, raw: &StoredRecord) -> Result<ResultRow, TesseraError> {
        self(raw)
    }
}

// =============================================================================
// ROW CACHE
// =============================================================================

enum RowCache {
    None,
    Weak(BTreeMap<usize, Weak<ResultRow>>),
    Soft(LruCache<usize, RowRef>),
    Hard(BTreeMap<usize, RowRef>),
}

impl RowCache {
    fn new(policy: RetentionPolicy, soft_capacity: usize) -> Self {
        match policy {
            RetentionPolicy::None => Self::None,
            RetentionPolicy::Weak => Self::Weak(BTreeMap::new()),
            RetentionPolicy::Soft => {
                let capacity = NonZeroUsize::new(soft_capacity).unwrap_or(NonZeroUsize::MIN);
                Self::Soft(LruCache::new(capacity))
            }
            RetentionPolicy::Hard => Self::Hard(BTreeMap::new()),
        }
    }

    fn get(&mut self, index: usize) -> Option<RowRef> {
        match self {
            Self::None => None,
            Self::Weak(entries) => entries.get(&index).and_then(Weak::upgrade),
            Self::Soft(entries) => entries.get(&index).cloned(),
            Self::Hard(entries) => entries.get(&index).cloned(),
        }
    }

    fn put(&mut self, index: usize, row: &RowRef) {
        match self {
            Self::None => {}
            Self::Weak(entries) => {
                entries.retain(|_, w| w.strong_count() > 0);
                entries.insert(index, Arc::downgrade(row));
            }
            Self::Soft(entries) => {
                entries.put(index, Arc::clone(row));
            }
            Self::Hard(entries) => {
                entries.insert(index, Arc::clone(row));
            }
        }
    }

    fn live_entries(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Weak(entries) => entries.values().filter(|w| w.strong_count() > 0).count(),
            Self::Soft(entries) => entries.len(),
            Self::Hard(entries) => entries.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::None => {}
            Self::Weak(entries) => entries.clear(),
            Self::Soft(entries) => entries.clear(),
            Self::Hard(entries) => entries.clear(),
        }
    }
}

// =============================================================================
// QUERY RESULT
// =============================================================================

struct ResultState<C> {
    rows: Option<Vec<StoredRecord>>,
    cache: RowCache,
    converter: C,
    settings: ResultSettings,
}

impl<C: RowConverter> ResultState<C> {
    fn fetch(&mut self, index: usize) -> Result<RowRef, TesseraError> {
        let Self {
            rows,
            cache,
            converter,
            ..
        } = self;
        let rows = rows.as_ref().ok_or(TesseraError::ResultSetClosed)?;
        let raw = rows.get(index).ok_or(TesseraError::IndexOutOfRange {
            index,
            size: rows.len(),
        })?;
        if let Some(hit) = cache.get(index) {
            return Ok(hit);
        }
        let row = Arc::new(converter.convert(raw)?);
        cache.put(index, &row);
        Ok(row)
    }
}

impl<C> ResultState<C> {
    fn size(&self) -> Option<usize> {
        self.rows.as_ref().map(Vec::len)
    }
}

/// Result set of one query.
pub struct QueryResult<C> {
    state: Mutex<ResultState<C>>,
}

impl<C> std::fmt::Debug for QueryResult<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QueryResult")
            .field("size", &state.size())
            .field("retention", &state.settings.retention)
            .field("cached", &state.cache.live_entries())
            .finish()
    }
}

impl<C: RowConverter> QueryResult<C> {
    /// Open a result over `rows`, materializing eagerly where `settings` ask.
    ///
    /// Every row is converted up front when the policy retains rows and the
    /// session is outside a transaction (or fetch size is greedy). Otherwise a
    /// fixed fetch size converts that many leading rows. A policy that retains
    /// nothing converts no rows at open.
    pub fn new(
        rows: Vec<StoredRecord>,
        converter: C,
        settings: ResultSettings,
    ) -> Result<Self, TesseraError> {
        let eager = match settings.fetch_size {
            _ if !settings.retention.retains() => 0,
            FetchSize::Greedy => rows.len(),
            _ if !settings.transaction_active => rows.len(),
            FetchSize::Rows(n) => n.min(rows.len()),
            FetchSize::Optimal => 0,
        };

        let mut state = ResultState {
            rows: Some(rows),
            cache: RowCache::new(settings.retention, settings.soft_capacity),
            converter,
            settings,
        };
        for index in 0..eager {
            state.fetch(index)?;
        }
        tracing::debug!(
            size = state.size().unwrap_or(0),
            eager,
            retention = ?settings.retention,
            "result set opened"
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Row at `index`.
    ///
    /// # Errors
    ///
    /// - `ResultSetClosed` once the result is closed
    /// - `IndexOutOfRange` past the last row
    pub fn get(&self, index: usize) -> Result<RowRef, TesseraError> {
        self.state.lock().fetch(index)
    }

    /// Number of rows.
    pub fn size(&self) -> Result<usize, TesseraError> {
        self.state.lock().size().ok_or(TesseraError::ResultSetClosed)
    }

    /// Check if the result has not been closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().rows.is_some()
    }

    /// Number of rows currently held by the cache.
    #[must_use]
    pub fn cached_rows(&self) -> usize {
        self.state.lock().cache.live_entries()
    }

    /// Release raw rows and cached rows. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.rows.take().is_some() {
            state.cache.clear();
            tracing::debug!("result set closed");
        }
    }

    /// Connection-closing hook.
    ///
    /// With `load_at_close` set, every row not yet cached is materialized and
    /// pinned so the result stays readable without the connection.
    pub fn on_connection_closing(&self) -> Result<(), TesseraError> {
        let mut state = self.state.lock();
        if !state.settings.load_at_close {
            return Ok(());
        }
        let Some(size) = state.size() else {
            return Ok(());
        };
        let mut pinned = BTreeMap::new();
        for index in 0..size {
            pinned.insert(index, state.fetch(index)?);
        }
        state.cache = RowCache::Hard(pinned);
        tracing::debug!(size, "result rows pinned before connection close");
        Ok(())
    }

    /// Every row, in order.
    pub fn to_vec(&self) -> Result<Vec<RowRef>, TesseraError> {
        let mut state = self.state.lock();
        let size = state.size().ok_or(TesseraError::ResultSetClosed)?;
        (0..size).map(|i| state.fetch(i)).collect()
    }

    /// Bidirectional cursor starting before the first row.
    #[must_use]
    pub fn iter(&self) -> ResultIterator<'_, C> {
        ResultIterator {
            result: self,
            position: 0,
        }
    }

    /// Fetch `index` only if the result is open and holds it.
    fn step(&self, index: usize) -> Option<Result<RowRef, TesseraError>> {
        let mut state = self.state.lock();
        match state.size() {
            Some(size) if index < size => Some(state.fetch(index)),
            _ => None,
        }
    }
}

// =============================================================================
// ITERATOR
// =============================================================================

/// Cursor over a `QueryResult`. Several may run over one result.
pub struct ResultIterator<'r, C> {
    result: &'r QueryResult<C>,
    position: usize,
}

impl<C: RowConverter> ResultIterator<'_, C> {
    /// Check if a row follows the cursor. `false` once the result is closed.
    #[must_use]
    pub fn has_next(&self) -> bool {
        let state = self.result.state.lock();
        state.size().is_some_and(|size| self.position < size)
    }

    /// Check if a row precedes the cursor. `false` once the result is closed.
    #[must_use]
    pub fn has_previous(&self) -> bool {
        let state = self.result.state.lock();
        state.rows.is_some() && self.position > 0
    }

    /// Index `next_row` would return.
    #[must_use]
    pub const fn next_index(&self) -> usize {
        self.position
    }

    /// Index `previous_row` would return, `None` at the start.
    #[must_use]
    pub const fn previous_index(&self) -> Option<usize> {
        self.position.checked_sub(1)
    }

    /// Advance and return the row passed over.
    pub fn next_row(&mut self) -> Result<RowRef, TesseraError> {
        let row = self.result.get(self.position)?;
        self.position += 1;
        Ok(row)
    }

    /// Step back and return the row passed over.
    pub fn previous_row(&mut self) -> Result<RowRef, TesseraError> {
        let index = self.previous_index().ok_or(TesseraError::IndexOutOfRange {
            index: 0,
            size: self.result.size()?,
        })?;
        let row = self.result.get(index)?;
        self.position = index;
        Ok(row)
    }
}

impl<C: RowConverter> Iterator for ResultIterator<'_, C> {
    type Item = Result<RowRef, TesseraError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.result.step(self.position)?;
        self.position += 1;
        Some(item)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::{PersistenceConfig, RecordId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rows(n: usize) -> Vec<StoredRecord> {
        (0..n)
            .map(|i| StoredRecord {
                rid: RecordId::new(1, i as i64),
                version: 1,
                class: "t.Row".into(),
                fields: [("n".to_string(), Value::Int(i as i64))].into(),
            })
            .collect()
    }

    fn counting(counter: &AtomicUsize) -> impl FnMut(&StoredRecord) -> Result<ResultRow, TesseraError> + '_ {
        move |raw| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ResultRow::Projection(vec![raw.get("n").cloned().unwrap_or_default()]))
        }
    }

    fn settings(retention: RetentionPolicy, fetch: FetchSize, tx: bool) -> ResultSettings {
        let options = QueryOptions {
            result_cache: Some(retention),
            fetch_size: Some(fetch),
            load_results_at_commit: None,
        };
        options.settings(&PersistenceConfig::default(), tx)
    }

    #[test]
    fn no_retention_converts_on_every_access() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(3),
            counting(&calls),
            settings(RetentionPolicy::None, FetchSize::Optimal, false),
        )
        .expect("open");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let a = result.get(1).expect("row");
        let b = result.get(1).expect("row");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hard_retention_materializes_outside_transaction() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(4),
            counting(&calls),
            settings(RetentionPolicy::Hard, FetchSize::Optimal, false),
        )
        .expect("open");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let a = result.get(2).expect("row");
        let b = result.get(2).expect("row");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fixed_fetch_size_inside_transaction() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(5),
            counting(&calls),
            settings(RetentionPolicy::Hard, FetchSize::Rows(2), true),
        )
        .expect("open");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.cached_rows(), 2);
    }

    #[test]
    fn fixed_fetch_size_converts_nothing_without_retention() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(5),
            counting(&calls),
            settings(RetentionPolicy::None, FetchSize::Rows(3), true),
        )
        .expect("open");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.cached_rows(), 0);
        let row = result.get(1).expect("row");
        assert_eq!(*row, ResultRow::Projection(vec![Value::Int(1)]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_entries_die_with_their_holders() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(2),
            counting(&calls),
            settings(RetentionPolicy::Weak, FetchSize::Optimal, true),
        )
        .expect("open");
        let held = result.get(0).expect("row");
        let again = result.get(0).expect("row");
        assert!(Arc::ptr_eq(&held, &again));
        drop(held);
        drop(again);
        assert_eq!(result.cached_rows(), 0);
        result.get(0).expect("row");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn soft_cache_is_bounded() {
        let calls = AtomicUsize::new(0);
        let mut s = settings(RetentionPolicy::Soft, FetchSize::Optimal, true);
        s.soft_capacity = 2;
        let result = QueryResult::new(rows(4), counting(&calls), s).expect("open");
        for i in 0..4 {
            result.get(i).expect("row");
        }
        assert_eq!(result.cached_rows(), 2);
    }

    #[test]
    fn close_rejects_access_and_stops_iteration() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(2),
            counting(&calls),
            settings(RetentionPolicy::Hard, FetchSize::Optimal, false),
        )
        .expect("open");
        let mut it = result.iter();
        assert!(it.has_next());
        it.next_row().expect("row");
        assert!(it.has_previous());
        result.close();
        result.close();
        assert!(!result.is_open());
        assert!(!it.has_next());
        assert!(!it.has_previous());
        assert!(matches!(result.get(0), Err(TesseraError::ResultSetClosed)));
        assert!(matches!(result.size(), Err(TesseraError::ResultSetClosed)));
        assert!(it.next().is_none());
    }

    #[test]
    fn cursor_moves_both_ways() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(3),
            counting(&calls),
            settings(RetentionPolicy::Hard, FetchSize::Optimal, false),
        )
        .expect("open");
        let mut it = result.iter();
        assert_eq!(it.previous_index(), None);
        assert!(it.previous_row().is_err());
        it.next_row().expect("row");
        let second = it.next_row().expect("row");
        assert_eq!(it.next_index(), 2);
        let back = it.previous_row().expect("row");
        assert!(Arc::ptr_eq(&second, &back));
        assert_eq!(it.previous_index(), Some(0));
        let rest: Vec<_> = it.collect::<Result<_, _>>().expect("rows");
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn connection_close_pins_rows() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(3),
            counting(&calls),
            settings(RetentionPolicy::None, FetchSize::Optimal, true),
        )
        .expect("open");
        result.on_connection_closing().expect("pin");
        assert_eq!(result.cached_rows(), 3);
        let a = result.get(1).expect("row");
        let b = result.get(1).expect("row");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn out_of_range() {
        let calls = AtomicUsize::new(0);
        let result = QueryResult::new(
            rows(1),
            counting(&calls),
            settings(RetentionPolicy::Hard, FetchSize::Optimal, false),
        )
        .expect("open");
        assert!(matches!(
            result.get(5),
            Err(TesseraError::IndexOutOfRange { index: 5, size: 1 })
        ));
    }
}
