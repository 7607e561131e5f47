//! # Predicate Evaluation
//!
//! Evaluates translated queries against stored records. In-process stores use
//! this instead of parsing the native text.
//!
//! Comparison semantics:
//! - `=` / `<>` compare structurally, `null = null` holds
//! - Ordering comparisons only hold between non-null values of the same kind
//! - Path segments after the first descend into maps (text keys) and follow
//!   stored links through the supplied loader

use super::{Direction, NativeQuery, Operator, Predicate};
use crate::metadata::simple_name;
use crate::primitives::{CLASS_ATTRIBUTE, RID_ATTRIBUTE};
use crate::{Link, RecordId, StoredRecord, TesseraError, Value};
use std::cmp::Ordering;
use std::mem::discriminant;

/// Loads a record by id while a path follows a link.
pub trait RecordLoader {
    /// Load `rid`, `None` if it does not exist.
    fn load_record(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError>;
}

impl<F> RecordLoader for F
where
    F: Fn(RecordId) -> Result<Option<StoredRecord>, TesseraError>,
{
    fn load_record(&self, rid: RecordId) -> Result<Option<StoredRecord>, TesseraError> {
        self(rid)
    }
}

/// Value of a property path on a record. Missing steps yield `Null`.
pub fn resolve_path(
    record: &StoredRecord,
    path: &[String],
    loader: &dyn RecordLoader,
) -> Result<Value, TesseraError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(Value::Null);
    };
    let mut current = attribute(record, head);
    for segment in rest {
        current = match current {
            Value::Map(entries) => entries
                .get(&Value::text(segment.as_str()))
                .cloned()
                .unwrap_or_default(),
            Value::Link(Link::Stored(rid)) => match loader.load_record(rid)? {
                Some(target) => attribute(&target, segment),
                None => Value::Null,
            },
            _ => Value::Null,
        };
    }
    Ok(current)
}

fn attribute(record: &StoredRecord, name: &str) -> Value {
    match name {
        CLASS_ATTRIBUTE => Value::text(simple_name(&record.class)),
        RID_ATTRIBUTE => Value::stored_link(record.rid),
        field => record.get(field).cloned().unwrap_or_default(),
    }
}

/// Evaluate a predicate to a value.
pub fn evaluate(
    pred: &Predicate,
    record: &StoredRecord,
    loader: &dyn RecordLoader,
) -> Result<Value, TesseraError> {
    match pred {
        Predicate::Path(path) => resolve_path(record, path, loader),
        Predicate::Value(value) => Ok(value.clone()),
        Predicate::Binary { left, op, right } => {
            let lhs = evaluate(left, record, loader)?;
            let result = match op {
                Operator::And => truthy(&lhs) && truthy(&evaluate(right, record, loader)?),
                Operator::Or => truthy(&lhs) || truthy(&evaluate(right, record, loader)?),
                cmp => compare(*cmp, &lhs, &evaluate(right, record, loader)?),
            };
            Ok(Value::Bool(result))
        }
    }
}

/// Whether a record satisfies the predicate.
pub fn matches(
    pred: &Predicate,
    record: &StoredRecord,
    loader: &dyn RecordLoader,
) -> Result<bool, TesseraError> {
    evaluate(pred, record, loader).map(|v| truthy(&v))
}

fn truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

fn compare(op: Operator, lhs: &Value, rhs: &Value) -> bool {
    match op {
        Operator::Eq => lhs == rhs,
        Operator::Ne => lhs != rhs,
        _ => {
            if lhs.is_null() || rhs.is_null() || discriminant(lhs) != discriminant(rhs) {
                return false;
            }
            let ord = lhs.cmp(rhs);
            match op {
                Operator::Lt => ord == Ordering::Less,
                Operator::Le => ord != Ordering::Greater,
                Operator::Gt => ord == Ordering::Greater,
                Operator::Ge => ord != Ordering::Less,
                _ => false,
            }
        }
    }
}

/// Filter, order and slice candidate rows as `query` describes.
///
/// Candidates are expected in store order; sorting is stable so ties keep it.
pub fn apply(
    query: &NativeQuery,
    candidates: Vec<StoredRecord>,
    loader: &dyn RecordLoader,
) -> Result<Vec<StoredRecord>, TesseraError> {
    let mut keyed = Vec::with_capacity(candidates.len());
    for record in candidates {
        if let Some(pred) = &query.predicate {
            if !matches(pred, &record, loader)? {
                continue;
            }
        }
        let mut keys = Vec::with_capacity(query.ordering.len());
        for order in &query.ordering {
            keys.push(resolve_path(&record, &order.path, loader)?);
        }
        keyed.push((keys, record));
    }

    if !query.ordering.is_empty() {
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, order) in query.ordering.iter().enumerate() {
                let ord = match order.direction {
                    Direction::Ascending => a[i].cmp(&b[i]),
                    Direction::Descending => b[i].cmp(&a[i]),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    Ok(keyed
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|(_, record)| record)
        .collect())
}

/// Project a record onto the query's columns.
pub fn project(
    paths: &[Vec<String>],
    record: &StoredRecord,
    loader: &dyn RecordLoader,
) -> Result<Vec<Value>, TesseraError> {
    paths
        .iter()
        .map(|path| resolve_path(record, path, loader))
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================
