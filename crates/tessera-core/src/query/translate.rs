//! # Query Translation
//!
//! Turns a `QuerySpec` plus bound parameters into the store's native query
//! text and a structured predicate.
//!
//! ## Rendering Rules
//!
//! - Candidate is rendered by its store name: `select from Person`
//! - Paths are joined with `.`
//! - Binary nodes render as `left op right`; parentheses appear only where
//!   operator precedence requires them (`or` < `and` < comparisons)
//! - Parameters and literals render as `null`, a native number or boolean,
//!   a single-quoted string (`\` and `'` escaped), or a record id `#c:p`
//! - A parameter without a bound value renders as `null`
//! - Subqueries are rejected with `TesseraError::Translation`

use super::{Expr, Operator, OrderBy, Parameters, QuerySpec};
use crate::metadata::{ClassDescriptor, MetadataRegistry};
use crate::primitives::{CLASS_ATTRIBUTE, RID_ATTRIBUTE};
use crate::store::SchemaRegistry;
use crate::{Link, TesseraError, Value};
use std::fmt::{self, Write};
use std::sync::Arc;

// =============================================================================
// NATIVE QUERY
// =============================================================================

/// Parameter-free filter, evaluable without the originating spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Property path of the row.
    Path(Vec<String>),
    /// Bound value.
    Value(Value),
    /// Binary operation.
    Binary {
        /// Left operand.
        left: Box<Predicate>,
        /// Operator.
        op: Operator,
        /// Right operand.
        right: Box<Predicate>,
    },
}

impl Predicate {
    fn binary(left: Self, op: Operator, right: Self) -> Self {
        Self::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }
}

/// A translated query: native text plus the same query in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeQuery {
    /// Native query text.
    pub text: String,
    /// Fully qualified candidate class.
    pub candidate: String,
    /// Store names of the classes whose records qualify.
    pub targets: Vec<String>,
    /// Bound filter.
    pub predicate: Option<Predicate>,
    /// Ordering clauses.
    pub ordering: Vec<OrderBy>,
    /// Rows to skip.
    pub skip: Option<usize>,
    /// Maximum rows.
    pub limit: Option<usize>,
    /// Projected paths, if any.
    pub projection: Option<Vec<Vec<String>>>,
}

impl fmt::Display for NativeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

// =============================================================================
// TRANSLATOR
// =============================================================================

/// Translates query specs against a metadata registry.
#[derive(Debug, Clone, Copy)]
pub struct QueryTranslator<'a> {
    metadata: &'a MetadataRegistry,
}

impl<'a> QueryTranslator<'a> {
    /// Create a translator over the given metadata.
    #[must_use]
    pub const fn new(metadata: &'a MetadataRegistry) -> Self {
        Self { metadata }
    }

    /// Translate `spec` with `params` bound.
    ///
    /// Every class the query targets is registered with `schema` before the
    /// text is produced. Translation is otherwise pure: the same inputs always
    /// produce the same text.
    ///
    /// # Errors
    ///
    /// - `UnknownClass` if the candidate is not in the metadata
    /// - `UnknownField` if a path does not start at a declared field
    /// - `Translation` for subqueries or literals referencing unsaved objects
    pub fn translate<S>(
        &self,
        spec: &QuerySpec,
        params: &Parameters,
        schema: &S,
    ) -> Result<NativeQuery, TesseraError>
    where
        S: SchemaRegistry + ?Sized,
    {
        let candidate = self.metadata.get(&spec.candidate)?;
        let family = if spec.include_subclasses {
            self.metadata.with_subclasses(&candidate.name)
        } else {
            vec![Arc::clone(&candidate)]
        };
        for class in &family {
            schema.ensure_type_registered(class)?;
        }

        let filter = spec
            .filter
            .as_ref()
            .map(|expr| self.bind(expr, params, &family, &candidate))
            .transpose()?;

        let predicate = if spec.include_subclasses {
            filter
        } else {
            let restriction = Predicate::binary(
                Predicate::Path(vec![CLASS_ATTRIBUTE.to_string()]),
                Operator::Eq,
                Predicate::Value(Value::text(candidate.store_name())),
            );
            Some(match filter {
                Some(f) => Predicate::binary(restriction, Operator::And, f),
                None => restriction,
            })
        };

        for order in &spec.ordering {
            check_path(&order.path, &family, &candidate)?;
        }
        if let Some(projection) = &spec.projection {
            for path in projection {
                check_path(path, &family, &candidate)?;
            }
        }

        let mut text = String::from("select ");
        if let Some(projection) = &spec.projection {
            let columns: Vec<String> = projection.iter().map(|p| p.join(".")).collect();
            text.push_str(&columns.join(", "));
            text.push(' ');
        }
        text.push_str("from ");
        text.push_str(candidate.store_name());
        if let Some(pred) = &predicate {
            text.push_str(" where ");
            render(pred, &mut text);
        }
        if !spec.ordering.is_empty() {
            let clauses: Vec<String> = spec
                .ordering
                .iter()
                .map(|o| format!("{} {}", o.path.join("."), o.direction.keyword()))
                .collect();
            text.push_str(" order by ");
            text.push_str(&clauses.join(", "));
        }
        if let Some(skip) = spec.skip {
            let _ = write!(text, " skip {}", skip);
        }
        if let Some(limit) = spec.limit {
            let _ = write!(text, " limit {}", limit);
        }

        tracing::debug!(candidate = %candidate.name, query = %text, "translated query");

        Ok(NativeQuery {
            text,
            candidate: candidate.name.clone(),
            targets: family.iter().map(|c| c.store_name().to_string()).collect(),
            predicate,
            ordering: spec.ordering.clone(),
            skip: spec.skip,
            limit: spec.limit,
            projection: spec.projection.clone(),
        })
    }

    fn bind(
        &self,
        expr: &Expr,
        params: &Parameters,
        family: &[Arc<ClassDescriptor>],
        candidate: &ClassDescriptor,
    ) -> Result<Predicate, TesseraError> {
        match expr {
            Expr::Path(path) => {
                check_path(path, family, candidate)?;
                Ok(Predicate::Path(path.clone()))
            }
            Expr::Literal(value) => bound_value(value.clone()),
            Expr::Parameter(name) => match params.get(name) {
                Some(value) => bound_value(value.clone()),
                None => {
                    tracing::debug!(parameter = %name, "unbound parameter renders as null");
                    Ok(Predicate::Value(Value::Null))
                }
            },
            Expr::Binary { left, op, right } => Ok(Predicate::binary(
                self.bind(left, params, family, candidate)?,
                *op,
                self.bind(right, params, family, candidate)?,
            )),
            Expr::Subquery(inner) => Err(TesseraError::Translation(format!(
                "subquery over {} is not supported",
                inner.candidate
            ))),
        }
    }
}

fn bound_value(value: Value) -> Result<Predicate, TesseraError> {
    if value.contains_managed_link() {
        return Err(TesseraError::Translation(
            "query value refers to an object that has not been stored".to_string(),
        ));
    }
    Ok(Predicate::Value(value))
}

fn check_path(
    path: &[String],
    family: &[Arc<ClassDescriptor>],
    candidate: &ClassDescriptor,
) -> Result<(), TesseraError> {
    let Some(head) = path.first() else {
        return Err(TesseraError::Translation("empty property path".to_string()));
    };
    if head == CLASS_ATTRIBUTE || head == RID_ATTRIBUTE {
        return Ok(());
    }
    if family.iter().any(|c| c.field_index(head).is_some()) {
        Ok(())
    } else {
        Err(TesseraError::UnknownField {
            class: candidate.name.clone(),
            field: path.join("."),
        })
    }
}

// =============================================================================
// RENDERING
// =============================================================================

fn render(pred: &Predicate, out: &mut String) {
    match pred {
        Predicate::Path(path) => out.push_str(&path.join(".")),
        Predicate::Value(value) => render_value(value, out),
        Predicate::Binary { left, op, right } => {
            render_operand(left, *op, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            render_operand(right, *op, out);
        }
    }
}

fn render_operand(child: &Predicate, parent: Operator, out: &mut String) {
    let grouped = match child {
        Predicate::Binary { op, .. } => {
            op.precedence() < parent.precedence() || (op.is_comparison() && parent.is_comparison())
        }
        _ => false,
    };
    if grouped {
        out.push('(');
        render(child, out);
        out.push(')');
    } else {
        render(child, out);
    }
}

fn render_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Text(s) => quote(s, out),
        Value::Link(Link::Stored(rid)) => {
            let _ = write!(out, "{}", rid);
        }
        // Rejected while binding.
        Value::Link(Link::Managed(_)) => out.push_str("null"),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_value(item, out);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_value(k, out);
                out.push_str(": ");
                render_value(v, out);
            }
            out.push('}');
        }
    }
}

fn quote(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

// =============================================================================
// TESTS
// =============================================================================
