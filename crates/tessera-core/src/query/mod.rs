//! # Query Module
//!
//! Declarative query description and its translation to the store's native form.
//!
//! - `Expr` is the filter expression tree; it is immutable once built
//! - `QuerySpec` bundles candidate class, filter, ordering, range and projection
//! - `translate` turns a spec plus bound parameters into a `NativeQuery`
//! - `eval` evaluates the structured part of a `NativeQuery` for in-process stores

pub mod eval;
mod translate;

pub use translate::{NativeQuery, Predicate, QueryTranslator};

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bound parameter values by name.
pub type Parameters = BTreeMap<String, Value>;

// =============================================================================
// OPERATORS
// =============================================================================

/// Logical operators of the filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Boolean conjunction.
    And,
    /// Boolean disjunction.
    Or,
}

impl Operator {
    /// Native symbol of the operator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }

    /// Binding strength; higher binds tighter.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            _ => 3,
        }
    }

    /// Whether the operator compares two values (as opposed to combining booleans).
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        self.precedence() == 3
    }
}

// =============================================================================
// EXPRESSION TREE
// =============================================================================

/// Node of a filter expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Dotted property path, one segment per element.
    Path(Vec<String>),
    /// Inline value.
    Literal(Value),
    /// Named parameter resolved through the bound parameters.
    Parameter(String),
    /// Binary operation.
    Binary {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: Operator,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Nested query.
    Subquery(Box<QuerySpec>),
}

impl Expr {
    /// Property path from dotted notation (`"address.city"`).
    #[must_use]
    pub fn path(dotted: &str) -> Self {
        Self::Path(dotted.split('.').map(str::to_string).collect())
    }

    /// Inline literal.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Named parameter.
    #[must_use]
    pub fn param(name: impl Into<String>) -> Self {
        Self::Parameter(name.into())
    }

    /// Binary operation.
    #[must_use]
    pub fn binary(left: Self, op: Operator, right: Self) -> Self {
        Self::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// `self = right`
    #[must_use]
    pub fn eq(self, right: Self) -> Self {
        Self::binary(self, Operator::Eq, right)
    }

    /// `self <> right`
    #[must_use]
    pub fn ne(self, right: Self) -> Self {
        Self::binary(self, Operator::Ne, right)
    }

    /// `self < right`
    #[must_use]
    pub fn lt(self, right: Self) -> Self {
        Self::binary(self, Operator::Lt, right)
    }

    /// `self <= right`
    #[must_use]
    pub fn le(self, right: Self) -> Self {
        Self::binary(self, Operator::Le, right)
    }

    /// `self > right`
    #[must_use]
    pub fn gt(self, right: Self) -> Self {
        Self::binary(self, Operator::Gt, right)
    }

    /// `self >= right`
    #[must_use]
    pub fn ge(self, right: Self) -> Self {
        Self::binary(self, Operator::Ge, right)
    }

    /// `self and right`
    #[must_use]
    pub fn and(self, right: Self) -> Self {
        Self::binary(self, Operator::And, right)
    }

    /// `self or right`
    #[must_use]
    pub fn or(self, right: Self) -> Self {
        Self::binary(self, Operator::Or, right)
    }
}

// =============================================================================
// QUERY SPEC
// =============================================================================

/// Sort direction of an ordering clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ascending.
    Ascending,
    /// Descending.
    Descending,
}

impl Direction {
    /// Native keyword.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Property path to sort on.
    pub path: Vec<String>,
    /// Sort direction.
    pub direction: Direction,
}

/// A declarative query against one candidate class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Fully qualified candidate class.
    pub candidate: String,
    /// Whether instances of subclasses qualify.
    pub include_subclasses: bool,
    /// Optional filter.
    pub filter: Option<Expr>,
    /// Ordering clauses, most significant first.
    pub ordering: Vec<OrderBy>,
    /// Rows to skip.
    pub skip: Option<usize>,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Result projection: when set, rows materialize as the values of these paths.
    pub projection: Option<Vec<Vec<String>>>,
}

impl QuerySpec {
    /// Query every instance of `candidate` (subclasses included).
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            include_subclasses: true,
            filter: None,
            ordering: Vec::new(),
            skip: None,
            limit: None,
            projection: None,
        }
    }

    /// Set the filter.
    #[must_use]
    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restrict to exact instances of the candidate class.
    #[must_use]
    pub fn exclude_subclasses(mut self) -> Self {
        self.include_subclasses = false;
        self
    }

    /// Append an ordering clause.
    #[must_use]
    pub fn order_by(mut self, dotted: &str, direction: Direction) -> Self {
        self.ordering.push(OrderBy {
            path: dotted.split('.').map(str::to_string).collect(),
            direction,
        });
        self
    }

    /// Restrict the row range.
    #[must_use]
    pub fn range(mut self, skip: usize, limit: usize) -> Self {
        self.skip = Some(skip);
        self.limit = Some(limit);
        self
    }

    /// Materialize rows as the values of the given dotted paths.
    #[must_use]
    pub fn project(mut self, paths: &[&str]) -> Self {
        self.projection = Some(
            paths
                .iter()
                .map(|p| p.split('.').map(str::to_string).collect())
                .collect(),
        );
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================
