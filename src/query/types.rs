use bson::{Bson, Document};
use std::time::Duration;

// Safety limits to keep a single request from producing an unbounded query
pub(crate) const MAX_PATH_DEPTH: usize = 32;
pub const MAX_IN_SET: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    #[must_use]
    pub const fn operator(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
        }
    }
}

/// One predicate clause, or a logical combination of clauses.
///
/// A query is an ordered `Vec<Filter>` read as a conjunction; an empty vector
/// matches every document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    In { path: String, values: Vec<Bson> },
    Cmp { path: String, op: CmpOp, value: Bson },
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Cmp { path: path.into(), op: CmpOp::Eq, value: value.into() }
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Cmp { path: path.into(), op: CmpOp::Gte, value: value.into() }
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Cmp { path: path.into(), op: CmpOp::Lte, value: value.into() }
    }

    /// Set membership over `values`; a single value degenerates to equality and an
    /// empty set yields no clause at all. Request builders bound the set size
    /// before calling this.
    pub fn one_of<V: Into<Bson>>(path: impl Into<String>, values: Vec<V>) -> Option<Self> {
        let path = path.into();
        let mut values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        match values.len() {
            0 => None,
            1 => values.pop().map(|value| Self::Cmp { path, op: CmpOp::Eq, value }),
            _ => Some(Self::In { path, values }),
        }
    }

    /// Field path addressed by a leaf clause.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::In { path, .. } | Self::Cmp { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Options forwarded to the store's `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub max_time: Option<Duration>,
    /// Compare strings without regard to case (collation strength 2).
    pub case_insensitive: bool,
}

/// What a read endpoint hands to the store: either a predicate query for `find`,
/// or a search pipeline for `aggregate`. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Pipeline {
    Predicates(Vec<Filter>),
    Search(Vec<Document>),
}
