//! Record trait and index/filter types

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value stored in the index table for filtered queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Encode for storage. Typed prefixes keep `Int(1)` and `String("1")`
    /// from colliding in the index table.
    pub(crate) fn encode(&self) -> String {
        match self {
            Self::String(s) => format!("s:{}", s),
            Self::Int(i) => format!("i:{}", i),
            Self::Bool(b) => format!("b:{}", b),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// A filter over an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Shorthand for an equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Shorthand for an inequality filter
    pub fn ne(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }
}

/// A record that can be persisted in a [`crate::Store`]
///
/// Implementors pick a collection name and declare which fields are
/// queryable via `indexed_fields`. The body is stored as JSON.
pub trait Record: Serialize + DeserializeOwned {
    /// Unique id within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection (table namespace) this record type lives in
    fn collection_name() -> &'static str;

    /// Fields to index for filtered queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
