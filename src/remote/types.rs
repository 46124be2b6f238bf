//! Documents, queries and watch keys exchanged with the remote store.

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A document snapshot: its full path and JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub path: String,
    pub data: Value,
}

impl Document {
    pub fn new(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path of the collection holding this document.
    pub fn parent(&self) -> &str {
        parent_of(&self.path)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| SyncError::Decode(format!("{}: {}", self.path, e)))
    }

    /// Look up a dotted field path (`group.name`).
    pub fn field(&self, field: &str) -> Option<&Value> {
        field
            .split('.')
            .try_fold(&self.data, |value, segment| value.get(segment))
    }
}

/// Collection path of a document path (empty for top-level paths).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// A scalar a filter compares against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl FilterValue {
    fn to_json(&self) -> Value {
        match self {
            FilterValue::Str(s) => Value::String(s.clone()),
            FilterValue::Int(i) => Value::from(*i),
            FilterValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Order a JSON value against this one. `None` when the types differ.
    fn compare(&self, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (FilterValue::Int(i), Value::Number(n)) => n.as_i64().map(|v| v.cmp(i)),
            (FilterValue::Str(s), Value::String(v)) => Some(v.as_str().cmp(s.as_str())),
            (FilterValue::Bool(b), Value::Bool(v)) => Some(v.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Str(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Str(s)
    }
}

impl From<i64> for FilterValue {
    fn from(i: i64) -> Self {
        FilterValue::Int(i)
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        FilterValue::Bool(b)
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Str(s) => write!(f, "{:?}", s),
            FilterValue::Int(i) => write!(f, "{}", i),
            FilterValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    ArrayContains,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::ArrayContains => "array-contains",
        };
        f.write_str(op)
    }
}

/// One field condition of a query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        let field = doc.field(&self.field);
        match self.op {
            FilterOp::Eq => field == Some(&self.value.to_json()),
            // Missing fields count as "not equal".
            FilterOp::Ne => field != Some(&self.value.to_json()),
            FilterOp::Gt => field.and_then(|v| self.value.compare(v)) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                field.and_then(|v| self.value.compare(v)),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => field.and_then(|v| self.value.compare(v)) == Some(Ordering::Less),
            FilterOp::ArrayContains => {
                let needle = self.value.to_json();
                field
                    .and_then(Value::as_array)
                    .map_or(false, |items| items.contains(&needle))
            }
        }
    }
}

/// A collection path plus conjunctive filters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Whether a document belongs to this query's result set.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.parent() == self.collection && self.filters.iter().all(|f| f.matches(doc))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection)?;
        if !self.filters.is_empty() {
            let parts: Vec<String> = self
                .filters
                .iter()
                .map(|flt| format!("{} {} {}", flt.field, flt.op, flt.value))
                .collect();
            write!(f, "[{}]", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Identity of a live subscription: what is watched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchKey {
    Document(String),
    Collection(Query),
}

impl WatchKey {
    pub fn document(path: impl Into<String>) -> Self {
        WatchKey::Document(path.into())
    }

    /// The document or collection path this key watches.
    pub fn path(&self) -> &str {
        match self {
            WatchKey::Document(path) => path,
            WatchKey::Collection(query) => &query.collection,
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::Document(path) => write!(f, "doc:{}", path),
            WatchKey::Collection(query) => write!(f, "query:{}", query),
        }
    }
}

/// Closes a subscription. Runs at most once; dropping it also tears down.
pub struct Teardown {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Teardown {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A teardown with nothing to release (e.g. a watch that failed to open).
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn run(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    pub fn is_done(&self) -> bool {
        self.action.is_none()
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("done", &self.is_done())
            .finish()
    }
}
