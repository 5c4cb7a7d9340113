//! # Structured Documents
//!
//! Free-form key/value payloads (payment gateway responses, variant
//! attributes) are carried as a [`Document`]: an ordered, string-keyed map of
//! typed [`DocValue`]s. It serializes to a plain JSON object so it can be
//! stored in a TEXT column, but code never handles an untyped JSON tree.
//!
//! ```rust
//! use bazaar_core::document::{DocValue, Document};
//!
//! let mut payload = Document::new();
//! payload.insert("gateway", "stripe");
//! payload.insert("amount_cents", 5300);
//! payload.insert("captured", true);
//!
//! assert_eq!(payload.get_str("gateway"), Some("stripe"));
//! assert_eq!(payload.get("amount_cents"), Some(&DocValue::Int(5300)));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A typed value inside a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<DocValue>),
    Map(Document),
}

impl From<&str> for DocValue {
    fn from(value: &str) -> Self {
        DocValue::Text(value.to_string())
    }
}

impl From<String> for DocValue {
    fn from(value: String) -> Self {
        DocValue::Text(value)
    }
}

impl From<i64> for DocValue {
    fn from(value: i64) -> Self {
        DocValue::Int(value)
    }
}

impl From<i32> for DocValue {
    fn from(value: i32) -> Self {
        DocValue::Int(value as i64)
    }
}

impl From<bool> for DocValue {
    fn from(value: bool) -> Self {
        DocValue::Bool(value)
    }
}

impl From<f64> for DocValue {
    fn from(value: f64) -> Self {
        DocValue::Float(value)
    }
}

impl From<Document> for DocValue {
    fn from(value: Document) -> Self {
        DocValue::Map(value)
    }
}

impl<T: Into<DocValue>> From<Vec<T>> for DocValue {
    fn from(values: Vec<T>) -> Self {
        DocValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for DocValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => DocValue::Null,
            Value::Bool(b) => DocValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DocValue::Int(i),
                None => DocValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => DocValue::Text(s),
            Value::Array(items) => DocValue::List(items.into_iter().map(DocValue::from).collect()),
            Value::Object(map) => DocValue::Map(Document(
                map.into_iter().map(|(k, v)| (k, DocValue::from(v))).collect(),
            )),
        }
    }
}

/// Ordered string-keyed map of typed values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(BTreeMap<String, DocValue>);

impl Document {
    pub fn new() -> Self {
        Document(BTreeMap::new())
    }

    /// Inserts a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DocValue>) -> Option<DocValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&DocValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(DocValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(DocValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DocValue)> {
        self.0.iter()
    }

    /// Serializes to the JSON text stored in document columns.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a document column. Anything other than a JSON object is rejected.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl FromIterator<(String, DocValue)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, DocValue)>>(iter: I) -> Self {
        Document(iter.into_iter().collect())
    }
}
