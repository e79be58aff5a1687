use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// A single scalar value carried in a message's [headers](Headers).
///
/// Transports vary widely in what they natively support as header values
/// (AMQP field tables, Kafka byte arrays, cloud-queue string attributes), so
/// this crate settles on the smallest common scalar set and leaves the
/// transport adapter to widen or narrow it as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// A UTF-8 string value.
    String(String),
    /// A signed 64-bit integer value.
    Int(i64),
    /// A boolean value.
    Bool(bool),
    /// An opaque byte sequence.
    Bytes(Vec<u8>),
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Bytes(value) => write!(f, "{} bytes", value.len()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl HeaderValue {
    /// Reports this value as a string, if it is a
    /// [`String`](HeaderValue::String) variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Reports this value as an integer, if it is an [`Int`](HeaderValue::Int)
    /// variant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Reports this value as a boolean, if it is a [`Bool`](HeaderValue::Bool)
    /// variant.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Reports this value as a byte slice, if it is a
    /// [`Bytes`](HeaderValue::Bytes) variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value.as_slice()),
            _ => None,
        }
    }
}

/// A transport-neutral bag of message headers.
///
/// Backed by a [`BTreeMap`] rather than a hash map so that iteration order
/// (used, for instance, when computing a content hash over headers) is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    /// Creates an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, returning the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Option<HeaderValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Retrieves a header value by key.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// Reports whether a header with the given key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Reports the number of headers in this bag.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Reports whether this bag has no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the headers in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self(BTreeMap::from_iter(iter))
    }
}
