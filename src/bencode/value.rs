use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// Bencode has four kinds: integers, byte strings, lists, and dictionaries
/// with byte-string keys. Dictionaries are held in a `BTreeMap` so the
/// encoder emits keys in the ascending lexicographic order the wire format
/// requires.
///
/// # Examples
///
/// ```
/// use dhtscout::bencode::Value;
///
/// let int = Value::Integer(42);
/// assert_eq!(int.as_integer(), Some(42));
///
/// let s = Value::string("ping");
/// assert_eq!(s.as_str(), Some("ping"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string; not necessarily valid UTF-8.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary keyed by byte strings, sorted.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte-string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Returns the integer, if this value is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the byte string, if this value is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8 text, if it is one and decodes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the list, if this value is one.
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the dictionary, if this value is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    ///
    /// # Examples
    ///
    /// ```
    /// use dhtscout::bencode::decode;
    ///
    /// let msg = decode(b"d1:y1:qe").unwrap();
    /// assert_eq!(msg.get(b"y").and_then(|v| v.as_str()), Some("q"));
    /// assert_eq!(msg.get(b"t"), None);
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}
