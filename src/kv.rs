//! Ordered, typed, flat key-value container.
//!
//! A [`Kv`] is an ordered list of named, typed entries that serializes to a
//! flat byte buffer: `name\0Tvalue\0` repeated for each entry, where `T` is a
//! single-byte type tag and `value` is the entry rendered as text (decimal
//! integers, fixed-point doubles, `true`/`false`, or an ISO-8601 timestamp).
//! Equality between two `Kv`s is defined as equality of their encoded form.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, ErrorKind, Result};

const TAG_STRING: u8 = b's';
const TAG_INT64: u8 = b'i';
const TAG_DOUBLE: u8 = b'd';
const TAG_BOOL: u8 = b'b';
const TAG_TIMESTAMP: u8 = b't';

/// A typed value held by a [`Kv`] entry.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl KvValue {
    fn tag(&self) -> u8 {
        match self {
            KvValue::String(_) => TAG_STRING,
            KvValue::Int64(_) => TAG_INT64,
            KvValue::Double(_) => TAG_DOUBLE,
            KvValue::Bool(_) => TAG_BOOL,
            KvValue::Timestamp(_) => TAG_TIMESTAMP,
        }
    }

    fn render(&self) -> String {
        match self {
            KvValue::String(s) => s.clone(),
            KvValue::Int64(i) => i.to_string(),
            KvValue::Double(d) => format!("{:.6}", d),
            KvValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            KvValue::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    fn parse(tag: u8, text: &str) -> Result<KvValue> {
        match tag {
            TAG_STRING => Ok(KvValue::String(text.to_string())),
            TAG_INT64 => text
                .parse::<i64>()
                .map(KvValue::Int64)
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid int64 value", e)),
            TAG_DOUBLE => text
                .parse::<f64>()
                .map(KvValue::Double)
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid double value", e)),
            TAG_BOOL => match text {
                "true" => Ok(KvValue::Bool(true)),
                "false" => Ok(KvValue::Bool(false)),
                _ => Err(Error::invalid_argument("invalid bool value")),
            },
            TAG_TIMESTAMP => DateTime::parse_from_rfc3339(text)
                .map(|t| KvValue::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid timestamp value", e)),
            other => Err(Error::invalid_argument(format!(
                "unknown kv type tag '{}'",
                other as char
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct KvEntry {
    name: String,
    value: KvValue,
}

/// An ordered, typed key-value container with flat byte serialization.
#[derive(Debug, Clone, Default)]
pub struct Kv {
    entries: Vec<KvEntry>,
}

fn valid_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("kv key must not be empty"));
    }
    if key.as_bytes().contains(&0) {
        return Err(Error::invalid_argument("kv key must not contain NUL"));
    }
    Ok(())
}

impl Kv {
    pub fn new() -> Self {
        Kv { entries: Vec::new() }
    }

    /// Insert or replace the entry named `key`. Preserves its existing
    /// position on replace, appends on insert.
    pub fn put(&mut self, key: &str, value: KvValue) -> Result<()> {
        valid_key(key)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == key) {
            entry.value = value;
        } else {
            self.entries.push(KvEntry {
                name: key.to_string(),
                value,
            });
        }
        Ok(())
    }

    pub fn put_string(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.put(key, KvValue::String(value.into()))
    }

    pub fn put_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.put(key, KvValue::Int64(value))
    }

    pub fn put_double(&mut self, key: &str, value: f64) -> Result<()> {
        self.put(key, KvValue::Double(value))
    }

    pub fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, KvValue::Bool(value))
    }

    pub fn put_timestamp(&mut self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.put(key, KvValue::Timestamp(value))
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != key);
        if self.entries.len() == before {
            return Err(Error::not_found(format!("no such kv key '{key}'")));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&KvValue> {
        self.entries
            .iter()
            .find(|e| e.name == key)
            .map(|e| &e.value)
            .ok_or_else(|| Error::not_found(format!("no such kv key '{key}'")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.name == key)
    }

    fn get_typed<'a, T>(&'a self, key: &str, extract: impl Fn(&'a KvValue) -> Option<T>) -> Result<T> {
        let v = self.get(key)?;
        extract(v).ok_or_else(|| Error::invalid_argument(format!("kv key '{key}' has the wrong type")))
    }

    pub fn get_string(&self, key: &str) -> Result<&str> {
        self.get_typed(key, |v| match v {
            KvValue::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn get_int64(&self, key: &str) -> Result<i64> {
        self.get_typed(key, |v| match v {
            KvValue::Int64(i) => Some(*i),
            _ => None,
        })
    }

    pub fn get_double(&self, key: &str) -> Result<f64> {
        self.get_typed(key, |v| match v {
            KvValue::Double(d) => Some(*d),
            _ => None,
        })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get_typed(key, |v| match v {
            KvValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    pub fn get_timestamp(&self, key: &str) -> Result<DateTime<Utc>> {
        self.get_typed(key, |v| match v {
            KvValue::Timestamp(t) => Some(*t),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KvValue)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the flat `name\0Tvalue\0...` wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(entry.name.as_bytes());
            buf.push(0);
            buf.push(entry.value.tag());
            buf.extend_from_slice(entry.value.render().as_bytes());
            buf.push(0);
        }
        buf
    }

    /// Parse the flat wire form produced by [`Kv::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Kv> {
        let mut kv = Kv::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let key_end = find_nul(bytes, pos)?;
            if key_end == pos {
                return Err(Error::invalid_argument("kv decode: empty key"));
            }
            let key = std::str::from_utf8(&bytes[pos..key_end])
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "kv decode: invalid utf8 key", e))?;
            let tag_pos = key_end + 1;
            let tag = *bytes
                .get(tag_pos)
                .ok_or_else(|| Error::invalid_argument("kv decode: truncated entry"))?;
            let value_start = tag_pos + 1;
            let value_end = find_nul(bytes, value_start)?;
            let text = std::str::from_utf8(&bytes[value_start..value_end])
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "kv decode: invalid utf8 value", e))?;
            let value = KvValue::parse(tag, text)?;
            kv.put(key, value)?;
            pos = value_end + 1;
        }
        Ok(kv)
    }

    /// Merge `other`'s entries into a copy of `self`, prefixing each of
    /// `other`'s keys with `prefix`.
    pub fn join(&self, prefix: &str, other: &Kv) -> Result<Kv> {
        let mut out = self.clone();
        for (key, value) in other.iter() {
            out.put(&format!("{prefix}{key}"), value.clone())?;
        }
        Ok(out)
    }

    /// Split off all entries whose key starts with `prefix`, returning
    /// `(matched, remainder)`. Matched keys have `prefix` stripped.
    pub fn split(&self, prefix: &str) -> (Kv, Kv) {
        let mut matched = Kv::new();
        let mut remainder = Kv::new();
        for entry in &self.entries {
            if let Some(stripped) = entry.name.strip_prefix(prefix) {
                if stripped.is_empty() {
                    // Name equals `prefix` exactly: omitted per the split contract.
                    continue;
                }
                matched
                    .put(stripped, entry.value.clone())
                    .expect("stripped key still valid");
            } else {
                remainder
                    .put(&entry.name, entry.value.clone())
                    .expect("existing key still valid");
            }
        }
        (matched, remainder)
    }
}

impl PartialEq for Kv {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

fn find_nul(bytes: &[u8], from: usize) -> Result<usize> {
    bytes[from..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| from + p)
        .ok_or_else(|| Error::invalid_argument("kv decode: missing NUL terminator"))
}
