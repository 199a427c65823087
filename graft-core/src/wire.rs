//! Format-neutral wire tree
//!
//! Both message formats serialize through [`Wire`], so the codec only ever
//! builds and inspects this tree and never sees JSON or CBOR directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Index into the remote handle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for Handle {
    fn from(index: usize) -> Self {
        Handle(index as u64)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = Wire::deserialize(deserializer)?;
        wire.as_u64()
            .map(Handle)
            .ok_or_else(|| de::Error::custom(format!("expected a handle, got {}", wire.kind())))
    }
}

/// A serialized value, before it is written in a particular format
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Wire {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Wire>),
    Map(BTreeMap<String, Wire>),
}

impl Wire {
    pub fn kind(&self) -> &'static str {
        match self {
            Wire::Nil => "nil",
            Wire::Bool(_) => "bool",
            Wire::Int(_) => "int",
            Wire::Float(_) => "float",
            Wire::Str(_) => "string",
            Wire::Bin(_) => "binary",
            Wire::Array(_) => "array",
            Wire::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Wire::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; integral floats count, since some peers only know doubles
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Wire::Int(i) => Some(*i),
            Wire::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_array(&self) -> Option<&[Wire]> {
        match self {
            Wire::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Wire>> {
        match self {
            Wire::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Name of a tagged list such as `["__matrix__", ...]`
    pub fn tag(&self) -> Option<&str> {
        let first = self.as_array()?.first()?.as_str()?;
        (first.len() > 4 && first.starts_with("__") && first.ends_with("__")).then_some(first)
    }

    pub fn str(value: impl Into<String>) -> Self {
        Wire::Str(value.into())
    }
}

impl From<&str> for Wire {
    fn from(value: &str) -> Self {
        Wire::Str(value.to_string())
    }
}

impl From<i64> for Wire {
    fn from(value: i64) -> Self {
        Wire::Int(value)
    }
}

impl From<Handle> for Wire {
    fn from(handle: Handle) -> Self {
        match i64::try_from(handle.0) {
            Ok(i) => Wire::Int(i),
            Err(_) => Wire::Float(handle.0 as f64),
        }
    }
}

impl Serialize for Wire {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Wire::Nil => serializer.serialize_unit(),
            Wire::Bool(b) => serializer.serialize_bool(*b),
            Wire::Int(i) => serializer.serialize_i64(*i),
            Wire::Float(f) => serializer.serialize_f64(*f),
            Wire::Str(s) => serializer.serialize_str(s),
            Wire::Bin(bytes) => serializer.serialize_bytes(bytes),
            Wire::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Wire::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct WireVisitor;

impl<'de> Visitor<'de> for WireVisitor {
    type Value = Wire;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any wire value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Wire, E> {
        Ok(Wire::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Wire, E> {
        Ok(Wire::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Wire, E> {
        Ok(i64::try_from(v).map_or(Wire::Float(v as f64), Wire::Int))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> Result<Wire, E> {
        Ok(i64::try_from(v).map_or(Wire::Float(v as f64), Wire::Int))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Wire, E> {
        Ok(i64::try_from(v).map_or(Wire::Float(v as f64), Wire::Int))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Wire, E> {
        Ok(Wire::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Wire, E> {
        Ok(Wire::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Wire, E> {
        Ok(Wire::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Wire, E> {
        Ok(Wire::Bin(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Wire, E> {
        Ok(Wire::Bin(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Wire, E> {
        Ok(Wire::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Wire, E> {
        Ok(Wire::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Wire, D::Error> {
        Wire::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Wire, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Wire::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Wire, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<Wire, Wire>()? {
            let key = match key {
                Wire::Str(s) => s,
                Wire::Int(i) => i.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "map keys must be strings, got {}",
                        other.kind()
                    )))
                }
            };
            entries.insert(key, value);
        }
        Ok(Wire::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Wire {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WireVisitor)
    }
}
