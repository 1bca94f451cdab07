use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("malformed object-store document")]
    Decode(#[from] serde_json::Error),

    #[error("expected a dict at '{0}'")]
    NotADict(String),

    #[error("expected an array at '{0}'")]
    NotAnArray(String),

    #[error("missing key '{0}'")]
    MissingKey(String),

    #[error("key '{key}' has the wrong type (expected {expected})")]
    WrongType { key: String, expected: &'static str },
}

/// A typed KV tree: six leaf types plus the two composites, mirroring the
/// property-list object model the design keeps abstract behind a
/// "Serializable KV store". `Dict` is a `BTreeMap` so sorted-key iteration on
/// externalize falls out of the type instead of being hand-rolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    // A one-field object tagged with `$data` so untagged deserialization
    // can tell an opaque blob apart from a plain `Dict` (tried after this
    // variant) without ambiguity against `Str`.
    Data(DataBlob),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBlob {
    #[serde(rename = "$data", with = "data_as_base64")]
    bytes: Vec<u8>,
}

impl Value {
    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn data(bytes: Vec<u8>) -> Self {
        Value::Data(DataBlob { bytes })
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(&d.bytes),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Returns a copy-on-write clone of this tree. `Value` is already
    /// structurally owned, so this is a plain `Clone`; kept as a named method
    /// to mirror the design's explicit create/copy/copy-mutable operations.
    pub fn copy_mutable(&self) -> Self {
        self.clone()
    }

    /// Serializes this tree to the self-describing textual form.
    pub fn externalize(&self) -> Result<String, ValueError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a tree from its textual form.
    pub fn internalize(s: &str) -> Result<Self, ValueError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Writes this tree to `path` via `tmp + fsync + rename` onto the same
    /// filesystem as `path`, so a reader never observes a partially-written
    /// file. The temp file is created in `path`'s parent directory.
    pub fn externalize_to_file(&self, path: &Path) -> Result<(), ValueError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            use std::io::Write;
            tmp.write_all(self.externalize()?.as_bytes())?;
            tmp.as_file().sync_all()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Reads a tree from `path`. A missing file is treated as an absent
    /// document (`Ok(None)`), never an error, per the absence-tolerance
    /// invariant; any other I/O failure is propagated.
    pub fn internalize_from_file(path: &Path) -> Result<Option<Self>, ValueError> {
        match fs::read_to_string(path) {
            Ok(s) if s.is_empty() => Ok(None),
            Ok(s) => Ok(Some(Value::internalize(&s)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

mod data_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "value.test.rs"]
mod test;
