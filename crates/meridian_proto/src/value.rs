//! Self-describing value encoding.
//!
//! One tag byte per value, little-endian scalars, `u32`-prefixed lengths.
//! Mappings are keyed by strings and encode their entries in key order, so
//! encoding the same logical tree always yields the same bytes; persisted
//! entity blobs rely on that canonical form.
//!
//! This is the only argument/attribute encoding in the cluster; there is no
//! schema negotiation and no versioning beyond the closed tag set.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::error::ProtoError;

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_UINT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// A dynamically typed value as it travels on the wire and lives in entity
/// attribute trees.
///
/// Maps are ordered by key ([`BTreeMap`]), lists preserve insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convenience constructor for an empty map.
    pub fn map() -> Value {
        Value::Map(BTreeMap::new())
    }

    /// Convenience constructor for an empty list.
    pub fn list() -> Value {
        Value::List(Vec::new())
    }

    /// Returns the contained map, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the contained map mutably, if this is a map.
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the contained list, if this is a list.
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the contained string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained integer, if this is a signed integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Encodes this value into `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Value::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*v));
            }
            Value::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*v);
            }
            Value::Uint(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u64_le(*v);
            }
            Value::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64_le(*v);
            }
            Value::Str(s) => {
                buf.put_u8(TAG_STR);
                put_str(buf, s);
            }
            Value::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            Value::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            Value::Map(entries) => {
                buf.put_u8(TAG_MAP);
                buf.put_u32_le(entries.len() as u32);
                // BTreeMap iteration is key-ordered, which makes the
                // encoding canonical.
                for (key, value) in entries {
                    put_str(buf, key);
                    value.encode(buf);
                }
            }
        }
    }

    /// Encodes this value into a fresh byte vector.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decodes a single value from `buf`, consuming exactly its bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Value, ProtoError> {
        let tag = get_u8(buf)?;
        match tag {
            TAG_BOOL => Ok(Value::Bool(get_u8(buf)? != 0)),
            TAG_INT => {
                need(buf, 8)?;
                Ok(Value::Int(buf.get_i64_le()))
            }
            TAG_UINT => {
                need(buf, 8)?;
                Ok(Value::Uint(buf.get_u64_le()))
            }
            TAG_FLOAT => {
                need(buf, 8)?;
                Ok(Value::Float(buf.get_f64_le()))
            }
            TAG_STR => Ok(Value::Str(get_str(buf)?)),
            TAG_BYTES => {
                let len = get_len(buf)?;
                need(buf, len)?;
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                Ok(Value::Bytes(raw))
            }
            TAG_LIST => {
                let count = get_len(buf)?;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(Value::decode(buf)?);
                }
                Ok(Value::List(items))
            }
            TAG_MAP => {
                let count = get_len(buf)?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = get_str(buf)?;
                    let value = Value::decode(buf)?;
                    entries.insert(key, value);
                }
                Ok(Value::Map(entries))
            }
            other => Err(ProtoError::UnknownValueTag(other)),
        }
    }

    /// Decodes a value from a standalone byte slice.
    pub fn decode_from_slice(mut raw: &[u8]) -> Result<Value, ProtoError> {
        Value::decode(&mut raw)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

pub(crate) fn put_str(buf: &mut impl BufMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_str(buf: &mut impl Buf) -> Result<String, ProtoError> {
    let len = get_len(buf)?;
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| ProtoError::InvalidUtf8)
}

pub(crate) fn get_u8(buf: &mut impl Buf) -> Result<u8, ProtoError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_len(buf: &mut impl Buf) -> Result<usize, ProtoError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le() as usize)
}

pub(crate) fn need(buf: &impl Buf, n: usize) -> Result<(), ProtoError> {
    if buf.remaining() < n {
        Err(ProtoError::Truncated {
            needed: n,
            have: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let raw = v.encode_to_vec();
        Value::decode_from_slice(&raw).expect("decode")
    }

    #[test]
    fn scalar_roundtrips() {
        for v in [
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MIN),
            Value::Uint(u64::MAX),
            Value::Float(3.25),
            Value::Str("hello".into()),
            Value::Str(String::new()),
            Value::Bytes(vec![0, 255, 7]),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn nested_tree_roundtrips() {
        let mut bag = BTreeMap::new();
        bag.insert("gold".to_string(), Value::Int(5));
        bag.insert(
            "items".to_string(),
            Value::List(vec![Value::Str("sword".into()), Value::Str("shield".into())]),
        );
        let mut root = BTreeMap::new();
        root.insert("hp".to_string(), Value::Int(10));
        root.insert("bag".to_string(), Value::Map(bag));
        let tree = Value::Map(root);
        assert_eq!(roundtrip(&tree), tree);
    }

    #[test]
    fn reserialization_is_byte_equal() {
        let mut inner = BTreeMap::new();
        inner.insert("z".to_string(), Value::Uint(1));
        inner.insert("a".to_string(), Value::Float(-0.5));
        let mut root = BTreeMap::new();
        root.insert("nested".to_string(), Value::Map(inner));
        root.insert("list".to_string(), Value::List(vec![Value::Bool(false)]));
        let tree = Value::Map(root);

        let first = tree.encode_to_vec();
        let decoded = Value::decode_from_slice(&first).expect("decode");
        let second = decoded.encode_to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let raw = Value::Str("truncate me".into()).encode_to_vec();
        let err = Value::decode_from_slice(&raw[..raw.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { .. }));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err = Value::decode_from_slice(&[0x7f]).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownValueTag(0x7f)));
    }
}
