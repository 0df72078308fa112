//! The key index.
//!
//! The store keeps an explicit, ordered list of the keys it has written. In
//! safe mode the index, not the engine, decides which keys exist. The index is
//! held in memory for the life of a handle and written back under
//! [`KEYS_RECORD`] only on flush and close.
//!
//! Keys are kept in insertion order. Setting a key twice appends a second
//! occurrence; removing a key drops the first occurrence.

use std::collections::HashMap;

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::value::Value;

/// Reserved engine key holding the persisted index.
pub const KEYS_RECORD: &[u8] = b"__keys__";

/// An ordered multiset of keys.
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    keys: Vec<Value>,
    /// Occurrence count per key fingerprint.
    counts: HashMap<Vec<u8>, usize>,
}

impl KeyIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from keys in order.
    pub fn from_keys(keys: Vec<Value>) -> Self {
        let mut counts = HashMap::with_capacity(keys.len());
        for key in &keys {
            *counts.entry(fingerprint(key)).or_insert(0) += 1;
        }
        Self { keys, counts }
    }

    /// Returns true if at least one occurrence of `key` is present.
    pub fn contains(&self, key: &Value) -> bool {
        self.counts.contains_key(&fingerprint(key))
    }

    /// Appends `key`, even if it is already present.
    pub fn append(&mut self, key: Value) {
        *self.counts.entry(fingerprint(&key)).or_insert(0) += 1;
        self.keys.push(key);
    }

    /// Removes the first occurrence of `key`.
    ///
    /// # Errors
    ///
    /// Returns a not found error if `key` is absent.
    pub fn remove_first(&mut self, key: &Value) -> Result<()> {
        let fp = fingerprint(key);
        let count = self
            .counts
            .get_mut(&fp)
            .ok_or_else(|| Error::not_found(format!("{:?}", key)))?;
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&fp);
        }

        match self.keys.iter().position(|k| fingerprint(k) == fp) {
            Some(pos) => {
                self.keys.remove(pos);
                Ok(())
            }
            None => Err(Error::corruption("key index counts out of sync with key list")),
        }
    }

    /// The keys in order, duplicates included.
    pub fn snapshot(&self) -> &[Value] {
        &self.keys
    }

    /// Number of occurrences, duplicates included.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the index holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encodes the index for [`KEYS_RECORD`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.keys)?)
    }

    /// Decodes a [`KEYS_RECORD`] payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let keys: Vec<Value> = bincode::deserialize(data)?;
        Ok(Self::from_keys(keys))
    }
}

/// Canonical byte form of a key. Two keys are the same index entry iff their
/// fingerprints match; floats compare by bit pattern.
fn fingerprint(key: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_fingerprint(key, &mut out);
    out
}

fn write_fingerprint(key: &Value, out: &mut Vec<u8>) {
    match key {
        Value::Null => out.put_u8(0),
        Value::Bool(b) => {
            out.put_u8(1);
            out.put_u8(*b as u8);
        }
        Value::Int(i) => {
            out.put_u8(2);
            out.put_i64_le(*i);
        }
        Value::Float(f) => {
            out.put_u8(3);
            out.put_u64_le(f.to_bits());
        }
        Value::Str(s) => {
            out.put_u8(4);
            out.put_u64_le(s.len() as u64);
            out.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.put_u8(5);
            out.put_u64_le(b.len() as u64);
            out.put_slice(b);
        }
        Value::List(items) => {
            out.put_u8(6);
            out.put_u64_le(items.len() as u64);
            for item in items {
                write_fingerprint(item, out);
            }
        }
        Value::Array(xs) => {
            out.put_u8(7);
            out.put_u64_le(xs.len() as u64);
            for x in xs {
                out.put_u64_le(x.to_bits());
            }
        }
    }
}
