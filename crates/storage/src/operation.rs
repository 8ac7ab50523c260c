//! Store operations as they travel through the log
//!
//! A store transaction logs one payload: the bincode encoding of its
//! operations in key order. The same payload drives primary apply,
//! recovery replay and secondary apply.

use replistate_core::{codec, StateResult};
use serde::{Deserialize, Serialize};

/// Kind of a committed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Key did not exist before
    Add,
    /// Key existed and got a new value
    Update,
    /// Key existed and was removed
    Remove,
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOperation<K, V> {
    /// What happened to the key
    pub kind: ChangeKind,
    /// The key
    pub key: K,
    /// New value; `None` for removes
    pub value: Option<V>,
}

impl<K, V> StoreOperation<K, V> {
    /// Insert of a new key
    pub fn add(key: K, value: V) -> Self {
        StoreOperation {
            kind: ChangeKind::Add,
            key,
            value: Some(value),
        }
    }

    /// Replacement of an existing key's value
    pub fn update(key: K, value: V) -> Self {
        StoreOperation {
            kind: ChangeKind::Update,
            key,
            value: Some(value),
        }
    }

    /// Removal of an existing key
    pub fn remove(key: K) -> Self {
        StoreOperation {
            kind: ChangeKind::Remove,
            key,
            value: None,
        }
    }
}

/// Encode a transaction's operations as one log payload
pub fn encode_operations<K: Serialize, V: Serialize>(
    operations: &[StoreOperation<K, V>],
) -> StateResult<Vec<u8>> {
    codec::encode(operations)
}

/// Decode a log payload written by [`encode_operations`]
pub fn decode_operations<K, V>(payload: &[u8]) -> StateResult<Vec<StoreOperation<K, V>>>
where
    K: serde::de::DeserializeOwned,
    V: serde::de::DeserializeOwned,
{
    codec::decode(payload)
}
