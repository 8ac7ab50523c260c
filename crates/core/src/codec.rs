//! Key and value encoding
//!
//! Stores are generic over their in-memory key and value types but log,
//! checkpoint and compare them as bytes. `bincode` is the byte format.

use crate::error::StateResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound for store keys: totally ordered, hashable, serializable
pub trait StoreKey:
    Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreKey for T where
    T: Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bound for store values
pub trait StoreValue: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Encode a key or value to bytes
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StateResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode bytes produced by [`encode`]
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    Ok(bincode::deserialize(bytes)?)
}
