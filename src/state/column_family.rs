//! Typed view over one column family.

use super::{Family, StateError, StateRead, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::marker::PhantomData;

/// Keys with an order-preserving byte encoding
pub trait DbKey: Sized + Display {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Option<Self>;
}

impl DbKey for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl DbKey for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

/// Values are stored as JSON
pub struct TypedColumnFamily<K, V> {
    family: Family,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> TypedColumnFamily<K, V>
where
    K: DbKey,
    V: Serialize + DeserializeOwned,
{
    pub const fn new(family: Family) -> Self {
        Self {
            family,
            _marker: PhantomData,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn get(&self, reader: &impl StateRead, key: &K) -> Result<Option<V>, StateError> {
        reader
            .read(self.family, &key.encode())?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StateError::from))
            .transpose()
    }

    pub fn exists(&self, reader: &impl StateRead, key: &K) -> Result<bool, StateError> {
        Ok(reader.read(self.family, &key.encode())?.is_some())
    }

    /// Insert or overwrite
    pub fn put(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<(), StateError> {
        txn.put(self.family, key.encode(), serde_json::to_vec(value)?);
        Ok(())
    }

    /// Fails if the key is already present
    pub fn insert(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<(), StateError> {
        if self.exists(txn, key)? {
            return Err(StateError::KeyExists {
                family: self.family.name(),
                key: key.to_string(),
            });
        }
        self.put(txn, key, value)
    }

    /// Fails if the key is absent
    pub fn update(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<(), StateError> {
        if !self.exists(txn, key)? {
            return Err(StateError::KeyMissing {
                family: self.family.name(),
                key: key.to_string(),
            });
        }
        self.put(txn, key, value)
    }

    pub fn delete(&self, txn: &mut Transaction, key: &K) {
        txn.delete(self.family, key.encode());
    }

    pub fn entries(&self, reader: &impl StateRead) -> Result<Vec<(K, V)>, StateError> {
        let mut entries = Vec::new();
        self.for_each(reader, |key, value| {
            entries.push((key, value));
            true
        })?;
        Ok(entries)
    }

    /// Visit pairs in key order until `visitor` returns false
    pub fn for_each<F>(&self, reader: &impl StateRead, mut visitor: F) -> Result<(), StateError>
    where
        F: FnMut(K, V) -> bool,
    {
        for (key, value) in reader.scan(self.family)? {
            let key = K::decode(&key).ok_or(StateError::InvalidKey {
                family: self.family.name(),
            })?;
            let value = serde_json::from_slice(&value)?;
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }
}
