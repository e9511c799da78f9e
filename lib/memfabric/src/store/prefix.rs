// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::{ConfigStore, StoreError, WatchCallback, WatchId};

/// Decorator that confines every key to a namespace.
///
/// Prefixes compose: wrapping a `PrefixStore` in another one yields the
/// concatenation of both prefixes on the wire.
#[derive(Clone)]
pub struct PrefixStore {
    inner: Arc<dyn ConfigStore>,
    prefix: String,
}

impl PrefixStore {
    pub fn new(inner: Arc<dyn ConfigStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl std::fmt::Debug for PrefixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixStore")
            .field("prefix", &self.full_key(""))
            .finish()
    }
}

impl ConfigStore for PrefixStore {
    fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, StoreError> {
        self.inner.get(&self.key(key), timeout)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.set(&self.key(key), value)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.add(&self.key(key), delta)
    }

    fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.inner.append(&self.key(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(&self.key(key))
    }

    fn cas(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<Bytes, StoreError> {
        self.inner.cas(&self.key(key), expected, value)
    }

    fn watch(&self, key: &str, notify: WatchCallback) -> Result<WatchId, StoreError> {
        self.inner.watch(&self.key(key), notify)
    }

    fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        self.inner.unwatch(id)
    }

    fn full_key(&self, key: &str) -> String {
        self.inner.full_key(&self.key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_prefixes_compose() {
        let base: Arc<dyn ConfigStore> = Arc::new(InMemoryStore::new());
        let entry: Arc<dyn ConfigStore> = Arc::new(PrefixStore::new(base.clone(), "SHM_(3)_"));
        let group = PrefixStore::new(entry, "S_");

        group.set("EXIT", b"0").unwrap();
        assert_eq!(group.full_key("EXIT"), "SHM_(3)_S_EXIT");
        assert_eq!(
            base.get("SHM_(3)_S_EXIT", Duration::ZERO).unwrap(),
            Bytes::from_static(b"0")
        );
        assert!(matches!(
            base.get("EXIT", Duration::ZERO),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let base: Arc<dyn ConfigStore> = Arc::new(InMemoryStore::new());
        let a = PrefixStore::new(base.clone(), "A_");
        let b = PrefixStore::new(base, "B_");

        assert_eq!(a.add("DSIZE", 5).unwrap(), 5);
        assert_eq!(b.add("DSIZE", 0).unwrap(), 0);
    }
}
