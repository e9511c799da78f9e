// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key-value store contract consumed by the rendezvous layer.
//!
//! The store is the only channel ranks share. Every operation is blocking and
//! assumed linearizable per key; the transport that reaches a remote store lives
//! outside this crate and plugs in by implementing [`ConfigStore`].

mod memory;
mod prefix;

pub use memory::InMemoryStore;
pub use prefix::PrefixStore;

use std::time::Duration;

use bytes::Bytes;

/// Identifier of a pending watch, used to cancel it.
pub type WatchId = u64;

/// Fired at most once with the value that satisfied the watch.
pub type WatchCallback = Box<dyn FnOnce(Result<Bytes, StoreError>) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("timed out waiting for key: {0}")]
    Timeout(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("value of key {0} is not an integer")]
    NotAnInteger(String),

    #[error("watch {0} is not registered")]
    UnknownWatch(WatchId),

    #[error("store is unavailable: {0}")]
    Unavailable(String),

    #[error("store is closed")]
    Closed,
}

/// Namespaced key-value client.
pub trait ConfigStore: Send + Sync {
    /// Read `key`, waiting up to `timeout` for it to appear. A zero timeout does not wait.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when the key is absent and `timeout` is zero,
    /// [`StoreError::Timeout`] when it did not appear in time.
    fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, StoreError>;

    /// Unconditional overwrite.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Atomic integer increment returning the value after `delta` is applied.
    ///
    /// Absent keys start at 0, so `add(key, 0)` is an atomic read.
    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Atomically concatenate `value` and return the resulting length.
    fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError>;

    /// Delete `key`. Removing an absent key succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Compare-and-swap returning the value observed immediately before the attempt.
    ///
    /// The swap happened iff the returned value equals `expected`. An absent key
    /// compares equal to an empty `expected`.
    fn cas(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<Bytes, StoreError>;

    /// Register a fire-once callback for the next time `key` holds a non-empty value.
    ///
    /// If the key is already non-empty the callback fires right away.
    fn watch(&self, key: &str, notify: WatchCallback) -> Result<WatchId, StoreError>;

    /// Cancel a pending watch.
    fn unwatch(&self, id: WatchId) -> Result<(), StoreError>;

    /// Fully qualified key as the backing store sees it.
    fn full_key(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Parse a decimal integer value as written by [`ConfigStore::add`].
pub fn parse_integer(key: &str, value: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::positive(b"42", Some(42))]
    #[case::negative(b"-7", Some(-7))]
    #[case::padded(b" 12 ", Some(12))]
    #[case::text(b"ok", None)]
    #[case::empty(b"", None)]
    fn test_parse_integer(#[case] raw: &[u8], #[case] expected: Option<i64>) {
        assert_eq!(parse_integer("k", raw).ok(), expected);
    }
}
