// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the rendezvous group, the bootstrap entries and the registry.

use crate::store::StoreError;

/// Crate result alias.
pub type Result<T, E = MemFabricError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MemFabricError {
    /// Malformed arguments, rejected before any store RPC is issued.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The store RPC itself failed.
    #[error("store {op} on key {key} failed: {source}")]
    Store {
        op: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// A bounded wait did not observe the expected condition in time.
    #[error("timed out during {op} on key {key}")]
    Timeout { op: &'static str, key: String },

    /// The membership CAS loop ran out of retries while another publisher held the key.
    #[error("key {key} stayed held by {holder:?} for the whole retry budget")]
    Contention { key: String, holder: String },

    #[error("rank has not joined the group")]
    NotJoined,

    #[error("entry is not initialized")]
    NotInitialized,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("entry with id {0} already exists")]
    DuplicateEntry(u32),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// The gathered buffer length disagrees with `rank_size * chunk`.
    #[error("all-gather produced {actual} bytes, expected {expected}")]
    GatherMismatch { expected: usize, actual: usize },

    #[error("failed to start membership watcher: {0}")]
    WatcherSpawn(#[source] std::io::Error),

    /// The memory engine rejected an operation.
    #[error("memory engine failed during {op}: {source:#}")]
    Engine {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl MemFabricError {
    /// Classify a store failure: store-side timeouts become [`MemFabricError::Timeout`],
    /// everything else is a [`MemFabricError::Store`] error.
    pub(crate) fn from_store(op: &'static str, key: &str, source: StoreError) -> Self {
        match source {
            StoreError::Timeout(_) => MemFabricError::Timeout {
                op,
                key: key.to_string(),
            },
            source => MemFabricError::Store {
                op,
                key: key.to_string(),
                source,
            },
        }
    }

    pub(crate) fn engine(op: &'static str, source: anyhow::Error) -> Self {
        MemFabricError::Engine { op, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MemFabricError::Timeout { .. })
    }
}
