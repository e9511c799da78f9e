// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Table of live bootstrap entries.
//!
//! A registry is created once per process with the store, the engine and the
//! configuration, and passed to whoever creates or looks up entries. Each id
//! maps to at most one entry; entries are shared as `Arc`s and torn down when
//! the registry's reference and every caller's reference are gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bootstrap::{BootstrapEntry, DynamicEntry, EntryContext, EntryRequest, StaticEntry};
use crate::config::MemFabricConfig;
use crate::engine::MemoryEngine;
use crate::error::{MemFabricError, Result};
use crate::store::{ConfigStore, PrefixStore};

pub type StaticRegistry = EntryRegistry<StaticEntry>;
pub type DynamicRegistry = EntryRegistry<DynamicEntry>;

/// Opaque handle of a registered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle(u64);

impl EntryHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

enum Slot<E> {
    /// Bootstrap in progress; the id is taken.
    Pending,
    Ready { handle: EntryHandle, entry: Arc<E> },
}

struct Tables<E> {
    by_id: HashMap<u32, Slot<E>>,
    by_handle: HashMap<EntryHandle, u32>,
}

pub struct EntryRegistry<E: BootstrapEntry> {
    store: Arc<dyn ConfigStore>,
    engine: Arc<dyn MemoryEngine>,
    config: MemFabricConfig,
    tables: Mutex<Tables<E>>,
    next_handle: AtomicU64,
}

impl<E: BootstrapEntry> EntryRegistry<E> {
    /// # Errors
    /// [`MemFabricError::InvalidParam`] when `config` fails validation.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        engine: Arc<dyn MemoryEngine>,
        config: MemFabricConfig,
    ) -> Result<Self> {
        config
            .check()
            .map_err(|e| MemFabricError::InvalidParam(e.to_string()))?;
        Ok(Self {
            store,
            engine,
            config,
            tables: Mutex::new(Tables {
                by_id: HashMap::new(),
                by_handle: HashMap::new(),
            }),
            next_handle: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &MemFabricConfig {
        &self.config
    }

    /// Create and bootstrap the entry for `request.id`.
    ///
    /// The id is reserved before bootstrapping starts, so a concurrent create of
    /// the same id fails fast instead of racing. Bootstrapping itself runs
    /// without the registry lock held.
    ///
    /// # Errors
    /// * [`MemFabricError::InvalidParam`] for out-of-range arguments
    /// * [`MemFabricError::DuplicateEntry`] when the id is taken
    /// * any bootstrap failure, after its rollback
    pub fn create(&self, request: EntryRequest) -> Result<(EntryHandle, Arc<E>)> {
        self.validate(&request)?;

        {
            let mut tables = self.tables.lock();
            if tables.by_id.contains_key(&request.id) {
                return Err(MemFabricError::DuplicateEntry(request.id));
            }
            tables.by_id.insert(request.id, Slot::Pending);
        }

        let context = EntryContext {
            store: Arc::new(PrefixStore::new(
                self.store.clone(),
                format!("{}({})_", E::NAMESPACE, request.id),
            )),
            engine: self.engine.clone(),
            timeout: self.config.control_operation_timeout(),
            device_id: self.config.device_id,
        };

        match E::bootstrap(&request, context) {
            Ok(entry) => {
                let entry = Arc::new(entry);
                let handle = EntryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
                let mut tables = self.tables.lock();
                tables.by_id.insert(
                    request.id,
                    Slot::Ready {
                        handle,
                        entry: entry.clone(),
                    },
                );
                tables.by_handle.insert(handle, request.id);
                tracing::info!(id = request.id, handle = handle.0, "entry registered");
                Ok((handle, entry))
            }
            Err(err) => {
                tracing::error!(id = request.id, error = %err, "entry bootstrap failed");
                self.tables.lock().by_id.remove(&request.id);
                Err(err)
            }
        }
    }

    pub fn get_by_id(&self, id: u32) -> Option<Arc<E>> {
        match self.tables.lock().by_id.get(&id) {
            Some(Slot::Ready { entry, .. }) => Some(entry.clone()),
            _ => None,
        }
    }

    pub fn get_by_handle(&self, handle: EntryHandle) -> Option<Arc<E>> {
        let tables = self.tables.lock();
        let id = tables.by_handle.get(&handle)?;
        match tables.by_id.get(id) {
            Some(Slot::Ready { entry, .. }) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Drop the registry's reference to the entry with `id`.
    ///
    /// # Errors
    /// [`MemFabricError::EntryNotFound`] if no ready entry has that id.
    pub fn remove_by_id(&self, id: u32) -> Result<()> {
        let removed = {
            let mut tables = self.tables.lock();
            match tables.by_id.remove(&id) {
                Some(Slot::Ready { handle, entry }) => {
                    tables.by_handle.remove(&handle);
                    entry
                }
                Some(Slot::Pending) => {
                    tables.by_id.insert(id, Slot::Pending);
                    return Err(MemFabricError::EntryNotFound(format!(
                        "id {id} is still bootstrapping"
                    )));
                }
                None => return Err(MemFabricError::EntryNotFound(format!("id {id}"))),
            }
        };
        tracing::info!(id, "entry removed");
        // the entry may be torn down here; the lock is already released
        drop(removed);
        Ok(())
    }

    pub fn remove_by_handle(&self, handle: EntryHandle) -> Result<()> {
        let id = self
            .tables
            .lock()
            .by_handle
            .get(&handle)
            .copied()
            .ok_or_else(|| MemFabricError::EntryNotFound(format!("handle {}", handle.0)))?;
        self.remove_by_id(id)
    }

    /// Ids of ready entries, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let tables = self.tables.lock();
        let mut ids: Vec<u32> = tables
            .by_id
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready { .. }))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, request: &EntryRequest) -> Result<()> {
        let config = &self.config;
        if request.rank_size == 0 || request.rank_size > config.max_world_size {
            return Err(MemFabricError::InvalidParam(format!(
                "rank size {} is outside 1..={}",
                request.rank_size, config.max_world_size
            )));
        }
        if request.rank >= request.rank_size {
            return Err(MemFabricError::InvalidParam(format!(
                "rank {} is out of range for size {}",
                request.rank, request.rank_size
            )));
        }
        if request.id > config.max_entry_id {
            return Err(MemFabricError::InvalidParam(format!(
                "id {} exceeds {}",
                request.id, config.max_entry_id
            )));
        }
        if request.size_per_rank == 0 || request.size_per_rank > config.max_local_size {
            return Err(MemFabricError::InvalidParam(format!(
                "local size {} is outside 1..={}",
                request.size_per_rank, config.max_local_size
            )));
        }
        Ok(())
    }
}

impl<E: BootstrapEntry> Drop for EntryRegistry<E> {
    fn drop(&mut self) {
        let tables = self.tables.get_mut();
        if !tables.by_handle.is_empty() {
            tracing::debug!(entries = tables.by_handle.len(), "dropping registry with live entries");
        }
        tables.by_handle.clear();
        tables.by_id.clear();
    }
}
