// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous, membership and symmetric-memory bootstrap over a shared key-value store.
//!
//! * [`group`]: barrier, all-gather and dynamic join/leave for a set of ranks,
//!   driven only by atomic store primitives
//! * [`bootstrap`]: staged creation of a symmetric window on a [`engine::MemoryEngine`],
//!   rolled back step by step on failure
//! * [`registry`]: process-wide table of live entries keyed by id and handle

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod logging;
pub mod registry;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bootstrap::{BootstrapEntry, DynamicEntry, EntryRequest, InitStep, StaticEntry};
pub use config::{ConfigError, MemFabricConfig};
pub use engine::{ExchangeDescriptor, MemoryEngine};
pub use error::{MemFabricError, Result};
pub use group::{CollectiveOps, GroupOptions, RendezvousGroup};
pub use registry::{DynamicRegistry, EntryHandle, EntryRegistry, StaticRegistry};
pub use store::{ConfigStore, InMemoryStore, PrefixStore, StoreError};
