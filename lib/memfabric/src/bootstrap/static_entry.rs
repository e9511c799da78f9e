// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use super::{run_steps, BootstrapEntry, EngineResources, EntryContext, EntryRequest, InitStep};
use crate::engine::{EntityOptions, ReachTypes};
use crate::error::{MemFabricError, Result};
use crate::group::{CollectiveOps, GroupOptions, RendezvousGroup, MAX_GATHER_PAYLOAD};

/// Symmetric window over a group whose size is fixed at creation.
///
/// Every rank runs all six [`InitStep`]s during [`BootstrapEntry::bootstrap`];
/// the entry only exists once the window is mapped.
pub struct StaticEntry {
    id: u32,
    group: RendezvousGroup,
    resources: EngineResources,
    base_address: u64,
}

impl StaticEntry {
    pub fn rank(&self) -> u32 {
        self.group.rank()
    }

    pub fn rank_size(&self) -> u32 {
        self.group.rank_size()
    }

    /// Start of the window shared by every rank.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Start of this rank's slice inside the window.
    pub fn local_address(&self) -> u64 {
        let options = self.resources.options();
        self.base_address + options.size_per_rank * options.rank as u64
    }

    /// Start of `peer`'s slice inside the window.
    ///
    /// # Errors
    /// [`MemFabricError::InvalidParam`] when `peer` is not a rank of the group.
    pub fn peer_address(&self, peer: u32) -> Result<u64> {
        if peer >= self.rank_size() {
            return Err(MemFabricError::InvalidParam(format!(
                "rank {peer} is out of range for size {}",
                self.rank_size()
            )));
        }
        Ok(self.base_address + self.size_per_rank() * peer as u64)
    }

    /// Bytes each rank contributes to the window.
    pub fn size_per_rank(&self) -> u64 {
        self.resources.options().size_per_rank
    }

    pub fn is_initialized(&self) -> bool {
        true
    }

    /// Control-plane group, for barriers and all-gathers between the entry's ranks.
    pub fn group(&self) -> &RendezvousGroup {
        &self.group
    }

    /// Hand engine-specific context to the local entity.
    ///
    /// # Errors
    /// [`MemFabricError::InvalidParam`] unless `context` is 1..=65536 bytes.
    pub fn set_extra_context(&self, context: &[u8]) -> Result<()> {
        if context.is_empty() || context.len() > MAX_GATHER_PAYLOAD {
            return Err(MemFabricError::InvalidParam(format!(
                "extra context of {} bytes is outside 1..={MAX_GATHER_PAYLOAD}",
                context.len()
            )));
        }
        self.resources
            .engine()
            .set_extra_context(self.resources.entity()?, context)
            .map_err(|e| MemFabricError::engine("set_extra_context", e))
    }

    /// How `remote_rank` can be reached from this rank.
    pub fn reach_types(&self, remote_rank: u32) -> Result<ReachTypes> {
        if remote_rank >= self.rank_size() {
            return Err(MemFabricError::InvalidParam(format!(
                "rank {remote_rank} is out of range for size {}",
                self.rank_size()
            )));
        }
        self.resources
            .engine()
            .reach_types(self.resources.entity()?, remote_rank)
            .map_err(|e| MemFabricError::engine("reach_types", e))
    }
}

impl BootstrapEntry for StaticEntry {
    const NAMESPACE: &'static str = "SHM_";

    fn bootstrap(request: &EntryRequest, context: EntryContext) -> Result<Self> {
        let start = Instant::now();
        let options = GroupOptions::builder()
            .rank(request.rank)
            .rank_size(request.rank_size)
            .timeout(context.timeout)
            .build()?;
        let group = RendezvousGroup::create(context.store.clone(), options)?;
        let (resources, base_address) = Self::initialize(request, &context, &group)?;

        tracing::info!(
            id = request.id,
            rank = request.rank,
            rank_size = request.rank_size,
            generation = group.generation(),
            size_per_rank = request.size_per_rank,
            base_address = %format!("{base_address:#x}"),
            elapsed_us = start.elapsed().as_micros() as u64,
            "static entry ready"
        );
        Ok(Self {
            id: request.id,
            group,
            resources,
            base_address,
        })
    }

    fn id(&self) -> u32 {
        self.id
    }
}

impl StaticEntry {
    fn initialize(
        request: &EntryRequest,
        context: &EntryContext,
        group: &RendezvousGroup,
    ) -> Result<(EngineResources, u64)> {
        group.rendezvous()?;

        let mut resources = EngineResources::new(
            context.engine.clone(),
            EntityOptions {
                entity_id: request.id << 1,
                rank: request.rank,
                rank_count: request.rank_size,
                size_per_rank: request.size_per_rank,
                device_id: context.device_id,
            },
        );
        run_steps(&mut resources, group, &InitStep::ALL)?;
        let base_address = resources.base_address()?;
        Ok((resources, base_address))
    }
}

impl std::fmt::Debug for StaticEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticEntry")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .finish()
    }
}

impl Drop for StaticEntry {
    fn drop(&mut self) {
        // store keys stay: a peer may still be between its arrival and its wait
        tracing::debug!(id = self.id, rank = self.rank(), "releasing static entry");
    }
}
