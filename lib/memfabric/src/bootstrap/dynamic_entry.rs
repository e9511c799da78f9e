// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use super::{run_steps, BootstrapEntry, EngineResources, EntryContext, EntryRequest, InitStep};
use crate::engine::EntityOptions;
use crate::error::{MemFabricError, Result};
use crate::group::{CollectiveOps, GroupOptions, RendezvousGroup};

/// Symmetric window over a group that ranks join and leave over time.
///
/// The local entity, reservation and slice are set up once at creation. Each
/// membership change re-runs the descriptor exchange and mapping against the
/// current group size, on the joining rank and on every existing member.
pub struct DynamicEntry {
    id: u32,
    // dropped before `window` so the watcher is gone before the engine objects are released
    group: RendezvousGroup,
    window: Arc<DynamicWindow>,
}

struct DynamicWindow {
    rank: u32,
    resources: Mutex<EngineResources>,
    mapped: AtomicBool,
}

impl DynamicWindow {
    fn on_join(window: &Weak<DynamicWindow>, group: &dyn CollectiveOps, joined: u32) -> Result<()> {
        match window.upgrade() {
            Some(window) => window.exchange_round(group, joined),
            None => Err(MemFabricError::NotInitialized),
        }
    }

    fn on_leave(window: &Weak<DynamicWindow>, group: &dyn CollectiveOps, left: u32) -> Result<()> {
        match window.upgrade() {
            Some(window) => window.forget_rank(group, left),
            None => Err(MemFabricError::NotInitialized),
        }
    }

    /// Barrier, exchange descriptors for the current membership, map, barrier.
    fn exchange_round(&self, group: &dyn CollectiveOps, joined: u32) -> Result<()> {
        let start = Instant::now();
        let mut resources = self.resources.lock();
        resources.entity()?;

        group.barrier()?;
        for step in InitStep::EXCHANGE {
            resources.forward(step, group)?;
        }
        group.barrier()?;
        self.mapped.store(true, Ordering::SeqCst);

        tracing::info!(
            rank = self.rank,
            joined,
            rank_size = group.rank_size(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "dynamic window remapped"
        );
        Ok(())
    }

    /// Drop whatever was imported from `left`. Purely local.
    fn forget_rank(&self, group: &dyn CollectiveOps, left: u32) -> Result<()> {
        let resources = self.resources.lock();
        let entity = resources.entity()?;
        resources
            .engine()
            .remove_imported(entity, left)
            .map_err(|e| MemFabricError::engine("remove_imported", e))?;
        if left == self.rank {
            self.mapped.store(false, Ordering::SeqCst);
        }
        tracing::debug!(
            rank = self.rank,
            left,
            rank_size = group.rank_size(),
            "dropped imported descriptors"
        );
        Ok(())
    }
}

impl DynamicEntry {
    pub fn rank(&self) -> u32 {
        self.window.rank
    }

    /// Current size of the group as last observed by this rank.
    pub fn rank_size(&self) -> u32 {
        self.group.rank_size()
    }

    pub fn group(&self) -> &RendezvousGroup {
        &self.group
    }

    /// Whether the window is mapped for the current membership.
    pub fn is_initialized(&self) -> bool {
        self.window.mapped.load(Ordering::SeqCst)
    }

    /// Start of the window shared by every rank.
    pub fn base_address(&self) -> Result<u64> {
        self.window.resources.lock().base_address()
    }

    /// Address of this rank's slice, valid once the rank has joined.
    pub fn local_address(&self) -> Result<u64> {
        if !self.is_initialized() {
            return Err(MemFabricError::NotInitialized);
        }
        let resources = self.window.resources.lock();
        let options = resources.options();
        Ok(resources.base_address()? + options.size_per_rank * options.rank as u64)
    }

    /// Start of `peer`'s slice. Any rank below the entry's maximum size has a slot.
    ///
    /// # Errors
    /// [`MemFabricError::InvalidParam`] when `peer` is outside the window.
    pub fn peer_address(&self, peer: u32) -> Result<u64> {
        let resources = self.window.resources.lock();
        let options = resources.options();
        if peer >= options.rank_count {
            return Err(MemFabricError::InvalidParam(format!(
                "rank {peer} is out of range for maximum size {}",
                options.rank_count
            )));
        }
        Ok(resources.base_address()? + options.size_per_rank * peer as u64)
    }

    /// Bytes each rank contributes to the window.
    pub fn size_per_rank(&self) -> u64 {
        self.window.resources.lock().options().size_per_rank
    }

    /// Join the group and map every member's slice.
    ///
    /// # Returns
    /// The local address of this rank's slice.
    pub fn join(&self) -> Result<u64> {
        self.group.join()?;
        self.local_address()
    }

    pub fn leave(&self) -> Result<()> {
        self.group.leave()
    }
}

impl BootstrapEntry for DynamicEntry {
    const NAMESPACE: &'static str = "SMEM_BM_";

    fn bootstrap(request: &EntryRequest, context: EntryContext) -> Result<Self> {
        let start = Instant::now();
        let resources = EngineResources::new(
            context.engine.clone(),
            EntityOptions {
                entity_id: (request.id << 1) | 1,
                rank: request.rank,
                rank_count: request.rank_size,
                size_per_rank: request.size_per_rank,
                device_id: context.device_id,
            },
        );
        let window = Arc::new(DynamicWindow {
            rank: request.rank,
            resources: Mutex::new(resources),
            mapped: AtomicBool::new(false),
        });

        let on_join = Arc::downgrade(&window);
        let on_leave = Arc::downgrade(&window);
        let options = GroupOptions::builder()
            .rank(request.rank)
            .timeout(context.timeout)
            .dynamic(true)
            .join_callback(move |group, joined| DynamicWindow::on_join(&on_join, group, joined))
            .leave_callback(move |group, left| DynamicWindow::on_leave(&on_leave, group, left))
            .build()?;
        let group = RendezvousGroup::create(context.store.clone(), options)?;
        group.barrier()?;
        run_steps(&mut window.resources.lock(), &group, &InitStep::LOCAL)?;

        tracing::info!(
            id = request.id,
            rank = request.rank,
            max_rank_size = request.rank_size,
            size_per_rank = request.size_per_rank,
            elapsed_us = start.elapsed().as_micros() as u64,
            "dynamic entry created"
        );

        Ok(Self {
            id: request.id,
            group,
            window,
        })
    }

    fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for DynamicEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicEntry")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("mapped", &self.is_initialized())
            .finish()
    }
}

impl Drop for DynamicEntry {
    fn drop(&mut self) {
        // store keys stay: a peer may still be between its arrival and its wait
        tracing::debug!(id = self.id, rank = self.window.rank, "releasing dynamic entry");
    }
}
