// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Staged bootstrap of a symmetric memory window.
//!
//! An entry forms its rendezvous group, then drives the memory engine through
//! [`InitStep`]s in order. When a step fails, the steps that already completed
//! are undone in reverse order before the error is returned.

mod dynamic_entry;
mod static_entry;

#[cfg(test)]
mod tests;

pub use dynamic_entry::DynamicEntry;
pub use static_entry::StaticEntry;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{
    EntityHandle, EntityOptions, ExchangeDescriptor, MemoryEngine, SliceHandle,
    DESCRIPTOR_FRAME_LEN,
};
use crate::error::{MemFabricError, Result};
use crate::group::CollectiveOps;
use crate::store::ConfigStore;

/// Ordered initialization steps. Forming the group precedes all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStep {
    CreateEntity,
    ReserveAddressSpace,
    AllocateSlice,
    ExchangeSlice,
    ExchangeEntity,
    Map,
}

impl InitStep {
    pub const ALL: [InitStep; 6] = [
        InitStep::CreateEntity,
        InitStep::ReserveAddressSpace,
        InitStep::AllocateSlice,
        InitStep::ExchangeSlice,
        InitStep::ExchangeEntity,
        InitStep::Map,
    ];

    /// Steps run once when an entry is created.
    pub const LOCAL: [InitStep; 3] = [
        InitStep::CreateEntity,
        InitStep::ReserveAddressSpace,
        InitStep::AllocateSlice,
    ];

    /// Steps repeated on every membership change of a dynamic entry.
    pub const EXCHANGE: [InitStep; 3] = [
        InitStep::ExchangeSlice,
        InitStep::ExchangeEntity,
        InitStep::Map,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            InitStep::CreateEntity => "create_entity",
            InitStep::ReserveAddressSpace => "reserve_address_space",
            InitStep::AllocateSlice => "allocate_slice",
            InitStep::ExchangeSlice => "exchange_slice",
            InitStep::ExchangeEntity => "exchange_entity",
            InitStep::Map => "map",
        }
    }
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters of one entry, as requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRequest {
    pub id: u32,
    pub rank: u32,
    /// Group size for static entries, maximum group size for dynamic ones.
    pub rank_size: u32,
    pub size_per_rank: u64,
}

impl EntryRequest {
    pub fn new(id: u32, rank: u32, rank_size: u32, size_per_rank: u64) -> Self {
        Self {
            id,
            rank,
            rank_size,
            size_per_rank,
        }
    }
}

/// Collaborators handed to an entry while it bootstraps.
#[derive(Clone)]
pub struct EntryContext {
    /// Store namespace unique to the entry id.
    pub store: Arc<dyn ConfigStore>,
    pub engine: Arc<dyn MemoryEngine>,
    pub timeout: Duration,
    pub device_id: u32,
}

/// An entry kind the registry can create.
pub trait BootstrapEntry: Send + Sync + Sized + 'static {
    /// Store namespace prefix; the entry id is appended as `(<id>)_`.
    const NAMESPACE: &'static str;

    fn bootstrap(request: &EntryRequest, context: EntryContext) -> Result<Self>;

    fn id(&self) -> u32;
}

/// Engine objects owned by an entry, released slice first, then the
/// reservation, then the entity.
pub(crate) struct EngineResources {
    engine: Arc<dyn MemoryEngine>,
    options: EntityOptions,
    entity: Option<EntityHandle>,
    base_address: Option<u64>,
    slice: Option<SliceHandle>,
}

impl EngineResources {
    pub(crate) fn new(engine: Arc<dyn MemoryEngine>, options: EntityOptions) -> Self {
        Self {
            engine,
            options,
            entity: None,
            base_address: None,
            slice: None,
        }
    }

    pub(crate) fn engine(&self) -> &dyn MemoryEngine {
        self.engine.as_ref()
    }

    pub(crate) fn options(&self) -> &EntityOptions {
        &self.options
    }

    pub(crate) fn entity(&self) -> Result<EntityHandle> {
        self.entity.ok_or(MemFabricError::NotInitialized)
    }

    pub(crate) fn base_address(&self) -> Result<u64> {
        self.base_address.ok_or(MemFabricError::NotInitialized)
    }

    fn slice(&self) -> Result<SliceHandle> {
        self.slice.ok_or(MemFabricError::NotInitialized)
    }

    /// Run the forward action of `step`.
    pub(crate) fn forward(&mut self, step: InitStep, group: &dyn CollectiveOps) -> Result<()> {
        let engine = self.engine.clone();
        match step {
            InitStep::CreateEntity => {
                let entity = engine
                    .create_entity(&self.options)
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
                self.entity = Some(entity);
            }
            InitStep::ReserveAddressSpace => {
                let base = engine
                    .reserve_address_space(self.entity()?)
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
                self.base_address = Some(base);
            }
            InitStep::AllocateSlice => {
                let slice = engine
                    .allocate_slice(self.entity()?, self.options.size_per_rank)
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
                self.slice = Some(slice);
            }
            InitStep::ExchangeSlice => {
                let entity = self.entity()?;
                let descriptor = engine
                    .export_descriptor(entity, Some(self.slice()?))
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
                exchange_descriptors(group, engine.as_ref(), entity, &descriptor, step)?;
            }
            InitStep::ExchangeEntity => {
                let entity = self.entity()?;
                let descriptor = engine
                    .export_descriptor(entity, None)
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
                if descriptor.is_empty() {
                    tracing::debug!(rank = self.options.rank, "no entity descriptor to exchange");
                } else {
                    exchange_descriptors(group, engine.as_ref(), entity, &descriptor, step)?;
                }
            }
            InitStep::Map => {
                engine
                    .map(self.entity()?)
                    .map_err(|e| MemFabricError::engine(step.name(), e))?;
            }
        }
        Ok(())
    }

    /// Undo `step`. Failures are logged and otherwise ignored.
    pub(crate) fn rollback(&mut self, step: InitStep) {
        let rank = self.options.rank;
        let outcome = match step {
            InitStep::AllocateSlice => match (self.entity, self.slice.take()) {
                (Some(entity), Some(slice)) => self.engine.free_slice(entity, slice),
                _ => Ok(()),
            },
            InitStep::ReserveAddressSpace => match (self.entity, self.base_address.take()) {
                (Some(entity), Some(_)) => self.engine.unreserve_address_space(entity),
                _ => Ok(()),
            },
            InitStep::CreateEntity => match self.entity.take() {
                Some(entity) => self.engine.destroy_entity(entity),
                None => Ok(()),
            },
            InitStep::ExchangeSlice | InitStep::ExchangeEntity | InitStep::Map => Ok(()),
        };
        if let Err(err) = outcome {
            tracing::warn!(rank, step = %step, error = %err, "rollback step failed");
        }
    }

    pub(crate) fn release_all(&mut self) {
        for step in InitStep::LOCAL.iter().rev() {
            self.rollback(*step);
        }
    }
}

impl Drop for EngineResources {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Run `steps` in order; on failure undo the completed ones in reverse.
pub(crate) fn run_steps(
    resources: &mut EngineResources,
    group: &dyn CollectiveOps,
    steps: &[InitStep],
) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        let start = Instant::now();
        if let Err(err) = resources.forward(*step, group) {
            tracing::error!(
                rank = group.rank(),
                step = %step,
                error = %err,
                "bootstrap step failed, rolling back"
            );
            for done in steps[..index].iter().rev() {
                resources.rollback(*done);
            }
            return Err(err);
        }
        tracing::debug!(
            rank = group.rank(),
            step = %step,
            elapsed_us = start.elapsed().as_micros() as u64,
            "bootstrap step complete"
        );
    }
    Ok(())
}

/// Gather `descriptor` from every rank, import the result and synchronize.
pub(crate) fn exchange_descriptors(
    group: &dyn CollectiveOps,
    engine: &dyn MemoryEngine,
    entity: EntityHandle,
    descriptor: &ExchangeDescriptor,
    step: InitStep,
) -> Result<()> {
    let gathered = group.all_gather(&descriptor.to_frame())?;
    let descriptors = gathered
        .chunks_exact(DESCRIPTOR_FRAME_LEN)
        .map(ExchangeDescriptor::from_frame)
        .collect::<Result<Vec<_>>>()?;
    engine
        .import_descriptors(entity, &descriptors)
        .map_err(|e| MemFabricError::engine(step.name(), e))?;
    group.barrier()
}
