// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::engine::{
    EntityHandle, EntityOptions, ExchangeDescriptor, MemoryEngine, ReachTypes, SliceHandle,
};

const SLICE_KIND: u8 = 1;
const ENTITY_KIND: u8 = 2;
const BASE_STRIDE: u64 = 1 << 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateEntity,
    ReserveAddressSpace,
    AllocateSlice,
    ExportSlice,
    ExportEntity,
    ImportDescriptors,
    Map,
    RemoveImported,
    FreeSlice,
    UnreserveAddressSpace,
    DestroyEntity,
}

/// Live engine objects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub entities: usize,
    pub reservations: usize,
    pub slices: usize,
}

/// In-memory [`MemoryEngine`] that tracks what it hands out.
///
/// Descriptors carry the exporting rank, so tests can check which peers each
/// rank imported and mapped.
#[derive(Default)]
pub struct MockMemoryEngine {
    state: Mutex<MockState>,
    entity_descriptors: bool,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    entities: HashMap<EntityHandle, MockEntity>,
    failures: HashSet<EngineOp>,
    journal: Vec<EngineOp>,
}

struct MockEntity {
    options: EntityOptions,
    base_address: Option<u64>,
    slices: HashSet<SliceHandle>,
    imported_slices: BTreeSet<u32>,
    imported_entities: BTreeSet<u32>,
    mapped: BTreeSet<u32>,
    extra_context: Option<Vec<u8>>,
}

impl MockState {
    fn check(&mut self, op: EngineOp) -> Result<()> {
        if self.failures.contains(&op) {
            bail!("injected failure in {op:?}");
        }
        self.journal.push(op);
        Ok(())
    }

    fn entity(&mut self, handle: EntityHandle) -> Result<&mut MockEntity> {
        self.entities
            .get_mut(&handle)
            .with_context(|| format!("unknown entity {handle:?}"))
    }
}

impl MockMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that also exports a non-empty entity-level descriptor.
    pub fn with_entity_descriptors() -> Self {
        Self {
            entity_descriptors: true,
            ..Default::default()
        }
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: EngineOp) {
        self.state.lock().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn counts(&self) -> ResourceCounts {
        let state = self.state.lock();
        ResourceCounts {
            entities: state.entities.len(),
            reservations: state
                .entities
                .values()
                .filter(|e| e.base_address.is_some())
                .count(),
            slices: state.entities.values().map(|e| e.slices.len()).sum(),
        }
    }

    /// Successful operations in call order.
    pub fn journal(&self) -> Vec<EngineOp> {
        self.state.lock().journal.clone()
    }

    /// Ranks whose slice descriptors are currently imported, across all entities.
    pub fn imported_ranks(&self) -> Vec<u32> {
        let state = self.state.lock();
        let ranks: BTreeSet<u32> = state
            .entities
            .values()
            .flat_map(|e| e.imported_slices.iter().copied())
            .collect();
        ranks.into_iter().collect()
    }

    pub fn imported_entity_ranks(&self) -> Vec<u32> {
        let state = self.state.lock();
        let ranks: BTreeSet<u32> = state
            .entities
            .values()
            .flat_map(|e| e.imported_entities.iter().copied())
            .collect();
        ranks.into_iter().collect()
    }

    /// Ranks covered by the most recent map call, across all entities.
    pub fn mapped_ranks(&self) -> Vec<u32> {
        let state = self.state.lock();
        let ranks: BTreeSet<u32> = state
            .entities
            .values()
            .flat_map(|e| e.mapped.iter().copied())
            .collect();
        ranks.into_iter().collect()
    }

    pub fn entity_options(&self) -> Vec<EntityOptions> {
        self.state.lock().entities.values().map(|e| e.options).collect()
    }

    pub fn extra_context(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .entities
            .values()
            .find_map(|e| e.extra_context.clone())
    }

    fn descriptor(kind: u8, options: &EntityOptions) -> Result<ExchangeDescriptor> {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(kind);
        bytes.extend_from_slice(&options.rank.to_le_bytes());
        bytes.extend_from_slice(&options.entity_id.to_le_bytes());
        ExchangeDescriptor::new(bytes)
    }
}

impl MemoryEngine for MockMemoryEngine {
    fn create_entity(&self, options: &EntityOptions) -> Result<EntityHandle> {
        let mut state = self.state.lock();
        state.check(EngineOp::CreateEntity)?;
        state.next_handle += 1;
        let handle = EntityHandle(state.next_handle);
        state.entities.insert(
            handle,
            MockEntity {
                options: *options,
                base_address: None,
                slices: HashSet::new(),
                imported_slices: BTreeSet::new(),
                imported_entities: BTreeSet::new(),
                mapped: BTreeSet::new(),
                extra_context: None,
            },
        );
        Ok(handle)
    }

    fn reserve_address_space(&self, entity: EntityHandle) -> Result<u64> {
        let mut state = self.state.lock();
        state.check(EngineOp::ReserveAddressSpace)?;
        let entity_ref = state.entity(entity)?;
        if entity_ref.base_address.is_some() {
            bail!("address space already reserved for {entity:?}");
        }
        if entity_ref.options.window_size() == 0 {
            bail!("empty window for {entity:?}");
        }
        let base = BASE_STRIDE * entity.0;
        entity_ref.base_address = Some(base);
        Ok(base)
    }

    fn allocate_slice(&self, entity: EntityHandle, size: u64) -> Result<SliceHandle> {
        let mut state = self.state.lock();
        state.check(EngineOp::AllocateSlice)?;
        if size == 0 {
            bail!("zero sized slice");
        }
        state.next_handle += 1;
        let slice = SliceHandle(state.next_handle);
        state.entity(entity)?.slices.insert(slice);
        Ok(slice)
    }

    fn export_descriptor(
        &self,
        entity: EntityHandle,
        slice: Option<SliceHandle>,
    ) -> Result<ExchangeDescriptor> {
        let mut state = self.state.lock();
        match slice {
            Some(slice) => {
                state.check(EngineOp::ExportSlice)?;
                let entity = state.entity(entity)?;
                if !entity.slices.contains(&slice) {
                    bail!("unknown slice {slice:?}");
                }
                Self::descriptor(SLICE_KIND, &entity.options)
            }
            None => {
                state.check(EngineOp::ExportEntity)?;
                let options = state.entity(entity)?.options;
                if self.entity_descriptors {
                    Self::descriptor(ENTITY_KIND, &options)
                } else {
                    Ok(ExchangeDescriptor::empty())
                }
            }
        }
    }

    fn import_descriptors(
        &self,
        entity: EntityHandle,
        descriptors: &[ExchangeDescriptor],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::ImportDescriptors)?;
        let entity = state.entity(entity)?;
        for descriptor in descriptors {
            let bytes = descriptor.as_bytes();
            if bytes.len() < 5 {
                bail!("truncated descriptor of {} bytes", bytes.len());
            }
            let rank = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            match bytes[0] {
                SLICE_KIND => entity.imported_slices.insert(rank),
                ENTITY_KIND => entity.imported_entities.insert(rank),
                kind => bail!("unknown descriptor kind {kind}"),
            };
        }
        Ok(())
    }

    fn map(&self, entity: EntityHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::Map)?;
        let entity = state.entity(entity)?;
        if entity.base_address.is_none() {
            bail!("map before reserve");
        }
        entity.mapped = entity.imported_slices.clone();
        Ok(())
    }

    fn remove_imported(&self, entity: EntityHandle, rank: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::RemoveImported)?;
        let entity = state.entity(entity)?;
        entity.imported_slices.remove(&rank);
        entity.imported_entities.remove(&rank);
        entity.mapped.remove(&rank);
        Ok(())
    }

    fn free_slice(&self, entity: EntityHandle, slice: SliceHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::FreeSlice)?;
        if !state.entity(entity)?.slices.remove(&slice) {
            bail!("slice {slice:?} is not allocated");
        }
        Ok(())
    }

    fn unreserve_address_space(&self, entity: EntityHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::UnreserveAddressSpace)?;
        if state.entity(entity)?.base_address.take().is_none() {
            bail!("no reservation for {entity:?}");
        }
        Ok(())
    }

    fn destroy_entity(&self, entity: EntityHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check(EngineOp::DestroyEntity)?;
        match state.entities.remove(&entity) {
            Some(_) => Ok(()),
            None => bail!("unknown entity {entity:?}"),
        }
    }

    fn set_extra_context(&self, entity: EntityHandle, context: &[u8]) -> Result<()> {
        self.state.lock().entity(entity)?.extra_context = Some(context.to_vec());
        Ok(())
    }

    fn reach_types(&self, entity: EntityHandle, remote_rank: u32) -> Result<ReachTypes> {
        let mut state = self.state.lock();
        let entity = state.entity(entity)?;
        Ok(ReachTypes {
            device: true,
            host: true,
            rdma: remote_rank != entity.options.rank,
        })
    }
}
