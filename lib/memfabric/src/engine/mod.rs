// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory engine contract.
//!
//! The engine owns the device side of the symmetric window: it reserves the
//! virtual range, backs the local slice and maps peer slices once their
//! descriptors are imported. Bootstrap entries only drive it; implementations
//! live with the device runtime.

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::error::MemFabricError;

/// Largest descriptor an engine may export.
pub const MAX_DESCRIPTOR_LEN: usize = 512;

/// Size of one descriptor frame inside an all-gather: length word plus padded body.
pub const DESCRIPTOR_FRAME_LEN: usize = std::mem::size_of::<u32>() + MAX_DESCRIPTOR_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceHandle(pub u64);

/// Parameters of a local entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityOptions {
    /// Engine-side id; static and dynamic entries use disjoint ids.
    pub entity_id: u32,
    pub rank: u32,
    pub rank_count: u32,
    pub size_per_rank: u64,
    pub device_id: u32,
}

impl EntityOptions {
    /// Size of the virtual window covering every rank.
    pub fn window_size(&self) -> u64 {
        self.size_per_rank.saturating_mul(self.rank_count as u64)
    }
}

/// How a remote rank can be reached from this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReachTypes {
    pub device: bool,
    pub host: bool,
    pub rdma: bool,
}

/// Opaque descriptor exported by one rank and imported by its peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeDescriptor(Bytes);

impl ExchangeDescriptor {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_DESCRIPTOR_LEN {
            bail!(
                "descriptor of {} bytes exceeds the {MAX_DESCRIPTOR_LEN} byte limit",
                bytes.len()
            );
        }
        Ok(Self(bytes))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Fixed-size frame so every rank contributes an equal chunk to the gather.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; DESCRIPTOR_FRAME_LEN];
        frame[..4].copy_from_slice(&(self.0.len() as u32).to_le_bytes());
        frame[4..4 + self.0.len()].copy_from_slice(&self.0);
        frame
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, MemFabricError> {
        if frame.len() != DESCRIPTOR_FRAME_LEN {
            return Err(MemFabricError::InvalidState(format!(
                "descriptor frame is {} bytes, expected {DESCRIPTOR_FRAME_LEN}",
                frame.len()
            )));
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if len > MAX_DESCRIPTOR_LEN {
            return Err(MemFabricError::InvalidState(format!(
                "descriptor frame announces {len} bytes"
            )));
        }
        Ok(Self(Bytes::copy_from_slice(&frame[4..4 + len])))
    }
}

/// Device-side operations used by the staged bootstrap.
///
/// Each forward operation has an inverse; the bootstrap undoes completed steps
/// in reverse order when a later one fails.
pub trait MemoryEngine: Send + Sync {
    fn create_entity(&self, options: &EntityOptions) -> Result<EntityHandle>;

    /// Reserve the virtual window for the whole group and return its base address.
    fn reserve_address_space(&self, entity: EntityHandle) -> Result<u64>;

    fn allocate_slice(&self, entity: EntityHandle, size: u64) -> Result<SliceHandle>;

    /// Export the descriptor of `slice`, or the entity-level descriptor when `slice` is `None`.
    ///
    /// Engines without an entity-level registration return an empty descriptor.
    fn export_descriptor(
        &self,
        entity: EntityHandle,
        slice: Option<SliceHandle>,
    ) -> Result<ExchangeDescriptor>;

    fn import_descriptors(
        &self,
        entity: EntityHandle,
        descriptors: &[ExchangeDescriptor],
    ) -> Result<()>;

    /// Map every imported descriptor into the local address space.
    fn map(&self, entity: EntityHandle) -> Result<()>;

    /// Forget everything imported from `rank`.
    fn remove_imported(&self, entity: EntityHandle, rank: u32) -> Result<()>;

    fn free_slice(&self, entity: EntityHandle, slice: SliceHandle) -> Result<()>;

    fn unreserve_address_space(&self, entity: EntityHandle) -> Result<()>;

    fn destroy_entity(&self, entity: EntityHandle) -> Result<()>;

    fn set_extra_context(&self, _entity: EntityHandle, _context: &[u8]) -> Result<()> {
        bail!("engine does not support extra context")
    }

    fn reach_types(&self, _entity: EntityHandle, _remote_rank: u32) -> Result<ReachTypes> {
        bail!("engine does not report reachability")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_limit() {
        assert!(ExchangeDescriptor::new(vec![1u8; MAX_DESCRIPTOR_LEN]).is_ok());
        assert!(ExchangeDescriptor::new(vec![1u8; MAX_DESCRIPTOR_LEN + 1]).is_err());
    }

    #[test]
    fn test_frame_is_fixed_size() {
        let short = ExchangeDescriptor::new(Bytes::from_static(b"slice")).unwrap();
        let frame = short.to_frame();
        assert_eq!(frame.len(), DESCRIPTOR_FRAME_LEN);
        assert_eq!(ExchangeDescriptor::from_frame(&frame).unwrap(), short);

        let empty = ExchangeDescriptor::empty().to_frame();
        assert!(ExchangeDescriptor::from_frame(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_frame_is_rejected() {
        let mut frame = ExchangeDescriptor::empty().to_frame();
        frame[..4].copy_from_slice(&(MAX_DESCRIPTOR_LEN as u32 + 1).to_le_bytes());
        assert!(ExchangeDescriptor::from_frame(&frame).is_err());
        assert!(ExchangeDescriptor::from_frame(&frame[1..]).is_err());
    }

    #[test]
    fn test_window_size() {
        let options = EntityOptions {
            entity_id: 2,
            rank: 1,
            rank_count: 4,
            size_per_rank: 1 << 20,
            device_id: 0,
        };
        assert_eq!(options.window_size(), 4 << 20);
    }
}
