// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Membership generation and group size packed into one store integer.
//!
//! The high 34 bits hold the generation, the low 30 bits the group size, so a
//! single atomic `add` both bumps the generation and adjusts the size.

use crate::store::{parse_integer, StoreError};

pub const SIZE_BITS: u32 = 30;
pub const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
pub const GENERATION_BITS: u32 = 64 - SIZE_BITS;
pub const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackedGeneration(u64);

impl PackedGeneration {
    /// Delta applied by a joining rank: one more generation and one more member.
    pub const JOIN_DELTA: i64 = ((1u64 << SIZE_BITS) | 1) as i64;

    /// Delta applied by a leaving rank.
    ///
    /// Adding the all-ones size field carries into the generation, so the net
    /// effect is generation + 1 and size - 1 as long as size is at least 1.
    pub const LEAVE_DELTA: i64 = SIZE_MASK as i64;

    /// Delta committed when a join or leave round fails before its own commit.
    ///
    /// Skips the generation the failed round ran its collectives in and keeps
    /// the size, so the next round starts on keys nobody has touched.
    pub const ABORT_DELTA: i64 = (2u64 << SIZE_BITS) as i64;

    pub fn new(generation: u64, size: u32) -> Self {
        Self(((generation & GENERATION_MASK) << SIZE_BITS) | (size as u64 & SIZE_MASK))
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw as u64)
    }

    /// Decode the decimal representation kept under the size key.
    pub fn parse(key: &str, value: &[u8]) -> Result<Self, StoreError> {
        parse_integer(key, value).map(Self::from_raw)
    }

    pub fn generation(&self) -> u64 {
        self.0 >> SIZE_BITS
    }

    pub fn size(&self) -> u32 {
        (self.0 & SIZE_MASK) as u32
    }

    pub fn raw(&self) -> i64 {
        self.0 as i64
    }

    /// What the store holds once `delta` has been added, with the same wrapping the store applies.
    pub fn apply(&self, delta: i64) -> Self {
        Self::from_raw(self.raw().wrapping_add(delta))
    }
}

impl std::fmt::Display for PackedGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen={} size={}", self.generation(), self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::first_join(1, 1)]
    #[case::typical(17, 8)]
    #[case::max_size(3, SIZE_MASK as u32)]
    #[case::max_generation(GENERATION_MASK, 1024)]
    #[case::both_max(GENERATION_MASK, SIZE_MASK as u32)]
    fn test_pack_round_trip(#[case] generation: u64, #[case] size: u32) {
        let packed = PackedGeneration::new(generation, size);
        assert_eq!(packed.generation(), generation);
        assert_eq!(packed.size(), size);
        assert_eq!(PackedGeneration::from_raw(packed.raw()), packed);
    }

    #[test]
    fn test_pack_layout() {
        assert_eq!(PackedGeneration::new(1, 0).raw(), 1 << 30);
        assert_eq!(PackedGeneration::new(2, 5).raw(), (2 << 30) | 5);
    }

    #[test]
    fn test_join_delta_bumps_generation_and_size() {
        let before = PackedGeneration::new(4, 2);
        let after = before.apply(PackedGeneration::JOIN_DELTA);
        assert_eq!(after.generation(), 5);
        assert_eq!(after.size(), 3);
    }

    #[rstest]
    #[case::last_member(9, 1)]
    #[case::two_members(0, 2)]
    #[case::many(100, 1000)]
    fn test_leave_delta_carries_into_generation(#[case] generation: u64, #[case] size: u32) {
        let after = PackedGeneration::new(generation, size).apply(PackedGeneration::LEAVE_DELTA);
        assert_eq!(after.generation(), generation + 1);
        assert_eq!(after.size(), size - 1);
    }

    #[test]
    fn test_abort_delta_skips_the_round_generation() {
        let before = PackedGeneration::new(2, 2);
        let round = before.apply(PackedGeneration::JOIN_DELTA);
        let aborted = before.apply(PackedGeneration::ABORT_DELTA);
        assert_eq!((aborted.generation(), aborted.size()), (4, 2));
        assert!(aborted.generation() > round.generation());
    }

    #[test]
    fn test_generation_is_monotonic_over_membership_churn() {
        let mut packed = PackedGeneration::default();
        let mut last = packed.generation();
        for delta in [
            PackedGeneration::JOIN_DELTA,
            PackedGeneration::JOIN_DELTA,
            PackedGeneration::LEAVE_DELTA,
            PackedGeneration::JOIN_DELTA,
            PackedGeneration::LEAVE_DELTA,
            PackedGeneration::LEAVE_DELTA,
        ] {
            packed = packed.apply(delta);
            assert!(packed.generation() > last);
            last = packed.generation();
        }
        assert_eq!(packed.size(), 0);
        assert_eq!(packed.generation(), 6);
    }

    #[test]
    fn test_parse_decimal() {
        let raw = PackedGeneration::new(3, 2).raw().to_string();
        let parsed = PackedGeneration::parse("DSIZE", raw.as_bytes()).unwrap();
        assert_eq!((parsed.generation(), parsed.size()), (3, 2));
        assert!(PackedGeneration::parse("DSIZE", b"J1").is_err());
    }
}
