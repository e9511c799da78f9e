// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rstest::rstest;

use super::*;
use crate::group::PackedGeneration;
use crate::store::{InMemoryStore, PrefixStore, StoreError, WatchCallback, WatchId};
use crate::testing::{init_tracing, run_ranks, EngineOp, MockMemoryEngine, ResourceCounts};

const TIMEOUT: Duration = Duration::from_secs(10);
const SLICE: u64 = 2 << 20;

fn context(store: &InMemoryStore, engine: &Arc<MockMemoryEngine>, namespace: &str) -> EntryContext {
    EntryContext {
        store: Arc::new(PrefixStore::new(Arc::new(store.clone()), namespace)),
        engine: engine.clone(),
        timeout: TIMEOUT,
        device_id: 0,
    }
}

/// Sleeps before every read of a barrier wait key, so a fast peer can finish
/// and tear down between this rank's arrival and its wait.
struct SlowWaits {
    inner: InMemoryStore,
    delay: Duration,
}

impl ConfigStore for SlowWaits {
    fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, StoreError> {
        if key.ends_with("_BW") {
            std::thread::sleep(self.delay);
        }
        self.inner.get(key, timeout)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.set(key, value)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.add(key, delta)
    }

    fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.inner.append(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }

    fn cas(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<Bytes, StoreError> {
        self.inner.cas(key, expected, value)
    }

    fn watch(&self, key: &str, notify: WatchCallback) -> Result<WatchId, StoreError> {
        self.inner.watch(key, notify)
    }

    fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        self.inner.unwatch(id)
    }
}

fn committed_size(store: &InMemoryStore, key: &str) -> PackedGeneration {
    PackedGeneration::parse(key, &store.get(key, Duration::ZERO).unwrap()).unwrap()
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[rstest]
#[case::create_entity(EngineOp::CreateEntity, "create_entity")]
#[case::reserve(EngineOp::ReserveAddressSpace, "reserve_address_space")]
#[case::allocate(EngineOp::AllocateSlice, "allocate_slice")]
#[case::export_slice(EngineOp::ExportSlice, "exchange_slice")]
#[case::import(EngineOp::ImportDescriptors, "exchange_slice")]
#[case::export_entity(EngineOp::ExportEntity, "exchange_entity")]
#[case::map(EngineOp::Map, "map")]
fn test_failed_step_releases_everything(#[case] failing: EngineOp, #[case] step: &str) {
    init_tracing();
    let store = InMemoryStore::new();
    let engine = Arc::new(MockMemoryEngine::new());
    engine.fail_on(failing);

    let request = EntryRequest::new(0, 0, 1, SLICE);
    let err = StaticEntry::bootstrap(&request, context(&store, &engine, "SHM_(0)_")).unwrap_err();

    match err {
        MemFabricError::Engine { op, .. } => assert_eq!(op, step),
        other => panic!("expected an engine error, got {other}"),
    }
    assert_eq!(engine.counts(), ResourceCounts::default());
}

#[test]
fn test_failed_bootstrap_can_be_retried() {
    init_tracing();
    let store = InMemoryStore::new();
    let engine = Arc::new(MockMemoryEngine::new());
    let request = EntryRequest::new(1, 0, 1, SLICE);

    engine.fail_on(EngineOp::Map);
    assert!(StaticEntry::bootstrap(&request, context(&store, &engine, "SHM_(1)_")).is_err());

    engine.clear_failures();
    let entry = StaticEntry::bootstrap(&request, context(&store, &engine, "SHM_(1)_")).unwrap();
    assert!(entry.is_initialized());
    assert_eq!(entry.group().generation(), 1);
    assert_eq!(engine.mapped_ranks(), vec![0]);
}

#[test]
fn test_early_teardown_does_not_strand_a_slow_peer() {
    init_tracing();
    let store = InMemoryStore::new();

    let results = run_ranks(2, |rank| {
        let backing: Arc<dyn ConfigStore> = if rank == 0 {
            Arc::new(store.clone())
        } else {
            Arc::new(SlowWaits {
                inner: store.clone(),
                delay: Duration::from_millis(300),
            })
        };
        let context = EntryContext {
            store: Arc::new(PrefixStore::new(backing, "SHM_(0)_")),
            engine: Arc::new(MockMemoryEngine::new()),
            timeout: Duration::from_secs(2),
            device_id: 0,
        };
        // rank 0 drops its entry as soon as it is ready
        StaticEntry::bootstrap(&EntryRequest::new(0, rank, 2, SLICE), context)
            .map(drop)
            .map_err(|e| e.to_string())
    });

    assert_eq!(results, vec![Ok(()), Ok(())]);
}

#[test]
fn test_static_entries_map_every_rank() {
    init_tracing();
    let store = InMemoryStore::with_latency(Duration::from_millis(1));
    let engines: Vec<_> = (0..4).map(|_| Arc::new(MockMemoryEngine::new())).collect();

    let entries = run_ranks(4, |rank| {
        let request = EntryRequest::new(3, rank, 4, SLICE);
        let engine = &engines[rank as usize];
        StaticEntry::bootstrap(&request, context(&store, engine, "SHM_(3)_")).unwrap()
    });

    for (rank, (entry, engine)) in entries.iter().zip(&engines).enumerate() {
        assert_eq!(entry.rank(), rank as u32);
        assert_eq!(entry.rank_size(), 4);
        assert_eq!(entry.local_address(), entry.base_address() + SLICE * rank as u64);
        assert_eq!(entry.size_per_rank(), SLICE);
        assert_eq!(entry.peer_address(3).unwrap(), entry.base_address() + SLICE * 3);
        assert!(matches!(
            entry.peer_address(4),
            Err(MemFabricError::InvalidParam(_))
        ));
        assert_eq!(engine.imported_ranks(), vec![0, 1, 2, 3]);
        assert_eq!(engine.mapped_ranks(), vec![0, 1, 2, 3]);
        assert!(engine.imported_entity_ranks().is_empty());

        let options = engine.entity_options();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].entity_id, 3 << 1);
        assert_eq!(options[0].rank_count, 4);
    }

    drop(entries);
    for engine in &engines {
        assert_eq!(engine.counts(), ResourceCounts::default());
    }

    // the same id again, on keys the first use never touched
    let generations = run_ranks(4, |rank| {
        let request = EntryRequest::new(3, rank, 4, SLICE);
        let engine = &engines[rank as usize];
        let entry = StaticEntry::bootstrap(&request, context(&store, engine, "SHM_(3)_")).unwrap();
        entry.group().barrier().unwrap();
        entry.group().generation()
    });
    assert_eq!(generations, vec![1; 4]);
    assert!(!store.contains("SHM_(3)_S_0_0_BW"));
}

#[test]
fn test_entity_descriptors_are_exchanged() {
    init_tracing();
    let store = InMemoryStore::new();
    let engines: Vec<_> = (0..2)
        .map(|_| Arc::new(MockMemoryEngine::with_entity_descriptors()))
        .collect();

    let entries = run_ranks(2, |rank| {
        let request = EntryRequest::new(0, rank, 2, SLICE);
        StaticEntry::bootstrap(&request, context(&store, &engines[rank as usize], "SHM_(0)_"))
            .unwrap()
    });

    for engine in &engines {
        assert_eq!(engine.imported_entity_ranks(), vec![0, 1]);
    }
    drop(entries);
}

#[test]
fn test_release_runs_in_reverse_order() {
    let store = InMemoryStore::new();
    let engine = Arc::new(MockMemoryEngine::new());
    let request = EntryRequest::new(0, 0, 1, SLICE);

    let entry = StaticEntry::bootstrap(&request, context(&store, &engine, "SHM_(0)_")).unwrap();
    drop(entry);

    let journal = engine.journal();
    assert_eq!(
        journal[journal.len() - 3..],
        [
            EngineOp::FreeSlice,
            EngineOp::UnreserveAddressSpace,
            EngineOp::DestroyEntity
        ]
    );
}

#[test]
fn test_engine_passthroughs() {
    let store = InMemoryStore::new();
    let engine = Arc::new(MockMemoryEngine::new());
    let request = EntryRequest::new(0, 0, 1, SLICE);
    let entry = StaticEntry::bootstrap(&request, context(&store, &engine, "SHM_(0)_")).unwrap();

    entry.set_extra_context(b"ctx").unwrap();
    assert_eq!(engine.extra_context(), Some(b"ctx".to_vec()));
    assert!(matches!(
        entry.set_extra_context(&[]),
        Err(MemFabricError::InvalidParam(_))
    ));
    assert!(matches!(
        entry.set_extra_context(&vec![0u8; 64 * 1024 + 1]),
        Err(MemFabricError::InvalidParam(_))
    ));

    let reach = entry.reach_types(0).unwrap();
    assert!(reach.device && reach.host && !reach.rdma);
    assert!(matches!(
        entry.reach_types(1),
        Err(MemFabricError::InvalidParam(_))
    ));
}

#[test]
fn test_dynamic_entries_remap_on_membership_change() {
    init_tracing();
    let store = InMemoryStore::new();
    let engines: Vec<_> = (0..2).map(|_| Arc::new(MockMemoryEngine::new())).collect();
    let entries: Vec<DynamicEntry> = (0..2)
        .map(|rank| {
            let request = EntryRequest::new(4, rank, 4, SLICE);
            DynamicEntry::bootstrap(&request, context(&store, &engines[rank as usize], "SMEM_BM_(4)_"))
                .unwrap()
        })
        .collect();
    let (first, second) = (&entries[0], &entries[1]);

    assert!(!first.is_initialized());
    assert!(matches!(first.local_address(), Err(MemFabricError::NotInitialized)));
    assert_eq!(engines[0].entity_options()[0].entity_id, (4 << 1) | 1);
    assert_eq!(first.size_per_rank(), SLICE);
    assert_eq!(
        first.peer_address(3).unwrap(),
        first.base_address().unwrap() + SLICE * 3
    );
    assert!(matches!(
        first.peer_address(4),
        Err(MemFabricError::InvalidParam(_))
    ));

    let address = first.join().unwrap();
    assert_eq!(address, first.base_address().unwrap());
    assert_eq!(engines[0].mapped_ranks(), vec![0]);

    let address = second.join().unwrap();
    assert_eq!(address, second.base_address().unwrap() + SLICE);
    assert_eq!(second.rank_size(), 2);
    assert_eq!(engines[1].mapped_ranks(), vec![0, 1]);
    wait_until("remap on the existing member", || {
        engines[0].mapped_ranks() == vec![0, 1]
    });
    assert_eq!(first.rank_size(), 2);

    wait_until("watchers re-armed", || store.pending_watches() == 2);
    second.leave().unwrap();
    assert!(!second.is_initialized());
    assert_eq!(engines[1].imported_ranks(), vec![0]);
    wait_until("departed rank dropped", || engines[0].imported_ranks() == vec![0]);
    assert!(first.is_initialized());
    assert_eq!(first.rank_size(), 1);

    drop(entries);
    for engine in &engines {
        assert_eq!(engine.counts(), ResourceCounts::default());
    }
}

#[test]
fn test_failed_leave_keeps_the_group_joinable() {
    init_tracing();
    let store = InMemoryStore::new();
    let engines: Vec<_> = (0..3).map(|_| Arc::new(MockMemoryEngine::new())).collect();
    let entries: Vec<DynamicEntry> = (0..3)
        .map(|rank| {
            let request = EntryRequest::new(6, rank, 4, SLICE);
            DynamicEntry::bootstrap(&request, context(&store, &engines[rank as usize], "SMEM_BM_(6)_"))
                .unwrap()
        })
        .collect();

    entries[0].join().unwrap();
    entries[1].join().unwrap();
    wait_until("join observed", || entries[0].rank_size() == 2);
    wait_until("watchers re-armed", || store.pending_watches() == 2);

    engines[1].fail_on(EngineOp::RemoveImported);
    let err = entries[1].leave().unwrap_err();
    assert!(
        matches!(err, MemFabricError::Engine { op: "remove_imported", .. }),
        "unexpected error: {err}"
    );
    assert!(entries[1].group().is_joined());
    assert!(!store.contains("SMEM_BM_(6)_D_EVENT"));

    // the aborted round's generation is skipped and the size is unchanged
    assert_eq!(
        committed_size(&store, "SMEM_BM_(6)_D_DSIZE"),
        PackedGeneration::new(4, 2)
    );
    assert_eq!(entries[1].group().generation(), 4);
    wait_until("survivor settled", || {
        entries[0].group().generation() == 4 && entries[0].rank_size() == 2
    });
    wait_until("watchers re-armed", || store.pending_watches() == 2);

    engines[1].clear_failures();
    entries[2].join().unwrap();
    assert_eq!(entries[2].rank_size(), 3);
    for engine in &engines {
        wait_until("every member remapped", || engine.mapped_ranks() == vec![0, 1, 2]);
    }
    assert_eq!(
        committed_size(&store, "SMEM_BM_(6)_D_DSIZE"),
        PackedGeneration::new(5, 3)
    );

    drop(entries);
    for engine in &engines {
        assert_eq!(engine.counts(), ResourceCounts::default());
    }
}
