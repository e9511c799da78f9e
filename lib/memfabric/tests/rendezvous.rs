// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two processes' worth of ranks sharing one store through the public API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dynamo_memfabric::testing::{init_tracing, run_ranks, MockMemoryEngine, ResourceCounts};
use dynamo_memfabric::{
    CollectiveOps, ConfigStore, DynamicRegistry, EntryRequest, InMemoryStore, MemFabricConfig,
    MemFabricError, StaticRegistry,
};

const SLICE: u64 = 1 << 20;

fn config() -> MemFabricConfig {
    MemFabricConfig {
        control_operation_timeout_secs: 10,
        max_world_size: 8,
        ..Default::default()
    }
}

#[test]
fn static_entries_exchange_through_registry() {
    init_tracing();
    let store = InMemoryStore::new();

    let ranks = run_ranks(2, |rank| {
        let engine = Arc::new(MockMemoryEngine::new());
        let registry =
            StaticRegistry::new(Arc::new(store.clone()), engine.clone(), config()).unwrap();
        let (handle, entry) = registry.create(EntryRequest::new(0, rank, 2, SLICE)).unwrap();

        let names = entry
            .group()
            .all_gather(format!("rank-{rank}").as_bytes())
            .unwrap();
        assert_eq!(names, b"rank-0rank-1");
        entry.group().barrier().unwrap();

        assert_eq!(engine.mapped_ranks(), vec![0, 1]);
        assert_eq!(registry.get_by_handle(handle).unwrap().rank(), rank);
        (engine, registry)
    });

    for (engine, registry) in &ranks {
        registry.remove_by_id(0).unwrap();
        assert_eq!(engine.counts(), ResourceCounts::default());
    }
}

#[test]
fn dynamic_entry_joins_and_leaves() {
    init_tracing();
    let store = InMemoryStore::new();
    let engines: Vec<_> = (0..2).map(|_| Arc::new(MockMemoryEngine::new())).collect();
    let registries: Vec<_> = engines
        .iter()
        .map(|engine| {
            DynamicRegistry::new(Arc::new(store.clone()), engine.clone(), config()).unwrap()
        })
        .collect();
    let entries: Vec<_> = registries
        .iter()
        .enumerate()
        .map(|(rank, registry)| {
            let request = EntryRequest::new(1, rank as u32, 8, SLICE);
            registry.create(request).unwrap().1
        })
        .collect();

    assert!(matches!(entries[0].leave(), Err(MemFabricError::NotJoined)));

    entries[0].join().unwrap();
    entries[1].join().unwrap();
    assert_eq!(entries[1].rank_size(), 2);
    assert_eq!(engines[1].mapped_ranks(), vec![0, 1]);

    let deadline = Instant::now() + Duration::from_secs(10);
    while engines[0].mapped_ranks() != vec![0, 1] {
        assert!(Instant::now() < deadline, "rank 0 never remapped");
        std::thread::sleep(Duration::from_millis(5));
    }

    // the committed membership is visible to anyone reading the store
    let committed = store
        .get("SMEM_BM_(1)_D_DSIZE", Duration::ZERO)
        .unwrap();
    assert_eq!(committed.as_ref(), ((2u64 << 30) | 2).to_string().as_bytes());

    drop(entries);
    for registry in &registries {
        registry.remove_by_id(1).unwrap();
    }
    for engine in &engines {
        assert_eq!(engine.counts(), ResourceCounts::default());
    }
}

#[test]
fn registry_rejects_invalid_config() {
    let config = MemFabricConfig {
        max_world_size: 0,
        ..Default::default()
    };
    let result = StaticRegistry::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(MockMemoryEngine::new()),
        config,
    );
    assert!(matches!(result, Err(MemFabricError::InvalidParam(_))));
}
