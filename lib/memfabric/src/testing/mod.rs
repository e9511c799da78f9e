// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test support: a bookkeeping memory engine with fault injection, and helpers
//! for running several ranks on threads of one process.

mod engine;

pub use engine::{EngineOp, MockMemoryEngine, ResourceCounts};

use tracing_subscriber::EnvFilter;

/// Install a `warn` level subscriber that writes through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// Run `f` once per rank, each on its own thread, and collect the results in rank order.
///
/// # Panics
/// Re-raises a panic from any rank.
pub fn run_ranks<T, F>(ranks: u32, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(u32) -> T + Sync,
{
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..ranks).map(|rank| scope.spawn(move || f(rank))).collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
