// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process logging for binaries and services embedding the crate.
//!
//! Filters come from `DYN_MEMFABRIC_LOG` using the usual `EnvFilter` syntax,
//! e.g. `DYN_MEMFABRIC_LOG=info,dynamo_memfabric::group=debug`. The default
//! level is `info`.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const FILTER_ENV: &str = "DYN_MEMFABRIC_LOG";

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops, and an already
/// installed subscriber from the host process is left in place.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(filters());
    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

fn filters() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}
