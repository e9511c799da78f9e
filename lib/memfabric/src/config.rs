// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide limits and timeouts for the entry registry.
//!
//! Sources, lowest to highest priority:
//! 1. Code defaults
//! 2. TOML file named by `DYN_MEMFABRIC_CONFIG_PATH`
//! 3. `DYN_MEMFABRIC_*` environment variables

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

pub const CONFIG_PATH_ENV: &str = "DYN_MEMFABRIC_CONFIG_PATH";
pub const ENV_PREFIX: &str = "DYN_MEMFABRIC_";

const GIB: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MemFabricConfig {
    /// Bound on every group operation, in seconds.
    #[validate(range(min = 1, max = 4294967))]
    pub control_operation_timeout_secs: u64,

    /// Device passed to the memory engine when entities are created.
    pub device_id: u32,

    /// Largest accepted `rank_size`.
    #[validate(range(min = 1, max = 1024))]
    pub max_world_size: u32,

    /// Largest accepted entry id.
    #[validate(range(max = 63))]
    pub max_entry_id: u32,

    /// Largest accepted per-rank slice, in bytes.
    #[validate(range(min = 1))]
    pub max_local_size: u64,
}

impl Default for MemFabricConfig {
    fn default() -> Self {
        Self {
            control_operation_timeout_secs: 120,
            device_id: 0,
            max_world_size: 1024,
            max_entry_id: 63,
            max_local_size: 40 * GIB,
        }
    }
}

impl MemFabricConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(MemFabricConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG_PATH", "LOG"]))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// ```rust,ignore
    /// let config = MemFabricConfig::extract_from(
    ///     MemFabricConfig::figment().merge(("max_world_size", 8u32)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.check()?;
        Ok(config)
    }

    /// Validate a configuration built in code.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }

    pub fn control_operation_timeout(&self) -> Duration {
        Duration::from_secs(self.control_operation_timeout_secs)
    }
}
