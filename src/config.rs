//! Engine configuration.
//!
//! Every tunable heuristic lives here. Configuration is loaded from JSON,
//! unknown keys are rejected, and `validate` is run by every constructor
//! that accepts a config.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::AllocationConfig;
use crate::cache::CacheConfig;
use crate::component::SettingCategory;
use crate::compression::CompressionConfig;
use crate::error::{ContextError, Result};
use crate::scoring::ScoringConfig;
use crate::tier::TierSet;

/// Budgets for settings components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsConfig {
    /// Ceiling per category; content beyond it is truncated on load
    pub category_budgets: BTreeMap<SettingCategory, usize>,
    /// Soft minimum the allocator reserves for each settings component
    pub min_tokens: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        let category_budgets = [
            (SettingCategory::World, 8000),
            (SettingCategory::Characters, 8000),
            (SettingCategory::Environments, 5000),
            (SettingCategory::Plot, 6000),
            (SettingCategory::Style, 3000),
        ]
        .into_iter()
        .collect();
        Self {
            category_budgets,
            min_tokens: 200,
        }
    }
}

impl SettingsConfig {
    pub fn budget(&self, category: SettingCategory) -> usize {
        self.category_budgets.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.category_budgets.values().sum()
    }
}

/// Character memories included per assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Highest-weight memories kept per character
    pub per_character: usize,
    /// Memories below this emotional weight are ignored
    pub min_emotional_weight: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            per_character: 3,
            min_emotional_weight: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tiers: TierSet,
    pub compression: CompressionConfig,
    pub scoring: ScoringConfig,
    pub allocation: AllocationConfig,
    pub settings: SettingsConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    /// Total budget used when a request does not name one
    pub default_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tiers: TierSet::default(),
            compression: CompressionConfig::default(),
            scoring: ScoringConfig::default(),
            allocation: AllocationConfig::default(),
            settings: SettingsConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            default_budget: 128_000,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| ContextError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            ContextError::Config(format!("Failed to read configuration {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&json)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        self.compression.validate()?;
        self.scoring.validate()?;
        self.allocation.validate()?;
        self.cache.validate()?;
        if self.default_budget == 0 {
            return Err(ContextError::Config("default_budget must be positive".to_string()));
        }
        if self.memory.min_emotional_weight > 10 {
            return Err(ContextError::Config(format!(
                "min_emotional_weight {} is above 10",
                self.memory.min_emotional_weight
            )));
        }
        Ok(())
    }
}
