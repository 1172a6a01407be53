use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::stats::definitions::{InMemoryDefinitionSource, StatisticDefinition};
use crate::stats::event::StatisticType;
use crate::stats::rollup::RollupPolicy;

/// Top-level configuration for the statroll engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database connection configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Staging flush configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Aggregation job configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Declared statistics (name, type, tag schema, rollup policy).
    #[serde(default)]
    pub statistics: Vec<StatisticConfig>,
}

/// Database connection configuration.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (e.g., "sqlite://statroll.db?mode=rwc").
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size. Default: 4.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Staging flush configuration.
#[derive(Debug, Deserialize)]
pub struct FlushConfig {
    /// Rows per multi-row INSERT into the staging table. Affects statement
    /// size only, not correctness. Default: 500.
    #[serde(default = "default_flush_batch_size")]
    pub batch_size: usize,
}

/// Aggregation job configuration.
#[derive(Debug, Deserialize)]
pub struct AggregationConfig {
    /// Staging rows consumed per stage-1 transaction. Default: 5000.
    #[serde(default = "default_stage_batch_size")]
    pub stage_one_batch_size: u32,

    /// Finer-tier rows consumed per stage-2 transaction. Default: 5000.
    #[serde(default = "default_stage_batch_size")]
    pub stage_two_batch_size: u32,

    /// Aggregate rows older than this are deleted. Absent or zero: keep
    /// everything forever.
    #[serde(default, with = "humantime_serde")]
    pub max_processing_age: Option<Duration>,

    /// How often the `run` command triggers an aggregation pass.
    /// Default: 5m.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// One declared statistic.
#[derive(Debug, Deserialize)]
pub struct StatisticConfig {
    /// Statistic name.
    pub name: String,

    /// "count" or "value".
    #[serde(rename = "type")]
    pub statistic_type: StatisticType,

    /// Ordered tag names; events must supply values in this order.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Wildcard rollup policy. Default: none.
    #[serde(default)]
    pub rollup: RollupConfig,
}

/// Rollup policy as written in YAML: the strings "none"/"all", or a list of
/// masks where each mask lists the tag positions rolled up to wildcard.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RollupConfig {
    Mode(RollupMode),
    Masks(Vec<Vec<usize>>),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupMode {
    None,
    All,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self::Mode(RollupMode::None)
    }
}

impl RollupConfig {
    /// Converts the config representation into the engine policy.
    pub fn to_policy(&self) -> RollupPolicy {
        match self {
            Self::Mode(RollupMode::None) => RollupPolicy::None,
            Self::Mode(RollupMode::All) => RollupPolicy::All,
            Self::Masks(masks) => RollupPolicy::Masks(masks.clone()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: default_flush_batch_size(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            stage_one_batch_size: default_stage_batch_size(),
            stage_two_batch_size: default_stage_batch_size(),
            max_processing_age: None,
            interval: default_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://statroll.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_flush_batch_size() -> usize {
    500
}

fn default_stage_batch_size() -> u32 {
    5_000
}

fn default_interval() -> Duration {
    Duration::from_secs(300)
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("database.url is required");
        }

        if self.database.max_connections == 0 {
            bail!("database.max_connections must be positive");
        }

        if self.flush.batch_size == 0 {
            bail!("flush.batch_size must be positive");
        }

        if self.aggregation.stage_one_batch_size == 0 {
            bail!("aggregation.stage_one_batch_size must be positive");
        }

        if self.aggregation.stage_two_batch_size == 0 {
            bail!("aggregation.stage_two_batch_size must be positive");
        }

        if self.aggregation.interval.is_zero() {
            bail!("aggregation.interval must be positive");
        }

        // Definition-level checks (duplicates, masks vs tag schemas).
        self.definition_source()?;

        Ok(())
    }

    /// Builds the in-memory statistic definition source from the declared
    /// statistics.
    pub fn definition_source(&self) -> Result<InMemoryDefinitionSource> {
        let definitions: Vec<StatisticDefinition> = self
            .statistics
            .iter()
            .map(|s| StatisticDefinition {
                name: s.name.clone(),
                statistic_type: s.statistic_type,
                tag_names: s.tags.clone(),
                rollup: s.rollup.to_policy(),
            })
            .collect();

        InMemoryDefinitionSource::new(definitions).context("building statistic definitions")
    }
}
