//! Configuration management for the swap relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::ChainSide;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming the config file
pub const CONFIG_ENV: &str = "SWAP_RELAYER_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Keyed by side: `a` and `b`
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub ingest_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub price_refresh_interval_ms: u64,
    pub timeout_sweep_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub gateway_timeout_ms: u64,
    pub new_order_channel_capacity: usize,
    pub max_concurrent_reconciliations: usize,
    pub pending_command_timeout_secs: u64,
    pub destination_timelock_margin_secs: u64,
    /// Also settle the destination leg once the secret is public
    #[serde(default = "default_true")]
    pub relay_destination_withdraw: bool,
    pub health_check_interval_secs: u64,
}

impl RelayerConfig {
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn price_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.price_refresh_interval_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: "swap-relayer-1".to_string(),
            ingest_interval_ms: 2_000,
            reconcile_interval_ms: 5_000,
            price_refresh_interval_ms: 10_000,
            timeout_sweep_interval_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            gateway_timeout_ms: 30_000,
            new_order_channel_capacity: 100,
            max_concurrent_reconciliations: 16,
            pending_command_timeout_secs: 300,
            destination_timelock_margin_secs: 3_600,
            relay_destination_withdraw: true,
            health_check_interval_secs: 30,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Absent means state is kept in memory only
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// In-process ledger, for local runs and tests
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    pub name: String,
    pub kind: ChainKind,
    pub confirmation_blocks: u64,
    pub enabled: bool,
}

impl Settings {
    /// Load settings from the file named by `SWAP_RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let a = self
            .chain(ChainSide::A)
            .context("Chain `a` must be configured")?;
        let b = self
            .chain(ChainSide::B)
            .context("Chain `b` must be configured")?;
        if !a.enabled || !b.enabled {
            anyhow::bail!("Both chains must be enabled");
        }
        if a.chain_id == b.chain_id {
            anyhow::bail!("Chains a and b share chain id {}", a.chain_id);
        }
        for (name, chain) in &self.chains {
            if name != "a" && name != "b" {
                anyhow::bail!("Unknown chain section `{}`; expected `a` or `b`", name);
            }
            if chain.chain_id.is_empty() {
                anyhow::bail!("Chain {} has an empty chain id", name);
            }
        }

        let r = &self.relayer;
        let intervals = [
            ("ingest_interval_ms", r.ingest_interval_ms),
            ("reconcile_interval_ms", r.reconcile_interval_ms),
            ("price_refresh_interval_ms", r.price_refresh_interval_ms),
            ("timeout_sweep_interval_ms", r.timeout_sweep_interval_ms),
            ("gateway_timeout_ms", r.gateway_timeout_ms),
            ("health_check_interval_secs", r.health_check_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("relayer.{} must be non-zero", name);
            }
        }
        if r.new_order_channel_capacity == 0 {
            anyhow::bail!("relayer.new_order_channel_capacity must be non-zero");
        }
        if r.max_concurrent_reconciliations == 0 {
            anyhow::bail!("relayer.max_concurrent_reconciliations must be non-zero");
        }
        if r.max_retries == 0 {
            anyhow::bail!("relayer.max_retries must be at least 1");
        }
        if r.max_retry_delay_ms < r.retry_delay_ms {
            anyhow::bail!("relayer.max_retry_delay_ms must not be below retry_delay_ms");
        }

        Ok(())
    }

    pub fn chain(&self, side: ChainSide) -> Option<&ChainConfig> {
        self.chains.get(side.as_str())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
