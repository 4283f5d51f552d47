use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

use crate::types::Chain;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub chains: Chains,
    pub ingestion: Ingestion,
    pub scheduler: Scheduler,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Chains {
    pub aptos: ChainNode,
    pub movement: Option<ChainNode>,
}

impl Chains {
    pub fn node(&self, chain: Chain) -> Option<&ChainNode> {
        match chain {
            Chain::Aptos => Some(&self.aptos),
            Chain::Movement => self.movement.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainNode {
    pub node_url: String,
    /// Move type tag of the coin whose `CoinStore` backs the balance read.
    pub coin_type: String,
}

#[derive(Debug, Deserialize)]
pub struct Ingestion {
    pub page_size: u32,
    pub max_transactions_per_run: usize,
    pub request_timeout_secs: u64,
    pub rate_limit_delay_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Scheduler {
    pub interval_secs: u64,
    pub run_immediately: bool,
    pub candidate_limit: u32,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub batch_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")
            .context("failed to read config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.ingestion.page_size > 0, "ingestion.page_size must be > 0");
        anyhow::ensure!(
            self.ingestion.max_transactions_per_run > 0,
            "ingestion.max_transactions_per_run must be > 0"
        );
        anyhow::ensure!(self.scheduler.batch_size > 0, "scheduler.batch_size must be > 0");
        anyhow::ensure!(
            self.scheduler.max_concurrency > 0,
            "scheduler.max_concurrency must be > 0"
        );
        anyhow::ensure!(
            self.scheduler.interval_secs > 0,
            "scheduler.interval_secs must be > 0"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
