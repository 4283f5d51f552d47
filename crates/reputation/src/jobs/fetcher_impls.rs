use anyhow::Result;
use common::config::Config;
use common::move_node::MoveNodeClient;
use common::types::{Chain, RawTransaction};
use std::time::{Duration, Instant};

use super::fetcher_traits::BalanceReader;
use crate::ingestion::TransactionsPager;

/// One fullnode client per configured chain.
pub struct ChainClients {
    aptos: MoveNodeClient,
    movement: Option<MoveNodeClient>,
}

impl ChainClients {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let build = |node: &common::config::ChainNode| {
            MoveNodeClient::new_with_settings(
                &node.node_url,
                &node.coin_type,
                Duration::from_secs(cfg.ingestion.request_timeout_secs),
                Duration::from_millis(cfg.ingestion.rate_limit_delay_ms),
                cfg.ingestion.max_retries,
                Duration::from_millis(cfg.ingestion.backoff_base_ms),
            )
        };
        Ok(Self {
            aptos: build(&cfg.chains.aptos)?,
            movement: cfg.chains.movement.as_ref().map(build).transpose()?,
        })
    }

    fn client(&self, chain: Chain) -> Result<&MoveNodeClient> {
        match chain {
            Chain::Aptos => Ok(&self.aptos),
            Chain::Movement => self
                .movement
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no node configured for {chain}")),
        }
    }
}

fn record_call<T>(endpoint: &'static str, chain: Chain, start: Instant, res: &Result<T>) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("reputation_chain_latency_ms", "endpoint" => endpoint, "chain" => chain.as_str())
        .record(ms);
    let status = if res.is_ok() { "ok" } else { "error" };
    metrics::counter!(
        "reputation_chain_requests_total",
        "endpoint" => endpoint,
        "chain" => chain.as_str(),
        "status" => status
    )
    .increment(1);
}

impl TransactionsPager for ChainClients {
    fn supports_chain(&self, chain: Chain) -> bool {
        self.client(chain).is_ok()
    }

    async fn fetch_account_transactions(
        &self,
        chain: Chain,
        address: &str,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<RawTransaction>> {
        let client = self.client(chain)?;
        let start = Instant::now();
        let res = client.fetch_account_transactions(address, offset, limit).await;
        record_call("account_transactions", chain, start, &res);
        res
    }
}

impl BalanceReader for ChainClients {
    async fn fetch_account_balance(&self, chain: Chain, address: &str) -> Result<Option<u64>> {
        let client = self.client(chain)?;
        let start = Instant::now();
        let res = client.fetch_account_balance(address).await;
        record_call("account_balance", chain, start, &res);
        res
    }
}
