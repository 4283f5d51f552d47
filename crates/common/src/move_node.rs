use crate::types::RawTransaction;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Read-only client for an Aptos-style Move fullnode REST API.
pub struct MoveNodeClient {
    node_url: String,
    coin_type: String,
    client: reqwest::Client,
    rate_limit_delay: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

#[derive(Debug, Deserialize)]
struct CoinStoreResource {
    data: CoinStoreData,
}

#[derive(Debug, Deserialize)]
struct CoinStoreData {
    coin: CoinValue,
}

#[derive(Debug, Deserialize)]
struct CoinValue {
    value: String,
}

impl MoveNodeClient {
    pub fn new(node_url: &str, coin_type: &str) -> Result<Self> {
        Self::new_with_settings(
            node_url,
            coin_type,
            Duration::from_secs(15),
            Duration::ZERO,
            3,
            Duration::from_millis(500),
        )
    }

    pub fn new_with_settings(
        node_url: &str,
        coin_type: &str,
        timeout: Duration,
        rate_limit_delay: Duration,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            node_url: node_url.trim_end_matches('/').to_string(),
            coin_type: coin_type.to_string(),
            client,
            rate_limit_delay,
            max_retries,
            backoff_base,
        })
    }

    pub fn account_transactions_url(&self, address: &str, start: u64, limit: u32) -> String {
        format!(
            "{}/v1/accounts/{}/transactions?start={start}&limit={limit}",
            self.node_url,
            urlencoding::encode(address)
        )
    }

    pub fn balance_url(&self, address: &str) -> String {
        let resource = format!("0x1::coin::CoinStore<{}>", self.coin_type);
        format!(
            "{}/v1/accounts/{}/resource/{}",
            self.node_url,
            urlencoding::encode(address),
            urlencoding::encode(&resource)
        )
    }

    /// One page of the account's transactions in ascending sequence order.
    /// An account the node has never seen yields an empty page.
    pub async fn fetch_account_transactions(
        &self,
        address: &str,
        start: u64,
        limit: u32,
    ) -> Result<Vec<RawTransaction>> {
        let url = self.account_transactions_url(address, start, limit);
        let Some(body) = self.get_with_retry(&url).await? else {
            return Ok(vec![]);
        };
        serde_json::from_slice(&body)
            .with_context(|| format!("failed to deserialize transactions page from {url}"))
    }

    /// Gas-coin balance in base units, `None` if the account has no `CoinStore`.
    pub async fn fetch_account_balance(&self, address: &str) -> Result<Option<u64>> {
        let url = self.balance_url(address);
        let Some(body) = self.get_with_retry(&url).await? else {
            return Ok(None);
        };
        let resource: CoinStoreResource = serde_json::from_slice(&body)
            .with_context(|| format!("failed to deserialize CoinStore from {url}"))?;
        let value = resource
            .data
            .coin
            .value
            .parse::<u64>()
            .with_context(|| format!("non-numeric coin value from {url}"))?;
        Ok(Some(value))
    }

    /// GET with bounded retry on transport errors, 429 and 5xx.
    /// Returns `Ok(None)` on 404.
    async fn get_with_retry(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let mut attempt = 0_u32;
        loop {
            if !self.rate_limit_delay.is_zero() {
                tokio::time::sleep(self.rate_limit_delay).await;
            }

            let outcome = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .with_context(|| format!("failed to read body from {url}"))?;
                        return Ok(Some(body.to_vec()));
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let err = anyhow::anyhow!("node returned {status} for {url}: {body}");
                    if !retryable {
                        return Err(err);
                    }
                    err
                }
                Err(e) => anyhow::Error::from(e).context(format!("request to {url} failed")),
            };

            if attempt >= self.max_retries {
                return Err(outcome.context(format!("giving up after {} attempts", attempt + 1)));
            }
            let wait = self.backoff_base * 2_u32.saturating_pow(attempt);
            tracing::warn!(url, attempt, wait_ms = wait.as_millis() as u64, error = %outcome, "node request failed; retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
