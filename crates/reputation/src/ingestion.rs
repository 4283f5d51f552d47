use anyhow::{Context, Result};
use common::types::{Chain, RawTransaction};
use rusqlite::Connection;
use std::collections::HashSet;

pub trait TransactionsPager {
    fn supports_chain(&self, chain: Chain) -> bool;

    fn fetch_account_transactions(
        &self,
        chain: Chain,
        address: &str,
        offset: u64,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RawTransaction>>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct SyncLimits {
    pub page_size: u32,
    pub max_transactions_per_run: usize,
}

#[derive(Debug, Default)]
pub struct NewTransactions {
    /// Ascending by version, all strictly above the starting cursor.
    pub transactions: Vec<RawTransaction>,
    pub pages: u64,
}

/// Highest version already stored for the user, 0 if none.
pub fn read_cursor(conn: &Connection, user: &str, chain: Chain) -> Result<u64> {
    let v: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM transaction_records WHERE user_address = ?1 AND chain = ?2",
        rusqlite::params![user, chain.as_str()],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(v).unwrap_or(0))
}

/// Page through the source collecting transactions newer than `cursor`.
///
/// Stops on an empty or short page, on a page with nothing new once something
/// new was found, or when the per-run cap is reached. Any source error aborts
/// the whole run and nothing collected so far is returned.
pub async fn collect_new_transactions<P: TransactionsPager + Sync>(
    pager: &P,
    chain: Chain,
    address: &str,
    cursor: u64,
    limits: SyncLimits,
) -> Result<NewTransactions> {
    let mut offset = 0_u64;
    let mut pages = 0_u64;
    let mut found: Vec<RawTransaction> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();

    loop {
        let page = pager
            .fetch_account_transactions(chain, address, offset, limits.page_size)
            .await
            .with_context(|| format!("fetching transactions for {address} at offset {offset}"))?;
        pages += 1;

        if page.is_empty() {
            break;
        }
        let page_len = page.len();

        let fresh: Vec<RawTransaction> = page
            .into_iter()
            .filter(|tx| {
                let v = tx.version_number();
                v > cursor && seen.insert(v)
            })
            .collect();

        // Past the new-transaction window: everything further is stale.
        if fresh.is_empty() && !found.is_empty() {
            break;
        }
        found.extend(fresh);

        if found.len() >= limits.max_transactions_per_run {
            break;
        }
        if page_len < limits.page_size as usize {
            break;
        }
        offset += u64::from(limits.page_size);
    }

    found.sort_by_key(RawTransaction::version_number);
    found.truncate(limits.max_transactions_per_run);

    tracing::debug!(
        address,
        chain = %chain,
        cursor,
        pages,
        new = found.len(),
        "collected new transactions"
    );

    Ok(NewTransactions {
        transactions: found,
        pages,
    })
}
