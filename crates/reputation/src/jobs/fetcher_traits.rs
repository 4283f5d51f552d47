use anyhow::Result;
use common::types::Chain;

/// Live gas-coin balance, read at scoring time rather than from the store.
pub trait BalanceReader {
    /// Base units, `None` when the account holds no coin store.
    fn fetch_account_balance(
        &self,
        chain: Chain,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Option<u64>>> + Send;
}
