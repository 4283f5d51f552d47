use anyhow::Result;
use common::db::AsyncDb;
use common::types::{normalize_address, Chain, DataType, ScoreSnapshot, TransactionRecord, UserKey};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

use super::fetcher_traits::BalanceReader;
use super::tracker::SyncStatusTracker;
use crate::aggregation::{ingest_batch, upsert_user};
use crate::badges::evaluate_and_store;
use crate::classifier::{classify, BASE_UNITS_PER_COIN};
use crate::ingestion::{collect_new_transactions, read_cursor, SyncLimits, TransactionsPager};
use crate::reputation_scoring::{
    build_snapshot, compute_breakdown, load_score_inputs, read_current_score, write_score,
    NoSocialSignals, SocialSignals,
};

/// Errors raised to the caller before any pipeline work starts.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("no chain source configured for {0}")]
    ChainNotConfigured(Chain),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRunReport {
    pub fetched: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub cursor: u64,
    pub badges_earned: usize,
    pub total: f64,
    pub grade: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserRunOutcome {
    Completed(UserRunReport),
    Failed { stage: DataType, error: String },
}

impl UserRunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TransactionsStage {
    fetched: usize,
    inserted: u64,
    skipped: u64,
    cursor: u64,
}

/// Transactions, then badges, then score, for one user at a time.
pub struct UserPipeline<S, G = NoSocialSignals> {
    db: AsyncDb,
    source: Arc<S>,
    social: G,
    limits: SyncLimits,
}

impl<S> UserPipeline<S, NoSocialSignals>
where
    S: TransactionsPager + BalanceReader + Send + Sync,
{
    pub fn new(db: AsyncDb, source: Arc<S>, limits: SyncLimits) -> Self {
        Self::new_with_social(db, source, limits, NoSocialSignals)
    }
}

impl<S, G> UserPipeline<S, G>
where
    S: TransactionsPager + BalanceReader + Send + Sync,
    G: SocialSignals + Send + Sync,
{
    pub fn new_with_social(db: AsyncDb, source: Arc<S>, limits: SyncLimits, social: G) -> Self {
        Self {
            db,
            source,
            social,
            limits,
        }
    }

    pub fn db(&self) -> &AsyncDb {
        &self.db
    }

    fn validate(&self, address: &str, chain: Chain) -> Result<String, TriggerError> {
        let user = normalize_address(address)
            .ok_or_else(|| TriggerError::InvalidAddress(address.to_string()))?;
        if !self.source.supports_chain(chain) {
            return Err(TriggerError::ChainNotConfigured(chain));
        }
        Ok(user)
    }

    /// On-demand entry point. Registers the user, then runs the full pipeline.
    pub async fn sync_user(&self, address: &str, chain: Chain) -> Result<UserRunOutcome, TriggerError> {
        let user = self.validate(address, chain)?;
        let u = user.clone();
        self.db
            .call_named("users.upsert", move |conn| upsert_user(conn, &u, chain))
            .await?;
        Ok(self.run(&user, chain).await)
    }

    /// Scheduled entry point. Never fails; invalid candidates count as failed runs.
    pub async fn sync_candidate(&self, key: &UserKey) -> UserRunOutcome {
        match self.validate(&key.address, key.chain) {
            Ok(user) => self.run(&user, key.chain).await,
            Err(e) => {
                tracing::warn!(user = %key.address, chain = %key.chain, error = %e, "skipping candidate");
                metrics::counter!("reputation_user_runs_total", "status" => "failed").increment(1);
                UserRunOutcome::Failed {
                    stage: DataType::Transactions,
                    error: e.to_string(),
                }
            }
        }
    }

    pub async fn get_current_score(
        &self,
        address: &str,
        chain: Chain,
    ) -> Result<Option<ScoreSnapshot>, TriggerError> {
        let user = normalize_address(address)
            .ok_or_else(|| TriggerError::InvalidAddress(address.to_string()))?;
        let snapshot = self
            .db
            .call_named("scoring.read_current", move |conn| read_current_score(conn, &user, chain))
            .await?;
        Ok(snapshot)
    }

    async fn run(&self, user: &str, chain: Chain) -> UserRunOutcome {
        let span = tracing::info_span!("user_run", user, chain = %chain);
        let outcome = self.run_stages(user, chain).instrument(span).await;
        match &outcome {
            UserRunOutcome::Completed(r) => {
                metrics::counter!("reputation_user_runs_total", "status" => "completed").increment(1);
                tracing::info!(
                    user,
                    chain = %chain,
                    fetched = r.fetched,
                    inserted = r.inserted,
                    skipped = r.skipped,
                    cursor = r.cursor,
                    badges_earned = r.badges_earned,
                    total = r.total,
                    grade = %r.grade,
                    "user run completed"
                );
            }
            UserRunOutcome::Failed { stage, error } => {
                metrics::counter!("reputation_user_runs_total", "status" => "failed").increment(1);
                tracing::warn!(user, chain = %chain, stage = stage.as_str(), error = %error, "user run failed");
            }
        }
        outcome
    }

    async fn run_stages(&self, user: &str, chain: Chain) -> UserRunOutcome {
        let failed = |stage: DataType, e: anyhow::Error| UserRunOutcome::Failed {
            stage,
            error: format!("{e:#}"),
        };

        let txs = match self
            .tracked(user, chain, DataType::Transactions, self.sync_transactions(user, chain))
            .await
        {
            Ok(t) => t,
            Err(e) => return failed(DataType::Transactions, e),
        };

        let u = user.to_string();
        let badges = match self
            .tracked(user, chain, DataType::Badges, async {
                self.db
                    .call_named("badges.evaluate", move |conn| evaluate_and_store(conn, &u, chain))
                    .await
            })
            .await
        {
            Ok(b) => b,
            Err(e) => return failed(DataType::Badges, e),
        };
        metrics::counter!("reputation_badges_earned_total").increment(badges.newly_earned as u64);

        let score = match self
            .tracked(user, chain, DataType::Score, self.compute_score(user, chain))
            .await
        {
            Ok(s) => s,
            Err(e) => return failed(DataType::Score, e),
        };

        UserRunOutcome::Completed(UserRunReport {
            fetched: txs.fetched,
            inserted: txs.inserted,
            skipped: txs.skipped,
            cursor: txs.cursor,
            badges_earned: badges.earned,
            total: score.total,
            grade: score.grade,
        })
    }

    /// Bracket one stage with its `sync_status` row.
    async fn tracked<T, F>(&self, user: &str, chain: Chain, data_type: DataType, stage: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let tracker = SyncStatusTracker::start(&self.db, user, chain, data_type).await?;
        match stage.await {
            Ok(v) => {
                // The stage has already committed; a lost status write does not undo it.
                if let Err(te) = tracker.complete().await {
                    tracing::error!(user, stage = data_type.as_str(), error = %te, "failed to record sync status");
                }
                Ok(v)
            }
            Err(e) => {
                if let Err(te) = tracker.fail(&e).await {
                    tracing::error!(user, stage = data_type.as_str(), error = %te, "failed to record sync status");
                }
                Err(e)
            }
        }
    }

    async fn sync_transactions(&self, user: &str, chain: Chain) -> Result<TransactionsStage> {
        let u = user.to_string();
        let cursor = self
            .db
            .call_named("ingestion.read_cursor", move |conn| read_cursor(conn, &u, chain))
            .await?;

        let fresh = collect_new_transactions(self.source.as_ref(), chain, user, cursor, self.limits).await?;
        tracing::debug!(cursor, pages = fresh.pages, new = fresh.transactions.len(), "transactions fetched");
        let records: Vec<TransactionRecord> = fresh
            .transactions
            .iter()
            .map(|tx| classify(tx, user, chain))
            .collect();
        if records.is_empty() {
            return Ok(TransactionsStage {
                cursor,
                ..Default::default()
            });
        }

        let new_cursor = records.iter().map(|r| r.version).max().unwrap_or(cursor).max(cursor);
        let fetched = records.len();

        // Records and both aggregates commit together; the cursor is derived from
        // stored records, so a failed write leaves it where it was.
        let u = user.to_string();
        let inserted = self
            .db
            .call_named("aggregation.ingest_batch", move |conn| ingest_batch(conn, &u, chain, &records))
            .await?;

        metrics::counter!("reputation_transactions_ingested_total").increment(inserted.inserted);
        Ok(TransactionsStage {
            fetched,
            inserted: inserted.inserted,
            skipped: inserted.skipped,
            cursor: new_cursor,
        })
    }

    async fn compute_score(&self, user: &str, chain: Chain) -> Result<ScoreSnapshot> {
        let balance = self.source.fetch_account_balance(chain, user).await?;

        let u = user.to_string();
        let mut inputs = self
            .db
            .call_named("scoring.load_inputs", move |conn| load_score_inputs(conn, &u, chain))
            .await?;
        inputs.balance = balance.map(|b| b as f64 / BASE_UNITS_PER_COIN);

        let now = chrono::Utc::now();
        let breakdown = compute_breakdown(&inputs, self.social.social_score(user, chain), now.timestamp());
        let snapshot = build_snapshot(
            user,
            chain,
            &breakdown,
            now.format("%Y-%m-%d %H:%M:%S").to_string(),
        );

        let s = snapshot.clone();
        self.db
            .call_named("scoring.write", move |conn| write_score(conn, &s))
            .await?;
        metrics::histogram!("reputation_score_total").record(snapshot.total);
        Ok(snapshot)
    }
}
