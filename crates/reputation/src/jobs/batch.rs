use common::config::Scheduler as SchedulerConfig;
use common::types::UserKey;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::fetcher_traits::BalanceReader;
use super::pipeline::{UserPipeline, UserRunOutcome};
use crate::aggregation::select_candidates;
use crate::ingestion::TransactionsPager;
use crate::reputation_scoring::{NoSocialSignals, SocialSignals};

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub candidate_limit: u32,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub batch_delay: Duration,
}

impl From<&SchedulerConfig> for BatchSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            candidate_limit: cfg.candidate_limit,
            batch_size: cfg.batch_size.max(1),
            max_concurrency: cfg.max_concurrency.max(1),
            batch_delay: Duration::from_millis(cfg.batch_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Clears the single-flight flag when the run ends, however it ends.
pub struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Fans the user pipeline out over many users.
pub struct BatchScheduler<S, G = NoSocialSignals> {
    pipeline: Arc<UserPipeline<S, G>>,
    settings: BatchSettings,
    running: AtomicBool,
}

impl<S, G> BatchScheduler<S, G>
where
    S: TransactionsPager + BalanceReader + Send + Sync,
    G: SocialSignals + Send + Sync,
{
    pub fn new(pipeline: Arc<UserPipeline<S, G>>, settings: BatchSettings) -> Self {
        Self {
            pipeline,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// `None` while another scheduled run holds the flag.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                flag: &self.running,
            })
    }

    /// Every candidate is attempted; one user's failure never stops the others.
    pub async fn sync_batch(&self, candidates: &[UserKey]) -> BatchReport {
        let mut report = BatchReport::default();

        for (i, chunk) in candidates.chunks(self.settings.batch_size).enumerate() {
            if i > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let runs = chunk.iter().cloned().map(|key| {
                let pipeline = Arc::clone(&self.pipeline);
                async move { pipeline.sync_candidate(&key).await }
            });
            let outcomes: Vec<UserRunOutcome> = futures_util::stream::iter(runs)
                .buffer_unordered(self.settings.max_concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                report.attempted += 1;
                if outcome.is_completed() {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
            }
            tracing::debug!(batch = i, users = chunk.len(), "batch settled");
        }

        report
    }

    pub async fn run_scheduled_once(&self) -> Option<BatchReport> {
        let Some(_guard) = self.try_begin() else {
            tracing::info!("previous reputation run still in progress; skipping");
            metrics::counter!("reputation_batch_runs_total", "status" => "skipped").increment(1);
            return None;
        };

        let limit = self.settings.candidate_limit;
        let candidates = match self
            .pipeline
            .db()
            .call_named("users.select_candidates", move |conn| select_candidates(conn, limit))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to select candidates");
                metrics::counter!("reputation_batch_runs_total", "status" => "error").increment(1);
                return Some(BatchReport::default());
            }
        };

        let report = self.sync_batch(&candidates).await;
        metrics::counter!("reputation_batch_runs_total", "status" => "ok").increment(1);
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "reputation batch done"
        );
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::pipeline::tests::{alice_ledger, limits, norm, FakeChain, ALICE, BOB};
    use common::db::AsyncDb;
    use common::types::{Chain, RawTransaction};
    use std::sync::atomic::AtomicUsize;

    const CAROL: &str = "0xca401";

    fn settings(batch_size: usize) -> BatchSettings {
        BatchSettings {
            candidate_limit: 100,
            batch_size,
            max_concurrency: 2,
            batch_delay: Duration::ZERO,
        }
    }

    async fn scheduler(chain: FakeChain, batch_size: usize) -> BatchScheduler<FakeChain> {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let pipeline = Arc::new(UserPipeline::new(db, Arc::new(chain), limits()));
        BatchScheduler::new(pipeline, settings(batch_size))
    }

    #[tokio::test]
    async fn test_one_failing_user_does_not_affect_others() {
        let chain = FakeChain::default()
            .with_ledger(ALICE, alice_ledger())
            .with_ledger(BOB, alice_ledger())
            .with_ledger(CAROL, alice_ledger());
        chain.fail_for(BOB);
        let s = scheduler(chain, 2).await;

        let candidates: Vec<UserKey> = [ALICE, BOB, CAROL]
            .iter()
            .map(|a| UserKey::new(norm(a), Chain::Aptos))
            .collect();
        let report = s.sync_batch(&candidates).await;
        assert_eq!(
            report,
            BatchReport {
                attempted: 3,
                succeeded: 2,
                failed: 1
            }
        );

        let bob = norm(BOB);
        let bob_records: i64 = s
            .pipeline
            .db()
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM transaction_records WHERE user_address = ?1",
                    [bob],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(bob_records, 0);
    }

    #[tokio::test]
    async fn test_invalid_candidate_counts_as_failed() {
        let s = scheduler(FakeChain::default(), 10).await;
        let candidates = vec![
            UserKey::new("garbage", Chain::Aptos),
            UserKey::new(norm(ALICE), Chain::Movement),
        ];
        let report = s.sync_batch(&candidates).await;
        assert_eq!((report.attempted, report.failed), (2, 2));
    }

    #[tokio::test]
    async fn test_scheduled_run_uses_registered_users() {
        let s = scheduler(
            FakeChain::default()
                .with_ledger(ALICE, alice_ledger())
                .with_ledger(BOB, alice_ledger()),
            1,
        )
        .await;
        s.pipeline.sync_user(ALICE, Chain::Aptos).await.unwrap();
        s.pipeline.sync_user(BOB, Chain::Aptos).await.unwrap();

        let report = s.run_scheduled_once().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn test_overlapping_scheduled_run_is_skipped() {
        let s = scheduler(FakeChain::default(), 10).await;

        let guard = s.try_begin().unwrap();
        assert!(s.try_begin().is_none());
        assert!(s.run_scheduled_once().await.is_none());

        drop(guard);
        assert_eq!(s.run_scheduled_once().await, Some(BatchReport::default()));
    }

    #[tokio::test]
    async fn test_scheduled_run_on_spawned_task() {
        let s = Arc::new(scheduler(FakeChain::default().with_ledger(ALICE, alice_ledger()), 2).await);
        s.pipeline.sync_user(ALICE, Chain::Aptos).await.unwrap();

        let handle = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.run_scheduled_once().await }
        });
        let report = handle.await.unwrap().unwrap();
        assert_eq!((report.attempted, report.succeeded), (1, 1));
    }

    /// Empty ledgers that take a while to answer and record how many callers overlap.
    #[derive(Default)]
    struct SlowChain {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TransactionsPager for SlowChain {
        fn supports_chain(&self, chain: Chain) -> bool {
            chain == Chain::Aptos
        }

        async fn fetch_account_transactions(
            &self,
            _chain: Chain,
            _address: &str,
            _offset: u64,
            _limit: u32,
        ) -> anyhow::Result<Vec<RawTransaction>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    impl BalanceReader for SlowChain {
        async fn fetch_account_balance(&self, _chain: Chain, _address: &str) -> anyhow::Result<Option<u64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_users_in_flight_bounded_by_max_concurrency() {
        let chain = Arc::new(SlowChain::default());
        let db = AsyncDb::open(":memory:").await.unwrap();
        let pipeline = Arc::new(UserPipeline::new(db, Arc::clone(&chain), limits()));
        let s = BatchScheduler::new(pipeline, settings(6));

        let candidates: Vec<UserKey> = (1..=6)
            .map(|i| UserKey::new(norm(&format!("0x{i}")), Chain::Aptos))
            .collect();
        let report = s.sync_batch(&candidates).await;

        assert_eq!(report.succeeded, 6);
        let peak = chain.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak in-flight users {peak}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_batches() {
        let chain = FakeChain::default()
            .with_ledger(ALICE, alice_ledger())
            .with_ledger(BOB, alice_ledger());
        let db = AsyncDb::open(":memory:").await.unwrap();
        let pipeline = Arc::new(UserPipeline::new(db, Arc::new(chain), limits()));
        let s = BatchScheduler::new(
            pipeline,
            BatchSettings {
                batch_delay: Duration::from_secs(30),
                ..settings(1)
            },
        );

        let candidates: Vec<UserKey> = [ALICE, BOB]
            .iter()
            .map(|a| UserKey::new(norm(a), Chain::Aptos))
            .collect();
        let start = tokio::time::Instant::now();
        let report = s.sync_batch(&candidates).await;
        assert_eq!(report.succeeded, 2);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
