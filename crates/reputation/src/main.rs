use anyhow::Result;
use std::sync::Arc;
use tracing::Instrument;

mod aggregation;
mod badges;
mod classifier;
mod cli;
mod ingestion;
mod jobs;
mod metrics;
mod reputation_scoring;
mod scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("reputation", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let limits = ingestion::SyncLimits {
        page_size: config.ingestion.page_size,
        max_transactions_per_run: config.ingestion.max_transactions_per_run,
    };

    match cmd {
        cli::Command::Run => {}
        cli::Command::Sync { address, chain } => {
            let db = common::db::AsyncDb::open(&config.database.path).await?;
            let clients = Arc::new(jobs::ChainClients::from_config(&config)?);
            let pipeline = jobs::UserPipeline::new(db, clients, limits);
            let outcome = pipeline.sync_user(&address, chain).await?;
            println!("{outcome:#?}");
            return Ok(());
        }
        // Read-only commands use the sync Database and exit immediately.
        other => {
            let db = common::db::Database::open(&config.database.path)?;
            db.run_migrations()?;
            cli::run_command(&db, other)?;
            return Ok(());
        }
    }

    tracing::info!("reputation service starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let clients = Arc::new(jobs::ChainClients::from_config(&config)?);
    let pipeline = Arc::new(jobs::UserPipeline::new(db.clone(), clients, limits));
    let batches = Arc::new(jobs::BatchScheduler::new(
        pipeline,
        jobs::BatchSettings::from(&config.scheduler),
    ));

    let (batch_tx, mut batch_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (wal_checkpoint_tx, mut wal_checkpoint_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Workers first so the immediate tick has a receiver.
    tokio::spawn({
        let batches = batches.clone();
        async move {
            while batch_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "reputation_batch");
                batches.run_scheduled_once().instrument(span).await;
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while wal_checkpoint_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wal_checkpoint");
                if let Err(e) = jobs::run_wal_checkpoint_once(&db).instrument(span).await {
                    tracing::error!(error = %e, "wal_checkpoint failed");
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(vec![
        scheduler::JobSpec {
            name: "reputation_batch".to_string(),
            interval: std::time::Duration::from_secs(config.scheduler.interval_secs),
            tick: batch_tx,
            run_immediately: config.scheduler.run_immediately,
        },
        scheduler::JobSpec {
            name: "wal_checkpoint".to_string(),
            interval: std::time::Duration::from_secs(300),
            tick: wal_checkpoint_tx,
            run_immediately: false,
        },
    ]);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}
