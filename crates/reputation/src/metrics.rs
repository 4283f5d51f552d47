use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "reputation_chain_requests_total",
        "Fullnode requests by endpoint and status."
    );
    describe_histogram!(
        "reputation_chain_latency_ms",
        "Fullnode request latency in milliseconds."
    );
    describe_counter!(
        "reputation_transactions_ingested_total",
        "Transaction records written."
    );
    describe_counter!(
        "reputation_user_runs_total",
        "Per-user pipeline runs by outcome."
    );
    describe_counter!(
        "reputation_batch_runs_total",
        "Scheduled batch runs by outcome."
    );
    describe_counter!("reputation_badges_earned_total", "Badges newly earned.");
    describe_counter!(
        "reputation_scheduler_ticks_total",
        "Scheduler ticks by job and delivery outcome."
    );
    describe_histogram!("reputation_score_total", "Computed total reputation scores.");
    describe_counter!(
        "reputation_wal_checkpoint_total",
        "WAL checkpoints by outcome."
    );
    describe_gauge!(
        "reputation_wal_checkpoint_pages",
        "Pages folded back by the last WAL checkpoint."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}
