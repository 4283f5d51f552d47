use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A periodic trigger feeding one worker loop.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    /// Fire once at startup instead of waiting a full interval.
    pub run_immediately: bool,
}

/// Result of offering one tick to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickDelivery {
    Sent,
    /// The worker already has a tick queued; this one is folded into it.
    Coalesced,
    Closed,
}

fn deliver(job: &JobSpec) -> TickDelivery {
    match job.tick.try_send(()) {
        Ok(()) => TickDelivery::Sent,
        Err(TrySendError::Full(())) => TickDelivery::Coalesced,
        Err(TrySendError::Closed(())) => TickDelivery::Closed,
    }
}

async fn drive(job: JobSpec) {
    let first = if job.run_immediately {
        Instant::now()
    } else {
        Instant::now() + job.interval
    };
    let mut interval = tokio::time::interval_at(first, job.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = job.tick.closed() => break,
        }
        let delivery = deliver(&job);
        let outcome = match delivery {
            TickDelivery::Sent => "sent",
            TickDelivery::Coalesced => "coalesced",
            TickDelivery::Closed => "closed",
        };
        metrics::counter!("reputation_scheduler_ticks_total", "job" => job.name.clone(), "outcome" => outcome)
            .increment(1);
        tracing::debug!(job = %job.name, outcome, "scheduler tick");
        if delivery == TickDelivery::Closed {
            break;
        }
    }
    tracing::info!(job = %job.name, "scheduler stopped; worker gone");
}

/// Spawns one ticker per job. A ticker ends when its worker drops the receiver.
pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter().map(|job| tokio::spawn(drive(job))).collect()
}
