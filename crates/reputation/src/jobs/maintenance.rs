use anyhow::Result;
use common::db::AsyncDb;

/// Fold the WAL back into the main database file and truncate it.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<(i64, i64)> {
    let (busy, log, checkpointed) = db
        .call_named("wal_checkpoint.run", |conn| {
            Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?)
        })
        .await?;

    // Recorded here, on the caller's task, not on the database thread.
    if busy != 0 {
        tracing::warn!(
            busy,
            log,
            checkpointed,
            "WAL checkpoint: database was busy, partial checkpoint"
        );
        metrics::counter!("reputation_wal_checkpoint_total", "status" => "busy").increment(1);
    } else {
        tracing::info!(log, checkpointed, "WAL checkpoint complete");
        metrics::counter!("reputation_wal_checkpoint_total", "status" => "ok").increment(1);
    }
    metrics::gauge!("reputation_wal_checkpoint_pages").set(checkpointed as f64);
    Ok((log, checkpointed))
}
