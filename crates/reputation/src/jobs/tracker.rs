use anyhow::Result;
use common::db::AsyncDb;
use common::types::{Chain, DataType, SyncState};
use rusqlite::Connection;
use serde::Serialize;
use std::time::Instant;

/// Records one pipeline stage for one user in `sync_status`.
pub struct SyncStatusTracker {
    db: AsyncDb,
    user: String,
    chain: Chain,
    data_type: DataType,
    start_time: Instant,
}

impl SyncStatusTracker {
    pub async fn start(db: &AsyncDb, user: &str, chain: Chain, data_type: DataType) -> Result<Self> {
        let u = user.to_string();
        db.call_named("sync_status.start", move |conn| {
            conn.execute(
                "INSERT INTO sync_status (user_address, chain, data_type, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(user_address, chain, data_type) DO UPDATE SET
                    status = excluded.status,
                    error_message = NULL,
                    duration_ms = NULL,
                    updated_at = datetime('now')",
                rusqlite::params![u, chain.as_str(), data_type.as_str(), SyncState::Pending.as_str()],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            user: user.to_string(),
            chain,
            data_type,
            start_time: Instant::now(),
        })
    }

    async fn finish(self, state: SyncState, error: Option<String>) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let Self {
            db,
            user,
            chain,
            data_type,
            ..
        } = self;

        db.call_named("sync_status.finish", move |conn| {
            conn.execute(
                "UPDATE sync_status SET
                    status = ?4,
                    last_sync_at = datetime('now'),
                    error_message = ?5,
                    duration_ms = ?6,
                    updated_at = datetime('now')
                 WHERE user_address = ?1 AND chain = ?2 AND data_type = ?3",
                rusqlite::params![
                    user,
                    chain.as_str(),
                    data_type.as_str(),
                    state.as_str(),
                    error,
                    duration_ms
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn complete(self) -> Result<()> {
        self.finish(SyncState::Completed, None).await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        self.finish(SyncState::Failed, Some(format!("{error:#}"))).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusRow {
    pub data_type: String,
    pub status: String,
    pub last_sync_at: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

pub fn read_sync_status(conn: &Connection, user: &str, chain: Chain) -> Result<Vec<SyncStatusRow>> {
    let mut stmt = conn.prepare(
        "SELECT data_type, status, last_sync_at, error_message, duration_ms
         FROM sync_status WHERE user_address = ?1 AND chain = ?2
         ORDER BY CASE data_type WHEN 'transactions' THEN 0 WHEN 'badges' THEN 1 ELSE 2 END",
    )?;
    let rows = stmt.query_map(rusqlite::params![user, chain.as_str()], |row| {
        Ok(SyncStatusRow {
            data_type: row.get(0)?,
            status: row.get(1)?,
            last_sync_at: row.get(2)?,
            error_message: row.get(3)?,
            duration_ms: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
