use anyhow::Result;
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Startup migrations need the write lock. A CLI `reputation sync` or an
        // admin sqlite3 session may hold it; retry with backoff instead of
        // crash-looping under systemd. Each attempt uses a short busy_timeout so
        // the backoff happens here.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// Measures wall-clock time including queueing on the SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "reputation_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "reputation_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("reputation_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Readers share the file with the running service.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    address TEXT NOT NULL,             -- normalized 0x + 64 hex
    chain TEXT NOT NULL,               -- aptos, movement
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    PRIMARY KEY (address, chain)
);

CREATE TABLE IF NOT EXISTS transaction_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain TEXT NOT NULL,
    user_address TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    version INTEGER NOT NULL,          -- ledger version, monotonic per chain
    function_name TEXT NOT NULL,       -- address::module::function
    protocol_address TEXT NOT NULL,    -- empty when no entry function
    protocol_name TEXT NOT NULL,
    protocol_category TEXT NOT NULL,
    amount REAL NOT NULL,              -- display units
    token_symbol TEXT NOT NULL,
    operation_type TEXT NOT NULL,      -- basic, advanced, complex
    complexity_level INTEGER NOT NULL, -- 1..3
    gas_used INTEGER NOT NULL,
    success INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,        -- unix epoch seconds
    raw_json TEXT,                     -- original node response
    ingested_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(chain, tx_hash)
);

CREATE TABLE IF NOT EXISTS activity_aggregates (
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    total_transactions INTEGER NOT NULL,
    active_days INTEGER NOT NULL,
    longest_streak INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL,
    last_activity_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_address, chain)
);

CREATE TABLE IF NOT EXISTS protocol_aggregates (
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    protocol_address TEXT NOT NULL,
    protocol_name TEXT NOT NULL,
    protocol_category TEXT NOT NULL,
    interaction_count INTEGER NOT NULL,
    total_volume REAL NOT NULL,
    first_interaction_at INTEGER NOT NULL,
    last_interaction_at INTEGER NOT NULL,
    is_deep_interaction INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_address, chain, protocol_address)
);

CREATE TABLE IF NOT EXISTS badge_records (
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    badge_id TEXT NOT NULL,
    earned INTEGER NOT NULL DEFAULT 0, -- never goes back to 0
    progress REAL NOT NULL DEFAULT 0,  -- 0..100
    earned_at TEXT,                    -- set once
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_address, chain, badge_id)
);

CREATE TABLE IF NOT EXISTS score_snapshots (
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    longevity REAL NOT NULL,
    balance REAL NOT NULL,
    activity REAL NOT NULL,
    diversity REAL NOT NULL,
    volume REAL NOT NULL,
    complexity REAL NOT NULL,
    social REAL NOT NULL,
    total REAL NOT NULL,
    grade TEXT NOT NULL,
    calculated_at TEXT NOT NULL,
    PRIMARY KEY (user_address, chain)
);

CREATE TABLE IF NOT EXISTS score_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    longevity REAL NOT NULL,
    balance REAL NOT NULL,
    activity REAL NOT NULL,
    diversity REAL NOT NULL,
    volume REAL NOT NULL,
    complexity REAL NOT NULL,
    social REAL NOT NULL,
    total REAL NOT NULL,
    grade TEXT NOT NULL,
    calculated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_status (
    user_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    data_type TEXT NOT NULL,           -- transactions, badges, score
    status TEXT NOT NULL,              -- pending, completed, failed
    last_sync_at TEXT,
    error_message TEXT,
    duration_ms INTEGER,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_address, chain, data_type)
);

CREATE INDEX IF NOT EXISTS idx_users_updated_at ON users(updated_at);
CREATE INDEX IF NOT EXISTS idx_transaction_records_user_version ON transaction_records(user_address, chain, version);
CREATE INDEX IF NOT EXISTS idx_transaction_records_user_timestamp ON transaction_records(user_address, chain, timestamp);
CREATE INDEX IF NOT EXISTS idx_score_history_user ON score_history(user_address, chain, calculated_at);
CREATE INDEX IF NOT EXISTS idx_sync_status_status ON sync_status(status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_all_tables() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        for t in [
            "users",
            "transaction_records",
            "activity_aggregates",
            "protocol_aggregates",
            "badge_records",
            "score_snapshots",
            "score_history",
            "sync_status",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_tx_hash_unique_per_chain() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let insert = "INSERT INTO transaction_records
            (chain, user_address, tx_hash, version, function_name, protocol_address, protocol_name,
             protocol_category, amount, token_symbol, operation_type, complexity_level, gas_used, success, timestamp)
            VALUES (?1, '0xu', '0xh', 1, '', '', '', 'other', 0, 'APT', 'basic', 1, 0, 1, 0)";
        db.conn.execute(insert, ["aptos"]).unwrap();
        assert!(db.conn.execute(insert, ["aptos"]).is_err());
        // Same hash on another chain is a different transaction.
        db.conn.execute(insert, ["movement"]).unwrap();
    }

    #[tokio::test]
    async fn test_async_db_open_runs_migrations() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"transaction_records".to_string()));
        assert!(tables.contains(&"score_snapshots".to_string()));
    }

    #[tokio::test]
    async fn test_async_db_is_clone_and_send() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let db2 = db.clone();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO users (address, chain) VALUES (?1, ?2)",
                rusqlite::params!["0xabc", "aptos"],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let chain: String = db2
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT chain FROM users WHERE address = '0xabc'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();

        assert_eq!(chain, "aptos");
    }

    #[tokio::test]
    async fn test_async_db_call_returns_error_on_bad_sql() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }
}
