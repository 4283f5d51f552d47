use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::types::{ActivityAggregate, Chain, ProtocolAggregate, TransactionRecord, UserKey};
use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};

pub const DEEP_MIN_INTERACTIONS: u64 = 5;
pub const DEEP_MIN_VOLUME: f64 = 100.0;

pub fn is_deep_interaction(interaction_count: u64, total_volume: f64) -> bool {
    interaction_count >= DEEP_MIN_INTERACTIONS && total_volume >= DEEP_MIN_VOLUME
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    /// Rows already present under the same (chain, tx_hash).
    pub skipped: u64,
}

fn insert_one(conn: &Connection, r: &TransactionRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO transaction_records
            (chain, user_address, tx_hash, version, function_name, protocol_address, protocol_name,
             protocol_category, amount, token_symbol, operation_type, complexity_level, gas_used,
             success, timestamp, raw_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(chain, tx_hash) DO NOTHING
        "#,
        rusqlite::params![
            r.chain.as_str(),
            r.user_address,
            r.tx_hash,
            r.version as i64,
            r.function_name,
            r.protocol_address,
            r.protocol_name,
            r.protocol_category,
            r.amount,
            r.token_symbol,
            r.operation_type.as_str(),
            i64::from(r.complexity_level),
            r.gas_used as i64,
            r.success,
            r.timestamp,
            r.raw_json,
        ],
    )
}

/// Insert each record, skipping any already stored under the same (chain, tx_hash).
/// Returns the counts and the records that were actually written.
fn insert_new<'a>(
    conn: &Connection,
    records: &'a [TransactionRecord],
) -> Result<(InsertOutcome, Vec<&'a TransactionRecord>)> {
    let mut out = InsertOutcome::default();
    let mut fresh = Vec::with_capacity(records.len());
    for r in records {
        let n = insert_one(conn, r).with_context(|| format!("inserting transaction {}", r.tx_hash))?;
        if n == 0 {
            out.skipped += 1;
        } else {
            out.inserted += 1;
            fresh.push(r);
        }
    }
    Ok((out, fresh))
}

/// Store a classified batch and fold it into both aggregates as one transaction.
///
/// The sync cursor is `MAX(version)` over stored records, so it can only move
/// together with the aggregates. A failure anywhere leaves all three untouched
/// and the next run fetches the same transactions again. Only rows that were
/// newly written are merged, which keeps a replayed batch from being counted twice.
pub fn ingest_batch(
    conn: &mut Connection,
    user: &str,
    chain: Chain,
    records: &[TransactionRecord],
) -> Result<InsertOutcome> {
    let tx = conn.transaction()?;
    let (outcome, fresh) = insert_new(&tx, records)?;
    if !fresh.is_empty() {
        let fresh: Vec<TransactionRecord> = fresh.into_iter().cloned().collect();
        merge_activity(&tx, user, chain, &fresh)?;
        merge_protocols(&tx, user, chain, &fresh)?;
    }
    tx.commit().context("committing ingested batch")?;
    if outcome.skipped > 0 {
        tracing::debug!(user, skipped = outcome.skipped, "batch held already stored transactions");
    }
    Ok(outcome)
}

fn utc_date(ts: i64) -> Option<NaiveDate> {
    if ts <= 0 {
        return None;
    }
    chrono::DateTime::from_timestamp(ts, 0).map(|d| d.date_naive())
}

/// Longest run of consecutive calendar days.
pub fn longest_run(days: &BTreeSet<NaiveDate>) -> u32 {
    let mut best = 0_u32;
    let mut run = 0_u32;
    let mut prev: Option<NaiveDate> = None;
    for &d in days {
        run = match prev.and_then(|p| p.succ_opt()) {
            Some(next) if next == d => run + 1,
            _ => 1,
        };
        best = best.max(run);
        prev = Some(d);
    }
    best
}

fn stored_active_days(conn: &Connection, user: &str, chain: Chain) -> Result<BTreeSet<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT date(timestamp, 'unixepoch') FROM transaction_records
         WHERE user_address = ?1 AND chain = ?2 AND timestamp > 0",
    )?;
    let rows = stmt.query_map(rusqlite::params![user, chain.as_str()], |row| {
        row.get::<_, String>(0)
    })?;
    let mut days = BTreeSet::new();
    for r in rows {
        if let Ok(d) = NaiveDate::parse_from_str(&r?, "%Y-%m-%d") {
            days.insert(d);
        }
    }
    Ok(days)
}

/// Fold a batch into the running activity aggregate.
///
/// Day counts are taken over the union of stored and batch dates, so small
/// frequent batches do not understate them.
pub fn merge_activity_aggregate(
    existing: Option<&ActivityAggregate>,
    user: &str,
    chain: Chain,
    batch: &[TransactionRecord],
    mut days: BTreeSet<NaiveDate>,
) -> ActivityAggregate {
    days.extend(batch.iter().filter_map(|r| utc_date(r.timestamp)));

    let (mut last_at, mut last_version) =
        existing.map_or((0, 0), |a| (a.last_activity_at, a.last_activity_version));
    if let Some(latest) = batch.iter().max_by_key(|r| r.version) {
        if latest.version >= last_version {
            last_version = latest.version;
            last_at = latest.timestamp;
        }
    }

    ActivityAggregate {
        user_address: user.to_string(),
        chain,
        total_transactions: existing.map_or(0, |a| a.total_transactions) + batch.len() as u64,
        active_days: u32::try_from(days.len()).unwrap_or(u32::MAX),
        longest_streak: longest_run(&days).max(existing.map_or(0, |a| a.longest_streak)),
        last_activity_at: last_at,
        last_activity_version: last_version,
    }
}

pub fn read_activity(conn: &Connection, user: &str, chain: Chain) -> Result<Option<ActivityAggregate>> {
    Ok(conn
        .query_row(
            "SELECT total_transactions, active_days, longest_streak, last_activity_at, last_activity_version
             FROM activity_aggregates WHERE user_address = ?1 AND chain = ?2",
            rusqlite::params![user, chain.as_str()],
            |row| {
                Ok(ActivityAggregate {
                    user_address: user.to_string(),
                    chain,
                    total_transactions: row.get::<_, i64>(0)?.max(0) as u64,
                    active_days: row.get::<_, i64>(1)?.max(0) as u32,
                    longest_streak: row.get::<_, i64>(2)?.max(0) as u32,
                    last_activity_at: row.get(3)?,
                    last_activity_version: row.get::<_, i64>(4)?.max(0) as u64,
                })
            },
        )
        .optional()?)
}

pub fn merge_activity(
    conn: &Connection,
    user: &str,
    chain: Chain,
    batch: &[TransactionRecord],
) -> Result<ActivityAggregate> {
    let existing = read_activity(conn, user, chain)?;
    let days = stored_active_days(conn, user, chain)?;
    let merged = merge_activity_aggregate(existing.as_ref(), user, chain, batch, days);

    conn.execute(
        r#"
        INSERT INTO activity_aggregates
            (user_address, chain, total_transactions, active_days, longest_streak,
             last_activity_at, last_activity_version)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user_address, chain) DO UPDATE SET
            total_transactions = excluded.total_transactions,
            active_days = excluded.active_days,
            longest_streak = excluded.longest_streak,
            last_activity_at = excluded.last_activity_at,
            last_activity_version = excluded.last_activity_version,
            updated_at = datetime('now')
        "#,
        rusqlite::params![
            user,
            chain.as_str(),
            merged.total_transactions as i64,
            i64::from(merged.active_days),
            i64::from(merged.longest_streak),
            merged.last_activity_at,
            merged.last_activity_version as i64,
        ],
    )?;
    Ok(merged)
}

/// Fold one protocol's share of a batch into its aggregate. `group` must be non-empty.
pub fn merge_protocol_aggregate(
    existing: Option<ProtocolAggregate>,
    user: &str,
    chain: Chain,
    group: &[&TransactionRecord],
) -> ProtocolAggregate {
    let batch_volume: f64 = group.iter().map(|r| r.amount).sum();
    let batch_first = group.iter().map(|r| r.timestamp).min().unwrap_or(0);
    let batch_last = group.iter().map(|r| r.timestamp).max().unwrap_or(0);

    let mut agg = existing.unwrap_or_else(|| {
        let head = group.first();
        ProtocolAggregate {
            user_address: user.to_string(),
            chain,
            protocol_address: head.map(|r| r.protocol_address.clone()).unwrap_or_default(),
            protocol_name: head.map(|r| r.protocol_name.clone()).unwrap_or_default(),
            protocol_category: head.map(|r| r.protocol_category.clone()).unwrap_or_default(),
            interaction_count: 0,
            total_volume: 0.0,
            first_interaction_at: batch_first,
            last_interaction_at: batch_last,
            is_deep_interaction: false,
        }
    });

    agg.interaction_count += group.len() as u64;
    agg.total_volume += batch_volume;
    agg.last_interaction_at = agg.last_interaction_at.max(batch_last);
    agg.is_deep_interaction = is_deep_interaction(agg.interaction_count, agg.total_volume);
    agg
}

fn read_protocol(
    conn: &Connection,
    user: &str,
    chain: Chain,
    protocol_address: &str,
) -> Result<Option<ProtocolAggregate>> {
    Ok(conn
        .query_row(
            "SELECT protocol_name, protocol_category, interaction_count, total_volume,
                    first_interaction_at, last_interaction_at, is_deep_interaction
             FROM protocol_aggregates
             WHERE user_address = ?1 AND chain = ?2 AND protocol_address = ?3",
            rusqlite::params![user, chain.as_str(), protocol_address],
            |row| {
                Ok(ProtocolAggregate {
                    user_address: user.to_string(),
                    chain,
                    protocol_address: protocol_address.to_string(),
                    protocol_name: row.get(0)?,
                    protocol_category: row.get(1)?,
                    interaction_count: row.get::<_, i64>(2)?.max(0) as u64,
                    total_volume: row.get(3)?,
                    first_interaction_at: row.get(4)?,
                    last_interaction_at: row.get(5)?,
                    is_deep_interaction: row.get(6)?,
                })
            },
        )
        .optional()?)
}

pub fn read_protocols(conn: &Connection, user: &str, chain: Chain) -> Result<Vec<ProtocolAggregate>> {
    let mut stmt = conn.prepare(
        "SELECT protocol_address, protocol_name, protocol_category, interaction_count, total_volume,
                first_interaction_at, last_interaction_at, is_deep_interaction
         FROM protocol_aggregates
         WHERE user_address = ?1 AND chain = ?2
         ORDER BY protocol_address",
    )?;
    let rows = stmt.query_map(rusqlite::params![user, chain.as_str()], |row| {
        Ok(ProtocolAggregate {
            user_address: user.to_string(),
            chain,
            protocol_address: row.get(0)?,
            protocol_name: row.get(1)?,
            protocol_category: row.get(2)?,
            interaction_count: row.get::<_, i64>(3)?.max(0) as u64,
            total_volume: row.get(4)?,
            first_interaction_at: row.get(5)?,
            last_interaction_at: row.get(6)?,
            is_deep_interaction: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Group by protocol address and upsert one aggregate per protocol.
/// Records without a protocol address never reach this table.
pub fn merge_protocols(
    conn: &Connection,
    user: &str,
    chain: Chain,
    batch: &[TransactionRecord],
) -> Result<Vec<ProtocolAggregate>> {
    let mut groups: BTreeMap<&str, Vec<&TransactionRecord>> = BTreeMap::new();
    for r in batch.iter().filter(|r| !r.protocol_address.is_empty()) {
        groups.entry(r.protocol_address.as_str()).or_default().push(r);
    }

    let mut merged = Vec::with_capacity(groups.len());
    for (address, group) in groups {
        let existing = read_protocol(conn, user, chain, address)?;
        let agg = merge_protocol_aggregate(existing, user, chain, &group);
        conn.execute(
            r#"
            INSERT INTO protocol_aggregates
                (user_address, chain, protocol_address, protocol_name, protocol_category,
                 interaction_count, total_volume, first_interaction_at, last_interaction_at,
                 is_deep_interaction)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(user_address, chain, protocol_address) DO UPDATE SET
                interaction_count = excluded.interaction_count,
                total_volume = excluded.total_volume,
                last_interaction_at = excluded.last_interaction_at,
                is_deep_interaction = excluded.is_deep_interaction,
                updated_at = datetime('now')
            "#,
            rusqlite::params![
                user,
                chain.as_str(),
                agg.protocol_address,
                agg.protocol_name,
                agg.protocol_category,
                agg.interaction_count as i64,
                agg.total_volume,
                agg.first_interaction_at,
                agg.last_interaction_at,
                agg.is_deep_interaction,
            ],
        )?;
        merged.push(agg);
    }
    Ok(merged)
}

/// Register a user, or bump it to the front of the candidate queue.
pub fn upsert_user(conn: &Connection, address: &str, chain: Chain) -> Result<()> {
    conn.execute(
        "INSERT INTO users (address, chain) VALUES (?1, ?2)
         ON CONFLICT(address, chain) DO UPDATE SET
            updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')",
        rusqlite::params![address, chain.as_str()],
    )?;
    Ok(())
}

/// Most recently updated users first.
pub fn select_candidates(conn: &Connection, limit: u32) -> Result<Vec<UserKey>> {
    let mut stmt = conn.prepare(
        "SELECT address, chain FROM users ORDER BY updated_at DESC, address ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map([i64::from(limit)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (address, chain) = r?;
        match chain.parse::<Chain>() {
            Ok(chain) => out.push(UserKey::new(address, chain)),
            Err(e) => tracing::warn!(address, error = %e, "skipping user with unknown chain"),
        }
    }
    Ok(out)
}
