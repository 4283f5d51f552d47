use anyhow::Result;
use common::types::{Chain, ScoreSnapshot};
use rusqlite::{Connection, OptionalExtension};

pub const MAX_LONGEVITY: f64 = 10.0;
pub const MAX_BALANCE: f64 = 10.0;
pub const MAX_ACTIVITY: f64 = 20.0;
pub const MAX_DIVERSITY: f64 = 18.0;
pub const MAX_VOLUME: f64 = 15.0;
pub const MAX_COMPLEXITY: f64 = 12.0;
pub const MAX_SOCIAL: f64 = 15.0;
pub const MAX_TOTAL: f64 = 100.0;

const SECS_PER_DAY: f64 = 86_400.0;

/// NaN and infinities resolve to 0 before clamping.
fn bounded(x: f64, max: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, max)
    } else {
        0.0
    }
}

/// Source of the social sub-score (credentials, attestations).
pub trait SocialSignals {
    fn social_score(&self, user: &str, chain: Chain) -> f64;
}

/// No social collaborator wired in yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSocialSignals;

impl SocialSignals for NoSocialSignals {
    fn social_score(&self, _user: &str, _chain: Chain) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreInputs {
    /// Unix seconds of the earliest ingested transaction.
    pub first_transaction_at: Option<i64>,
    /// Display units; `None` when the account has no coin store.
    pub balance: Option<f64>,
    pub total_transactions: u64,
    pub active_days: u32,
    pub longest_streak: u32,
    pub unique_protocols: u32,
    pub unique_categories: u32,
    pub deep_interactions: u32,
    pub total_volume: f64,
    pub total_interactions: u64,
    /// Distinct operation types seen at complexity level 1, 2 and 3.
    pub operation_types_by_level: [u32; 3],
}

pub fn longevity_score(first_transaction_at: Option<i64>, now: i64) -> f64 {
    let Some(first) = first_transaction_at else {
        return 0.0;
    };
    let age_days = ((now - first) as f64 / SECS_PER_DAY).max(0.0);
    let base = (age_days / 30.0).min(10.0);
    let mult = 1.0 + (1.0 + age_days / 365.0).ln();
    bounded(base * mult, MAX_LONGEVITY)
}

pub fn balance_score(balance: Option<f64>) -> f64 {
    let Some(balance) = balance else {
        return 0.0;
    };
    let base = 10.0 * (1.0 - (-balance / 10_000.0).exp());
    let adj = if balance < 10.0 {
        0.5
    } else if balance >= 1_000.0 {
        1.2
    } else {
        1.0
    };
    bounded(base * adj, MAX_BALANCE)
}

pub fn activity_score(total_transactions: u64, active_days: u32, longest_streak: u32) -> f64 {
    let tx = ((1.0 + total_transactions as f64).ln() * 2.0).min(10.0);
    let days = (f64::from(active_days) / 10.0).min(6.0);
    let streak = (f64::from(longest_streak) / 7.0).min(4.0);
    bounded(tx + days + streak, MAX_ACTIVITY)
}

pub fn diversity_score(unique_protocols: u32, unique_categories: u32, deep_interactions: u32) -> f64 {
    let protocols = (f64::from(unique_protocols) * 1.5).min(8.0);
    let categories = (f64::from(unique_categories) * 2.0).min(6.0);
    let deep = f64::from(deep_interactions).min(4.0);
    bounded(protocols + categories + deep, MAX_DIVERSITY)
}

pub fn volume_score(total_volume: f64, total_interactions: u64) -> f64 {
    let avg = if total_interactions == 0 {
        0.0
    } else {
        total_volume / total_interactions as f64
    };
    let base = 15.0 * (1.0 - (-total_volume / 50_000.0).exp());
    let quality = if total_volume < 10.0 {
        0.5
    } else if avg < 50.0 {
        0.8
    } else if avg >= 500.0 {
        1.2
    } else {
        1.0
    };
    bounded(base * quality, MAX_VOLUME)
}

pub fn complexity_score(by_level: [u32; 3]) -> f64 {
    let [basic, advanced, complex] = by_level.map(f64::from);
    let sum = (basic * 0.8).min(4.0) + (advanced * 0.5).min(5.0) + complex.min(3.0);
    bounded(sum, MAX_COMPLEXITY)
}

pub fn grade(total: f64) -> &'static str {
    match total {
        t if t >= 95.0 => "S+",
        t if t >= 85.0 => "S",
        t if t >= 75.0 => "A",
        t if t >= 65.0 => "B",
        t if t >= 50.0 => "C",
        t if t >= 30.0 => "D",
        _ => "F",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub longevity: f64,
    pub balance: f64,
    pub activity: f64,
    pub diversity: f64,
    pub volume: f64,
    pub complexity: f64,
    pub social: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        bounded(
            self.longevity
                + self.balance
                + self.activity
                + self.diversity
                + self.volume
                + self.complexity
                + self.social,
            MAX_TOTAL,
        )
    }
}

pub fn compute_breakdown(inputs: &ScoreInputs, social: f64, now: i64) -> ScoreBreakdown {
    ScoreBreakdown {
        longevity: longevity_score(inputs.first_transaction_at, now),
        balance: balance_score(inputs.balance),
        activity: activity_score(inputs.total_transactions, inputs.active_days, inputs.longest_streak),
        diversity: diversity_score(
            inputs.unique_protocols,
            inputs.unique_categories,
            inputs.deep_interactions,
        ),
        volume: volume_score(inputs.total_volume, inputs.total_interactions),
        complexity: complexity_score(inputs.operation_types_by_level),
        social: bounded(social, MAX_SOCIAL),
    }
}

pub fn build_snapshot(
    user: &str,
    chain: Chain,
    breakdown: &ScoreBreakdown,
    calculated_at: String,
) -> ScoreSnapshot {
    let total = breakdown.total();
    ScoreSnapshot {
        user_address: user.to_string(),
        chain,
        longevity: breakdown.longevity,
        balance: breakdown.balance,
        activity: breakdown.activity,
        diversity: breakdown.diversity,
        volume: breakdown.volume,
        complexity: breakdown.complexity,
        social: breakdown.social,
        total,
        grade: grade(total).to_string(),
        calculated_at,
    }
}

/// Everything but the balance, read from the store.
pub fn load_score_inputs(conn: &Connection, user: &str, chain: Chain) -> Result<ScoreInputs> {
    let chain_key = chain.as_str();
    let params = rusqlite::params![user, chain_key];
    let mut inputs = ScoreInputs {
        first_transaction_at: conn.query_row(
            "SELECT MIN(timestamp) FROM transaction_records
             WHERE user_address = ?1 AND chain = ?2 AND timestamp > 0",
            params,
            |row| row.get::<_, Option<i64>>(0),
        )?,
        ..Default::default()
    };

    if let Some((total, days, streak)) = conn
        .query_row(
            "SELECT total_transactions, active_days, longest_streak FROM activity_aggregates
             WHERE user_address = ?1 AND chain = ?2",
            params,
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )
        .optional()?
    {
        inputs.total_transactions = total.max(0) as u64;
        inputs.active_days = u32::try_from(days).unwrap_or(0);
        inputs.longest_streak = u32::try_from(streak).unwrap_or(0);
    }

    let (protocols, categories, deep, volume, interactions): (i64, i64, i64, f64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COUNT(DISTINCT protocol_category),
                    COALESCE(SUM(is_deep_interaction), 0),
                    COALESCE(SUM(total_volume), 0.0), COALESCE(SUM(interaction_count), 0)
             FROM protocol_aggregates WHERE user_address = ?1 AND chain = ?2",
            params,
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
    inputs.unique_protocols = u32::try_from(protocols).unwrap_or(0);
    inputs.unique_categories = u32::try_from(categories).unwrap_or(0);
    inputs.deep_interactions = u32::try_from(deep).unwrap_or(0);
    inputs.total_volume = volume;
    inputs.total_interactions = interactions.max(0) as u64;

    let mut stmt = conn.prepare(
        "SELECT complexity_level, COUNT(DISTINCT operation_type) FROM transaction_records
         WHERE user_address = ?1 AND chain = ?2 GROUP BY complexity_level",
    )?;
    let rows = stmt.query_map(params, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    for r in rows {
        let (level, count) = r?;
        if let Some(slot) = usize::try_from(level - 1)
            .ok()
            .and_then(|i| inputs.operation_types_by_level.get_mut(i))
        {
            *slot = u32::try_from(count).unwrap_or(0);
        }
    }

    Ok(inputs)
}

/// Replace the current snapshot and append to history in one transaction.
pub fn write_score(conn: &mut Connection, s: &ScoreSnapshot) -> Result<()> {
    let chain_key = s.chain.as_str();
    let tx = conn.transaction()?;
    let params = rusqlite::params![
        s.user_address,
        chain_key,
        s.longevity,
        s.balance,
        s.activity,
        s.diversity,
        s.volume,
        s.complexity,
        s.social,
        s.total,
        s.grade,
        s.calculated_at,
    ];
    tx.execute(
        "INSERT INTO score_snapshots
            (user_address, chain, longevity, balance, activity, diversity, volume, complexity,
             social, total, grade, calculated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(user_address, chain) DO UPDATE SET
            longevity = excluded.longevity,
            balance = excluded.balance,
            activity = excluded.activity,
            diversity = excluded.diversity,
            volume = excluded.volume,
            complexity = excluded.complexity,
            social = excluded.social,
            total = excluded.total,
            grade = excluded.grade,
            calculated_at = excluded.calculated_at",
        params,
    )?;
    tx.execute(
        "INSERT INTO score_history
            (user_address, chain, longevity, balance, activity, diversity, volume, complexity,
             social, total, grade, calculated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params,
    )?;
    tx.commit()?;
    Ok(())
}

const SNAPSHOT_COLUMNS: &str = "longevity, balance, activity, diversity, volume, complexity, social, total, grade, calculated_at";

fn snapshot_from_row(user: &str, chain: Chain, row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreSnapshot> {
    Ok(ScoreSnapshot {
        user_address: user.to_string(),
        chain,
        longevity: row.get(0)?,
        balance: row.get(1)?,
        activity: row.get(2)?,
        diversity: row.get(3)?,
        volume: row.get(4)?,
        complexity: row.get(5)?,
        social: row.get(6)?,
        total: row.get(7)?,
        grade: row.get(8)?,
        calculated_at: row.get(9)?,
    })
}

pub fn read_current_score(conn: &Connection, user: &str, chain: Chain) -> Result<Option<ScoreSnapshot>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM score_snapshots WHERE user_address = ?1 AND chain = ?2"
            ),
            rusqlite::params![user, chain.as_str()],
            |row| snapshot_from_row(user, chain, row),
        )
        .optional()?)
}

/// Newest first.
pub fn read_score_history(
    conn: &Connection,
    user: &str,
    chain: Chain,
    limit: u32,
) -> Result<Vec<ScoreSnapshot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM score_history
         WHERE user_address = ?1 AND chain = ?2 ORDER BY id DESC LIMIT ?3"
    ))?;
    let rows = stmt.query_map(rusqlite::params![user, chain.as_str(), i64::from(limit)], |row| {
        snapshot_from_row(user, chain, row)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
