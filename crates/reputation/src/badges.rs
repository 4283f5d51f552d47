//! Badge catalog and its permanent-earn upsert.
//!
//! Every rule is re-evaluated against the current aggregates after each sync.
//! `earned` only ever moves from false to true; an earned badge reports 100%
//! progress even if its condition no longer holds.

use anyhow::{Context, Result};
use common::types::{BadgeRecord, Chain};
use rusqlite::{Connection, OptionalExtension};

use crate::classifier::{is_governance_function, DEFI_KEYWORDS};

/// Protocol categories that count toward the liquidity provider badge.
const LIQUIDITY_CATEGORIES: [&str; 4] = ["pool", "liquidity", "dex", "swap"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BadgeCondition {
    MinTransactions(u64),
    MinDefiProtocols(u32),
    MinLiquidityProtocols(u32),
    MinTotalVolume(f64),
    Governance,
}

#[derive(Debug, Clone, Copy)]
pub struct BadgeRule {
    pub id: &'static str,
    pub name: &'static str,
    pub condition: BadgeCondition,
}

pub const CATALOG: [BadgeRule; 6] = [
    BadgeRule {
        id: "first_transaction",
        name: "First Transaction",
        condition: BadgeCondition::MinTransactions(1),
    },
    BadgeRule {
        id: "defi_explorer",
        name: "DeFi Explorer",
        condition: BadgeCondition::MinDefiProtocols(3),
    },
    BadgeRule {
        id: "defi_pioneer",
        name: "DeFi Pioneer",
        condition: BadgeCondition::MinDefiProtocols(5),
    },
    BadgeRule {
        id: "liquidity_provider",
        name: "Liquidity Provider",
        condition: BadgeCondition::MinLiquidityProtocols(3),
    },
    BadgeRule {
        id: "volume_trader",
        name: "Volume Trader",
        condition: BadgeCondition::MinTotalVolume(10_000.0),
    },
    BadgeRule {
        id: "governance_participant",
        name: "Governance Participant",
        condition: BadgeCondition::Governance,
    },
];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BadgeInputs {
    pub transaction_count: u64,
    pub defi_protocols: u32,
    pub liquidity_protocols: u32,
    pub total_volume: f64,
    pub governance_transactions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BadgeEvaluation {
    pub badge_id: &'static str,
    pub earned: bool,
    pub progress: f64,
}

fn progress_toward(current: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 100.0;
    }
    (current / target * 100.0).clamp(0.0, 100.0)
}

impl BadgeCondition {
    pub fn evaluate(&self, inputs: &BadgeInputs) -> (bool, f64) {
        let (current, target) = match *self {
            Self::MinTransactions(n) => (inputs.transaction_count as f64, n as f64),
            Self::MinDefiProtocols(n) => (f64::from(inputs.defi_protocols), f64::from(n)),
            Self::MinLiquidityProtocols(n) => (f64::from(inputs.liquidity_protocols), f64::from(n)),
            Self::MinTotalVolume(v) => (inputs.total_volume, v),
            Self::Governance => (inputs.governance_transactions.min(1) as f64, 1.0),
        };
        (current >= target, progress_toward(current, target))
    }
}

pub fn badge_name(badge_id: &str) -> Option<&'static str> {
    CATALOG.iter().find(|r| r.id == badge_id).map(|r| r.name)
}

pub fn evaluate_catalog(inputs: &BadgeInputs) -> Vec<BadgeEvaluation> {
    CATALOG
        .iter()
        .map(|rule| {
            let (earned, progress) = rule.condition.evaluate(inputs);
            BadgeEvaluation {
                badge_id: rule.id,
                earned,
                progress,
            }
        })
        .collect()
}

/// Apply a fresh evaluation on top of the stored record.
pub fn merge_badge(
    existing: Option<&BadgeRecord>,
    eval: &BadgeEvaluation,
    user: &str,
    chain: Chain,
    now: &str,
) -> BadgeRecord {
    let was_earned = existing.is_some_and(|b| b.earned);
    let earned = was_earned || eval.earned;
    let earned_at = match existing.and_then(|b| b.earned_at.clone()) {
        Some(at) => Some(at),
        None if earned => Some(now.to_string()),
        None => None,
    };
    BadgeRecord {
        user_address: user.to_string(),
        chain,
        badge_id: eval.badge_id.to_string(),
        earned,
        progress: if earned { 100.0 } else { eval.progress },
        earned_at,
    }
}

pub fn load_badge_inputs(conn: &Connection, user: &str, chain: Chain) -> Result<BadgeInputs> {
    let transaction_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transaction_records WHERE user_address = ?1 AND chain = ?2",
        rusqlite::params![user, chain.as_str()],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT protocol_category, total_volume FROM protocol_aggregates
         WHERE user_address = ?1 AND chain = ?2",
    )?;
    let protocols = stmt
        .query_map(rusqlite::params![user, chain.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut inputs = BadgeInputs {
        transaction_count: transaction_count.max(0) as u64,
        ..Default::default()
    };
    for (category, volume) in &protocols {
        if DEFI_KEYWORDS.contains(&category.as_str()) {
            inputs.defi_protocols += 1;
        }
        if LIQUIDITY_CATEGORIES.contains(&category.as_str()) {
            inputs.liquidity_protocols += 1;
        }
        inputs.total_volume += volume;
    }

    let mut stmt = conn.prepare(
        "SELECT DISTINCT function_name FROM transaction_records
         WHERE user_address = ?1 AND chain = ?2 AND function_name != ''",
    )?;
    let names = stmt
        .query_map(rusqlite::params![user, chain.as_str()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    inputs.governance_transactions = names.iter().filter(|f| is_governance_function(f)).count() as u64;

    Ok(inputs)
}

fn read_badge(conn: &Connection, user: &str, chain: Chain, badge_id: &str) -> Result<Option<BadgeRecord>> {
    Ok(conn
        .query_row(
            "SELECT earned, progress, earned_at FROM badge_records
             WHERE user_address = ?1 AND chain = ?2 AND badge_id = ?3",
            rusqlite::params![user, chain.as_str(), badge_id],
            |row| {
                Ok(BadgeRecord {
                    user_address: user.to_string(),
                    chain,
                    badge_id: badge_id.to_string(),
                    earned: row.get(0)?,
                    progress: row.get(1)?,
                    earned_at: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn read_badges(conn: &Connection, user: &str, chain: Chain) -> Result<Vec<BadgeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT badge_id, earned, progress, earned_at FROM badge_records
         WHERE user_address = ?1 AND chain = ?2 ORDER BY badge_id",
    )?;
    let rows = stmt.query_map(rusqlite::params![user, chain.as_str()], |row| {
        Ok(BadgeRecord {
            user_address: user.to_string(),
            chain,
            badge_id: row.get(0)?,
            earned: row.get(1)?,
            progress: row.get(2)?,
            earned_at: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BadgeSummary {
    pub evaluated: usize,
    pub earned: usize,
    pub newly_earned: usize,
}

/// Re-evaluate the whole catalog for one user and upsert every badge.
pub fn evaluate_and_store(conn: &mut Connection, user: &str, chain: Chain) -> Result<BadgeSummary> {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let tx = conn.transaction()?;
    let inputs = load_badge_inputs(&tx, user, chain)?;

    let mut summary = BadgeSummary::default();
    for eval in evaluate_catalog(&inputs) {
        let existing = read_badge(&tx, user, chain, eval.badge_id)?;
        let merged = merge_badge(existing.as_ref(), &eval, user, chain, &now);
        if merged.earned && !existing.as_ref().is_some_and(|b| b.earned) {
            summary.newly_earned += 1;
        }
        if merged.earned {
            summary.earned += 1;
        }
        tx.execute(
            "INSERT INTO badge_records (user_address, chain, badge_id, earned, progress, earned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_address, chain, badge_id) DO UPDATE SET
                earned = excluded.earned,
                progress = excluded.progress,
                earned_at = excluded.earned_at,
                updated_at = datetime('now')",
            rusqlite::params![
                user,
                chain.as_str(),
                merged.badge_id,
                merged.earned,
                merged.progress,
                merged.earned_at,
            ],
        )?;
        summary.evaluated += 1;
    }
    tx.commit().context("committing badge records")?;
    tracing::debug!(
        user,
        chain = %chain,
        evaluated = summary.evaluated,
        earned = summary.earned,
        newly_earned = summary.newly_earned,
        "badges evaluated"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::tests::{record, setup, T0};
    use crate::aggregation::ingest_batch;

    fn eval_for<'a>(evals: &'a [BadgeEvaluation], id: &str) -> &'a BadgeEvaluation {
        evals.iter().find(|e| e.badge_id == id).unwrap()
    }

    #[test]
    fn test_catalog_on_empty_inputs() {
        let evals = evaluate_catalog(&BadgeInputs::default());
        assert_eq!(evals.len(), CATALOG.len());
        assert!(evals.iter().all(|e| !e.earned));
        assert!(evals.iter().all(|e| e.progress.abs() < f64::EPSILON));
    }

    #[test]
    fn test_thresholds_and_progress() {
        let inputs = BadgeInputs {
            transaction_count: 12,
            defi_protocols: 4,
            liquidity_protocols: 1,
            total_volume: 2_500.0,
            governance_transactions: 0,
        };
        let evals = evaluate_catalog(&inputs);
        assert!(eval_for(&evals, "first_transaction").earned);
        assert!(eval_for(&evals, "defi_explorer").earned);

        let pioneer = eval_for(&evals, "defi_pioneer");
        assert!(!pioneer.earned);
        assert!((pioneer.progress - 80.0).abs() < 1e-9);

        let volume = eval_for(&evals, "volume_trader");
        assert!((volume.progress - 25.0).abs() < 1e-9);

        let lp = eval_for(&evals, "liquidity_provider");
        assert!((lp.progress - 100.0 / 3.0).abs() < 1e-9);

        // Progress caps at 100 when far past the target.
        assert!((eval_for(&evals, "first_transaction").progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_governance_badge() {
        let inputs = BadgeInputs {
            governance_transactions: 3,
            ..Default::default()
        };
        let g = *eval_for(&evaluate_catalog(&inputs), "governance_participant");
        assert!(g.earned);
        assert!((g.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_earned_badge_never_regresses() {
        let eval_true = BadgeEvaluation {
            badge_id: "defi_explorer",
            earned: true,
            progress: 100.0,
        };
        let first = merge_badge(None, &eval_true, "0xuser", Chain::Aptos, "2024-01-01 00:00:00");
        assert!(first.earned);
        assert_eq!(first.earned_at.as_deref(), Some("2024-01-01 00:00:00"));

        let eval_false = BadgeEvaluation {
            badge_id: "defi_explorer",
            earned: false,
            progress: 33.0,
        };
        let later = merge_badge(Some(&first), &eval_false, "0xuser", Chain::Aptos, "2024-06-01 00:00:00");
        assert!(later.earned);
        assert!((later.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(later.earned_at.as_deref(), Some("2024-01-01 00:00:00"));
    }

    #[test]
    fn test_unearned_badge_tracks_progress() {
        let eval = BadgeEvaluation {
            badge_id: "volume_trader",
            earned: false,
            progress: 40.0,
        };
        let b = merge_badge(None, &eval, "0xuser", Chain::Aptos, "now");
        assert!(!b.earned);
        assert!(b.earned_at.is_none());
        assert!((b.progress - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evaluate_and_store_from_aggregates() {
        let mut db = setup();
        let mut batch = Vec::new();
        for (i, protocol) in ["0xa1", "0xa2", "0xa3"].iter().enumerate() {
            batch.push(record(&format!("0xh{i}"), i as u64 + 1, T0, protocol, 10.0));
        }
        let mut vote = record("0xvote", 9, T0, "0x1", 0.0);
        vote.function_name = "0x1::aptos_governance::vote".to_string();
        vote.protocol_category = "other".to_string();
        batch.push(vote);

        ingest_batch(&mut db.conn, "0xuser", Chain::Aptos, &batch).unwrap();

        let summary = evaluate_and_store(&mut db.conn, "0xuser", Chain::Aptos).unwrap();
        assert_eq!(summary.evaluated, CATALOG.len());
        // first_transaction, defi_explorer, liquidity_provider, governance_participant
        assert_eq!(summary.earned, 4);
        assert_eq!(summary.newly_earned, 4);

        let again = evaluate_and_store(&mut db.conn, "0xuser", Chain::Aptos).unwrap();
        assert_eq!(again.newly_earned, 0);

        let stored = read_badges(&db.conn, "0xuser", Chain::Aptos).unwrap();
        assert_eq!(stored.len(), CATALOG.len());
        let lp = stored.iter().find(|b| b.badge_id == "liquidity_provider").unwrap();
        assert!(lp.earned && lp.earned_at.is_some());
    }

    #[test]
    fn test_stored_badge_survives_lost_condition() {
        let mut db = setup();
        db.conn
            .execute(
                "INSERT INTO badge_records (user_address, chain, badge_id, earned, progress, earned_at)
                 VALUES ('0xuser', 'aptos', 'volume_trader', 1, 100, '2023-05-05 00:00:00')",
                [],
            )
            .unwrap();

        evaluate_and_store(&mut db.conn, "0xuser", Chain::Aptos).unwrap();
        let stored = read_badges(&db.conn, "0xuser", Chain::Aptos).unwrap();
        let v = stored.iter().find(|b| b.badge_id == "volume_trader").unwrap();
        assert!(v.earned);
        assert!((v.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(v.earned_at.as_deref(), Some("2023-05-05 00:00:00"));
    }
}
