use anyhow::{Context, Result};
use common::db::Database;
use common::types::{normalize_address, Chain, UserKey};

use crate::aggregation::{read_activity, read_protocols, select_candidates};
use crate::badges::{badge_name, read_badges};
use crate::jobs::read_sync_status;
use crate::reputation_scoring::{read_current_score, read_score_history};

const HISTORY_LIMIT: u32 = 10;
const USERS_LIMIT: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Sync { address: String, chain: Chain },
    Score { address: String, chain: Chain },
    Badges { address: String, chain: Chain },
    Users,
}

fn address_and_chain<I>(args: &mut I, usage: &str) -> std::result::Result<(String, Chain), String>
where
    I: Iterator<Item = String>,
{
    let address = args.next().ok_or_else(|| usage.to_string())?;
    let chain = match args.next() {
        Some(c) => c.parse::<Chain>()?,
        None => Chain::Aptos,
    };
    Ok((address, chain))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "sync" => {
            let (address, chain) =
                address_and_chain(&mut args, "usage: reputation sync <address> [chain]")?;
            Ok(Command::Sync { address, chain })
        }
        "score" => {
            let (address, chain) =
                address_and_chain(&mut args, "usage: reputation score <address> [chain]")?;
            Ok(Command::Score { address, chain })
        }
        "badges" => {
            let (address, chain) =
                address_and_chain(&mut args, "usage: reputation badges <address> [chain]")?;
            Ok(Command::Badges { address, chain })
        }
        "users" => Ok(Command::Users),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Read-only commands. `Run` and `Sync` need the async runtime and are handled in `main`.
pub fn run_command(db: &Database, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run | Command::Sync { .. } => Ok(()),
        Command::Score { address, chain } => show_score(db, &address, chain),
        Command::Badges { address, chain } => show_badges(db, &address, chain),
        Command::Users => show_users(db),
    }
}

fn normalized(address: &str) -> Result<String> {
    normalize_address(address).with_context(|| format!("invalid address: {address:?}"))
}

pub fn query_score_report(db: &Database, address: &str, chain: Chain) -> Result<serde_json::Value> {
    let user = normalized(address)?;
    Ok(serde_json::json!({
        "address": user,
        "chain": chain,
        "current": read_current_score(&db.conn, &user, chain)?,
        "history": read_score_history(&db.conn, &user, chain, HISTORY_LIMIT)?,
        "activity": read_activity(&db.conn, &user, chain)?,
        "protocols": read_protocols(&db.conn, &user, chain)?,
        "sync_status": read_sync_status(&db.conn, &user, chain)?,
    }))
}

fn show_score(db: &Database, address: &str, chain: Chain) -> Result<()> {
    let report = query_score_report(db, address, chain)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show_badges(db: &Database, address: &str, chain: Chain) -> Result<()> {
    let user = normalized(address)?;
    let badges: Vec<serde_json::Value> = read_badges(&db.conn, &user, chain)?
        .into_iter()
        .map(|b| {
            serde_json::json!({
                "badge_id": b.badge_id,
                "name": badge_name(&b.badge_id),
                "earned": b.earned,
                "progress": b.progress,
                "earned_at": b.earned_at,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&badges)?);
    Ok(())
}

pub fn query_users(db: &Database) -> Result<Vec<UserKey>> {
    select_candidates(&db.conn, USERS_LIMIT)
}

fn show_users(db: &Database) -> Result<()> {
    println!("Users (most recently updated first):");
    for u in query_users(db)? {
        println!("{}  {}", u.chain, u.address);
    }
    Ok(())
}
