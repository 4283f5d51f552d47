//! Maps one raw node transaction to a canonical [`TransactionRecord`].
//!
//! Matching is a plain substring scan. Downstream badge thresholds and score
//! caps are calibrated against exactly this behaviour, so rule order is pinned
//! by the tests below.

use common::types::{Chain, OperationType, RawTransaction, TransactionRecord};

/// First match wins, scanned over lowercased `module::function`.
const OPERATION_RULES: [(&str, OperationType); 8] = [
    ("swap", OperationType::Advanced),
    ("exchange", OperationType::Advanced),
    ("deposit", OperationType::Advanced),
    ("withdraw", OperationType::Advanced),
    ("liquidity", OperationType::Complex),
    ("stake", OperationType::Complex),
    ("borrow", OperationType::Complex),
    ("repay", OperationType::Complex),
];

/// DeFi protocol categories, in match priority order.
pub const DEFI_KEYWORDS: [&str; 16] = [
    "lending",
    "borrow",
    "supply",
    "deposit",
    "withdraw",
    "swap",
    "repay",
    "liquidate",
    "stake",
    "unstake",
    "pool",
    "staking",
    "dex",
    "defi",
    "yield",
    "liquidity",
];

const COIN_TRANSFER_MODULES: [&str; 3] = ["coin", "aptos_account", "primary_fungible_store"];

/// Raw call arguments above this are ids or addresses, not amounts.
const MAX_PLAUSIBLE_RAW_AMOUNT: f64 = 1e12;
/// Octas per APT (and per MOVE).
pub const BASE_UNITS_PER_COIN: f64 = 1e8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionId<'a> {
    pub address: &'a str,
    pub module: &'a str,
    pub function: &'a str,
}

/// Split `address::module::function`. Anything else is unclassifiable.
pub fn parse_function_id(id: &str) -> Option<FunctionId<'_>> {
    let mut parts = id.split("::");
    let address = parts.next()?;
    let module = parts.next()?;
    let function = parts.next()?;
    if parts.next().is_some() || address.is_empty() || module.is_empty() || function.is_empty() {
        return None;
    }
    Some(FunctionId {
        address,
        module,
        function,
    })
}

pub fn is_coin_transfer(module: &str, function: &str) -> bool {
    let module = module.to_ascii_lowercase();
    let function = function.to_ascii_lowercase();
    function.starts_with("transfer")
        && (COIN_TRANSFER_MODULES.contains(&module.as_str()) || module.ends_with("_coin"))
}

pub fn classify_operation(module: &str, function: &str) -> OperationType {
    if is_coin_transfer(module, function) {
        return OperationType::Basic;
    }
    let haystack = format!("{module}::{function}").to_ascii_lowercase();
    OPERATION_RULES
        .iter()
        .find(|(keyword, _)| haystack.contains(keyword))
        .map_or(OperationType::Basic, |(_, op)| *op)
}

pub fn protocol_category(module: &str, function: &str) -> &'static str {
    let module = module.to_ascii_lowercase();
    let haystack = format!("{module}::{}", function.to_ascii_lowercase());
    if let Some(keyword) = DEFI_KEYWORDS.iter().copied().find(|k| haystack.contains(k)) {
        return keyword;
    }
    if ["coin", "token", "fungible_asset"]
        .iter()
        .any(|k| module.contains(k))
    {
        "token"
    } else if module.contains("nft") || module.contains("collection") {
        "nft"
    } else {
        "other"
    }
}

pub fn protocol_name(address: &str, module: &str) -> String {
    let short = address
        .strip_prefix("0x")
        .unwrap_or(address)
        .trim_start_matches('0');
    match short {
        "1" => "aptos_framework".to_string(),
        "3" => "aptos_token".to_string(),
        "4" => "aptos_token_objects".to_string(),
        _ => module.to_string(),
    }
}

pub fn is_governance_function(function_name: &str) -> bool {
    let f = function_name.to_ascii_lowercase();
    ["vote", "governance", "proposal"]
        .iter()
        .any(|k| f.contains(k))
}

fn positive_number(v: &serde_json::Value) -> Option<f64> {
    let n = match v {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}

/// Raw base-unit amount: call argument, then transfer-like event, then CoinStore change.
fn extract_raw_amount(tx: &RawTransaction) -> Option<f64> {
    let from_args = tx.payload.as_ref().and_then(|p| {
        p.arguments
            .iter()
            .filter_map(positive_number)
            .find(|n| *n <= MAX_PLAUSIBLE_RAW_AMOUNT)
    });
    if from_args.is_some() {
        return from_args;
    }

    let from_events = tx.events.iter().find_map(|e| {
        let ty = e.event_type.as_deref()?.to_ascii_lowercase();
        if !(ty.contains("deposit") || ty.contains("withdraw") || ty.contains("transfer")) {
            return None;
        }
        positive_number(e.data.get("amount")?)
    });
    if from_events.is_some() {
        return from_events;
    }

    tx.changes.iter().find_map(|c| {
        let resource_type = c.data.get("type")?.as_str()?;
        if !resource_type.contains("CoinStore") {
            return None;
        }
        positive_number(c.data.get("data")?.get("coin")?.get("value")?)
    })
}

fn token_symbol(tx: &RawTransaction, chain: Chain) -> String {
    let type_arg = tx
        .payload
        .as_ref()
        .and_then(|p| p.type_arguments.first())
        .and_then(|t| t.split("::").last())
        .map(|s| s.trim_end_matches('>'))
        .filter(|s| !s.is_empty());
    match type_arg {
        Some("AptosCoin") | None => chain.native_symbol().to_string(),
        Some(other) => other.to_string(),
    }
}

/// Never fails: malformed input degrades field by field to defaults.
pub fn classify(tx: &RawTransaction, user_address: &str, chain: Chain) -> TransactionRecord {
    let function_id = tx
        .payload
        .as_ref()
        .and_then(|p| p.function.as_deref())
        .unwrap_or_default();

    let (function_name, protocol_address, protocol_name, category, operation) =
        match parse_function_id(function_id) {
            Some(f) => (
                function_id.to_string(),
                f.address.to_ascii_lowercase(),
                protocol_name(f.address, f.module),
                protocol_category(f.module, f.function).to_string(),
                classify_operation(f.module, f.function),
            ),
            None => (
                String::new(),
                String::new(),
                String::new(),
                "other".to_string(),
                OperationType::Basic,
            ),
        };

    let amount = extract_raw_amount(tx).map_or(0.0, |raw| raw / BASE_UNITS_PER_COIN);
    let timestamp = tx
        .timestamp
        .as_deref()
        .and_then(|t| t.parse::<i64>().ok())
        .map_or(0, |micros| micros / 1_000_000);

    TransactionRecord {
        chain,
        user_address: user_address.to_string(),
        tx_hash: tx.hash.clone().unwrap_or_default(),
        version: tx.version_number(),
        function_name,
        protocol_address,
        protocol_name,
        protocol_category: category,
        amount,
        token_symbol: token_symbol(tx, chain),
        operation_type: operation,
        complexity_level: operation.complexity_level(),
        gas_used: tx
            .gas_used
            .as_deref()
            .and_then(|g| g.parse().ok())
            .unwrap_or(0),
        success: tx.success.unwrap_or(false),
        timestamp,
        raw_json: serde_json::to_string(tx).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{RawChange, RawEvent, RawPayload};
    use serde_json::json;

    fn entry_tx(function: &str, args: Vec<serde_json::Value>) -> RawTransaction {
        RawTransaction {
            version: Some("100".to_string()),
            hash: Some("0xh".to_string()),
            success: Some(true),
            gas_used: Some("7".to_string()),
            timestamp: Some("1700000000123456".to_string()),
            payload: Some(RawPayload {
                function: Some(function.to_string()),
                arguments: args,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_transfer_with_numeric_argument() {
        let tx = entry_tx("0x1::coin::transfer", vec![json!("0xdef"), json!("500000000")]);
        let r = classify(&tx, "0xuser", Chain::Aptos);
        assert_eq!(r.operation_type, OperationType::Basic);
        assert_eq!(r.complexity_level, 1);
        assert!((r.amount - 5.0).abs() < 1e-9);
        assert_eq!(r.protocol_address, "0x1");
        assert_eq!(r.protocol_name, "aptos_framework");
        assert_eq!(r.token_symbol, "APT");
        assert_eq!(r.timestamp, 1_700_000_000);
        assert_eq!(r.version, 100);
        assert_eq!(r.gas_used, 7);
        assert!(r.success);
    }

    #[test]
    fn test_operation_rules_first_match_wins() {
        assert_eq!(classify_operation("router", "swap_exact_in"), OperationType::Advanced);
        assert_eq!(classify_operation("pool", "add_liquidity"), OperationType::Complex);
        assert_eq!(classify_operation("lending", "borrow"), OperationType::Complex);
        // "deposit" precedes "liquidity" in the rule list.
        assert_eq!(classify_operation("vault", "deposit_liquidity"), OperationType::Advanced);
        // "swap" precedes "stake".
        assert_eq!(classify_operation("swap_and_stake", "run"), OperationType::Advanced);
        assert_eq!(classify_operation("nft", "mint"), OperationType::Basic);
        assert_eq!(classify_operation("Router", "SWAP"), OperationType::Advanced);
    }

    #[test]
    fn test_coin_transfer_forced_basic() {
        assert_eq!(classify_operation("lp_swap_coin", "transfer"), OperationType::Basic);
        assert_eq!(classify_operation("aptos_account", "transfer_coins"), OperationType::Basic);
        // Not a transfer function, so the keyword scan applies.
        assert_eq!(classify_operation("lp_swap_coin", "swap"), OperationType::Advanced);
    }

    #[test]
    fn test_protocol_category_keyword_order() {
        assert_eq!(protocol_category("lending_pool", "supply"), "lending");
        assert_eq!(protocol_category("amm", "swap"), "swap");
        // "stake" is listed before "unstake" and "staking".
        assert_eq!(protocol_category("staking", "unstake"), "stake");
        assert_eq!(protocol_category("coin", "transfer"), "token");
        assert_eq!(protocol_category("nft_market", "list"), "nft");
        assert_eq!(protocol_category("profile", "set_name"), "other");
    }

    #[test]
    fn test_amount_skips_implausible_arguments() {
        let tx = entry_tx(
            "0xabc::router::swap",
            vec![json!("99999999999999"), json!(true), json!(250_000_000)],
        );
        let r = classify(&tx, "0xuser", Chain::Aptos);
        assert!((r.amount - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_amount_falls_back_to_event_then_change() {
        let mut tx = entry_tx("0xabc::router::swap", vec![json!("0xnotanumber")]);
        tx.events = vec![
            RawEvent {
                event_type: Some("0x1::account::KeyRotation".to_string()),
                data: json!({"amount": "1"}),
            },
            RawEvent {
                event_type: Some("0x1::coin::WithdrawEvent".to_string()),
                data: json!({"amount": "300000000"}),
            },
        ];
        tx.changes = vec![RawChange {
            change_type: Some("write_resource".to_string()),
            address: Some("0xuser".to_string()),
            data: json!({"type": "0x1::coin::CoinStore<0x1::aptos_coin::AptosCoin>", "data": {"coin": {"value": "900000000"}}}),
        }];
        assert!((classify(&tx, "0xuser", Chain::Aptos).amount - 3.0).abs() < 1e-9);

        tx.events.clear();
        assert!((classify(&tx, "0xuser", Chain::Aptos).amount - 9.0).abs() < 1e-9);

        tx.changes.clear();
        assert!(classify(&tx, "0xuser", Chain::Aptos).amount.abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_degrades_to_defaults() {
        let r = classify(&RawTransaction::default(), "0xuser", Chain::Movement);
        assert_eq!(r.tx_hash, "");
        assert_eq!(r.version, 0);
        assert_eq!(r.function_name, "");
        assert_eq!(r.protocol_address, "");
        assert_eq!(r.protocol_category, "other");
        assert_eq!(r.operation_type, OperationType::Basic);
        assert_eq!(r.complexity_level, 1);
        assert!(r.amount.abs() < f64::EPSILON);
        assert_eq!(r.token_symbol, "MOVE");
        assert_eq!(r.timestamp, 0);
        assert!(!r.success);
    }

    #[test]
    fn test_unparsable_function_id() {
        assert!(parse_function_id("0x1::coin").is_none());
        assert!(parse_function_id("0x1::coin::transfer::extra").is_none());
        assert!(parse_function_id("::coin::transfer").is_none());
        let tx = entry_tx("script", vec![json!("100000000")]);
        let r = classify(&tx, "0xuser", Chain::Aptos);
        assert_eq!(r.protocol_address, "");
        assert!((r.amount - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_token_symbol_from_type_argument() {
        let mut tx = entry_tx("0xabc::router::swap", vec![]);
        if let Some(p) = tx.payload.as_mut() {
            p.type_arguments = vec!["0xf22::asset::USDC".to_string()];
        }
        assert_eq!(classify(&tx, "0xu", Chain::Aptos).token_symbol, "USDC");
    }

    #[test]
    fn test_governance_function_detection() {
        assert!(is_governance_function("0x1::aptos_governance::vote"));
        assert!(is_governance_function("0xdao::dao::create_proposal"));
        assert!(!is_governance_function("0x1::coin::transfer"));
    }
}
