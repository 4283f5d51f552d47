use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Move-VM networks served by an Aptos-style fullnode REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Aptos,
    Movement,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aptos => "aptos",
            Self::Movement => "movement",
        }
    }

    /// Display symbol of the chain's gas coin.
    pub fn native_symbol(&self) -> &'static str {
        match self {
            Self::Aptos => "APT",
            Self::Movement => "MOVE",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aptos" => Ok(Self::Aptos),
            "movement" => Ok(Self::Movement),
            other => Err(format!("unknown chain: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Basic,
    Advanced,
    Complex,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
            Self::Complex => "complex",
        }
    }

    pub fn complexity_level(&self) -> u8 {
        match self {
            Self::Basic => 1,
            Self::Advanced => 2,
            Self::Complex => 3,
        }
    }
}

/// Outcome of one pipeline stage for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Pending,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Pipeline stage tracked in `sync_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    Transactions,
    Badges,
    Score,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Badges => "badges",
            Self::Score => "score",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UserKey {
    pub address: String,
    pub chain: Chain,
}

impl UserKey {
    pub fn new(address: impl Into<String>, chain: Chain) -> Self {
        Self {
            address: address.into(),
            chain,
        }
    }
}

/// Lowercase and left-pad an account address to its 32-byte hex form.
///
/// Returns `None` unless the input is `0x` followed by 1..=64 hex digits.
pub fn normalize_address(address: &str) -> Option<String> {
    let hex = address.trim().strip_prefix("0x")?;
    if hex.is_empty() || hex.len() > 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{:0>64}", hex.to_ascii_lowercase()))
}

/// Transaction from fullnode `/v1/accounts/{address}/transactions`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTransaction {
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub version: Option<String>,
    pub hash: Option<String>,
    pub sender: Option<String>,
    pub success: Option<bool>,
    pub vm_status: Option<String>,
    pub gas_used: Option<String>,
    /// Microseconds since the unix epoch.
    pub timestamp: Option<String>,
    pub payload: Option<RawPayload>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub changes: Vec<RawChange>,
}

impl RawTransaction {
    /// Ledger version, or 0 when absent or unparsable.
    pub fn version_number(&self) -> u64 {
        self.version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPayload {
    #[serde(rename = "type")]
    pub payload_type: Option<String>,
    pub function: Option<String>,
    #[serde(default)]
    pub type_arguments: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawChange {
    #[serde(rename = "type")]
    pub change_type: Option<String>,
    pub address: Option<String>,
    /// For `write_resource` changes: `{"type": "<resource type>", "data": {...}}`.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Canonical, immutable record of one ingested transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub chain: Chain,
    pub user_address: String,
    pub tx_hash: String,
    pub version: u64,
    pub function_name: String,
    pub protocol_address: String,
    pub protocol_name: String,
    pub protocol_category: String,
    pub amount: f64,
    pub token_symbol: String,
    pub operation_type: OperationType,
    pub complexity_level: u8,
    pub gas_used: u64,
    pub success: bool,
    /// Unix seconds.
    pub timestamp: i64,
    pub raw_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityAggregate {
    pub user_address: String,
    pub chain: Chain,
    pub total_transactions: u64,
    pub active_days: u32,
    pub longest_streak: u32,
    pub last_activity_at: i64,
    pub last_activity_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolAggregate {
    pub user_address: String,
    pub chain: Chain,
    pub protocol_address: String,
    pub protocol_name: String,
    pub protocol_category: String,
    pub interaction_count: u64,
    pub total_volume: f64,
    pub first_interaction_at: i64,
    pub last_interaction_at: i64,
    pub is_deep_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BadgeRecord {
    pub user_address: String,
    pub chain: Chain,
    pub badge_id: String,
    pub earned: bool,
    pub progress: f64,
    pub earned_at: Option<String>,
}

/// One fully recomputed score with its breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSnapshot {
    pub user_address: String,
    pub chain: Chain,
    pub longevity: f64,
    pub balance: f64,
    pub activity: f64,
    pub diversity: f64,
    pub volume: f64,
    pub complexity: f64,
    pub social: f64,
    pub total: f64,
    pub grade: String,
    pub calculated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_round_trips_through_str() {
        assert_eq!("aptos".parse::<Chain>().unwrap(), Chain::Aptos);
        assert_eq!("Movement".parse::<Chain>().unwrap(), Chain::Movement);
        assert!("sui".parse::<Chain>().is_err());
        assert_eq!(Chain::Movement.to_string(), "movement");
    }

    #[test]
    fn test_operation_type_levels() {
        assert_eq!(OperationType::Basic.complexity_level(), 1);
        assert_eq!(OperationType::Advanced.complexity_level(), 2);
        assert_eq!(OperationType::Complex.complexity_level(), 3);
    }

    #[test]
    fn test_normalize_address_pads_and_lowercases() {
        let n = normalize_address("0xABC").unwrap();
        assert_eq!(n.len(), 66);
        assert!(n.ends_with("abc"));
        assert!(n.starts_with("0x000"));
    }

    #[test]
    fn test_normalize_address_rejects_garbage() {
        assert!(normalize_address("abc").is_none());
        assert!(normalize_address("0x").is_none());
        assert!(normalize_address("0xzz").is_none());
        assert!(normalize_address(&format!("0x{}", "1".repeat(65))).is_none());
    }

    #[test]
    fn test_parse_node_transaction() {
        let json = r#"{
            "type": "user_transaction",
            "version": "123456",
            "hash": "0xfeed",
            "sender": "0xabc",
            "success": true,
            "gas_used": "12",
            "timestamp": "1700000000000000",
            "payload": {
                "type": "entry_function_payload",
                "function": "0x1::coin::transfer",
                "type_arguments": ["0x1::aptos_coin::AptosCoin"],
                "arguments": ["0xdef", "500000000"]
            },
            "events": [{"type": "0x1::coin::WithdrawEvent", "data": {"amount": "500000000"}}],
            "changes": []
        }"#;
        let tx: RawTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.version_number(), 123_456);
        let payload = tx.payload.unwrap();
        assert_eq!(payload.function.as_deref(), Some("0x1::coin::transfer"));
        assert_eq!(payload.arguments.len(), 2);
        assert_eq!(tx.events.len(), 1);
    }

    #[test]
    fn test_version_number_defaults_to_zero() {
        let tx = RawTransaction {
            version: Some("not-a-number".to_string()),
            ..Default::default()
        };
        assert_eq!(tx.version_number(), 0);
        assert_eq!(RawTransaction::default().version_number(), 0);
    }
}
