//! Trade history log entries.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Maximum entries kept in the trade history; older ones are dropped.
pub const HISTORY_CAPACITY: usize = 100;

/// Entries returned by a history query when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One logged trade: an opaque payload plus a generated id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    #[serde(flatten)]
    pub payload: Map<String, Value>,

    /// ISO-8601 UTC time the entry was logged
    pub timestamp: String,

    /// Entry id, `TRADE_<unix millis>_<suffix>`
    pub id: String,
}

impl TradeHistoryEntry {
    /// Stamp a payload with a fresh id and the current time.
    ///
    /// `id` and `timestamp` keys inside the payload are replaced by the
    /// generated ones.
    pub fn new(mut payload: Map<String, Value>) -> Self {
        payload.remove("id");
        payload.remove("timestamp");

        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();

        Self {
            payload,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            id: format!("TRADE_{}_{}", now.timestamp_millis(), &suffix[..8]),
        }
    }

    /// Build an entry from any JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::new(map)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_overrides_reserved_keys() {
        let entry = TradeHistoryEntry::from_value(json!({
            "side": "BUY",
            "amount": "20",
            "id": "spoofed",
            "timestamp": "yesterday",
        }))
        .unwrap();

        assert!(entry.id.starts_with("TRADE_"));
        assert_ne!(entry.timestamp, "yesterday");
        assert_eq!(entry.payload.get("side"), Some(&json!("BUY")));
        assert!(!entry.payload.contains_key("id"));
    }

    #[test]
    fn test_entry_flattens_payload() {
        let entry = TradeHistoryEntry::from_value(json!({"symbol": "BTCUSDT"})).unwrap();
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["symbol"], "BTCUSDT");
        assert_eq!(value["id"], entry.id.as_str());

        let back: TradeHistoryEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(TradeHistoryEntry::from_value(json!([1, 2, 3])).is_none());
        assert!(TradeHistoryEntry::from_value(json!("trade")).is_none());
    }

    #[test]
    fn test_ids_are_unique_within_a_millisecond() {
        let a = TradeHistoryEntry::new(Map::new());
        let b = TradeHistoryEntry::new(Map::new());
        assert_ne!(a.id, b.id);
    }
}
