//! Persisted trading session state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::surface::SurfaceId;

use super::TradeSide;

/// Configuration and progress of both trading cycles.
///
/// One instance is owned by the coordinator; every mutation is persisted so an
/// interrupted session can resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Auto-trade round-trip cycle is armed
    pub auto_trading: bool,

    /// Order size used for each auto-trade round trip
    pub auto_amount: Decimal,

    /// Batch-open cycle is armed
    pub batch_opening: bool,

    /// Direction of every order in the current batch
    pub batch_direction: TradeSide,

    /// Order size used for each batch order
    pub batch_amount: Decimal,

    /// Orders requested for the current batch
    pub batch_total: u32,

    /// Orders placed so far in the current batch
    pub batch_completed: u32,

    /// Lifetime count of completed auto-trade round trips
    pub trade_count: u64,

    /// Last page confirmed to host the trading interface. Only a hint: it is
    /// re-resolved against the live surface list before every use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_surface_id: Option<SurfaceId>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            auto_trading: false,
            auto_amount: Decimal::ZERO,
            batch_opening: false,
            batch_direction: TradeSide::Buy,
            batch_amount: Decimal::ZERO,
            batch_total: 0,
            batch_completed: 0,
            trade_count: 0,
            last_active_surface_id: None,
        }
    }
}

impl SessionState {
    /// Orders still to place in the current batch.
    pub fn batch_remaining(&self) -> u32 {
        self.batch_total.saturating_sub(self.batch_completed)
    }

    /// True when either cycle is armed.
    pub fn is_trading(&self) -> bool {
        self.auto_trading || self.batch_opening
    }

    /// Shallow merge: fields absent from the patch are left untouched.
    pub fn apply(&mut self, patch: &SessionStatePatch) {
        if let Some(v) = patch.auto_trading {
            self.auto_trading = v;
        }
        if let Some(v) = patch.auto_amount {
            self.auto_amount = v;
        }
        if let Some(v) = patch.batch_opening {
            self.batch_opening = v;
        }
        if let Some(v) = patch.batch_direction {
            self.batch_direction = v;
        }
        if let Some(v) = patch.batch_amount {
            self.batch_amount = v;
        }
        if let Some(v) = patch.batch_total {
            self.batch_total = v;
        }
        if let Some(v) = patch.batch_completed {
            self.batch_completed = v;
        }
        if let Some(v) = patch.trade_count {
            self.trade_count = v;
        }
        if let Some(v) = &patch.last_active_surface_id {
            self.last_active_surface_id = Some(v.clone());
        }
    }

    /// Check the invariants a merged state must hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_completed > self.batch_total {
            return Err(format!(
                "batchCompleted ({}) cannot exceed batchTotal ({})",
                self.batch_completed, self.batch_total
            ));
        }
        if self.auto_amount < Decimal::ZERO || self.batch_amount < Decimal::ZERO {
            return Err("amounts cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Partial update of [`SessionState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_trading: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_opening: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_direction: Option<TradeSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_total: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_surface_id: Option<SurfaceId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_patch_merge_is_shallow() {
        let mut state = SessionState {
            auto_trading: true,
            auto_amount: dec!(20),
            trade_count: 7,
            ..SessionState::default()
        };

        let patch: SessionStatePatch =
            serde_json::from_str(r#"{"batchTotal": 5, "batchDirection": "SELL"}"#).unwrap();
        state.apply(&patch);

        assert!(state.auto_trading);
        assert_eq!(state.auto_amount, dec!(20));
        assert_eq!(state.trade_count, 7);
        assert_eq!(state.batch_total, 5);
        assert_eq!(state.batch_direction, TradeSide::Sell);
    }

    #[test]
    fn test_validate_rejects_overcompleted_batch() {
        let state = SessionState {
            batch_total: 2,
            batch_completed: 3,
            ..SessionState::default()
        };
        assert!(state.validate().is_err());
        assert_eq!(state.batch_remaining(), 0);
    }

    #[test]
    fn test_state_uses_camel_case_keys() {
        let json = serde_json::to_value(SessionState::default()).unwrap();
        assert!(json.get("autoTrading").is_some());
        assert!(json.get("batchCompleted").is_some());
        assert!(json.get("lastActiveSurfaceId").is_none());
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let state: SessionState =
            serde_json::from_str(r#"{"autoTrading":true,"autoAmount":"15","tradeCount":4}"#).unwrap();

        assert!(state.auto_trading);
        assert_eq!(state.auto_amount, dec!(15));
        assert_eq!(state.trade_count, 4);
        assert_eq!(state.batch_amount, SessionState::default().batch_amount);
        assert!(!state.batch_opening);
        assert!(state.last_active_surface_id.is_none());
    }
}
