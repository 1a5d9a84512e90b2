//! Order request and result exchanged between the coordinator and the page automator.

use std::fmt;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// Whether an order opens or closes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Open,
    Close,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Open => f.write_str("open"),
            OrderType::Close => f.write_str("close"),
        }
    }
}

/// Market order to be placed through the trading page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    #[serde(rename = "type")]
    pub order_type: OrderType,

    pub side: TradeSide,

    /// Direction control to select before submitting (batch orders)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TradeSide>,

    pub amount: Decimal,

    pub symbol: String,
}

impl OrderRequest {
    pub fn open(side: TradeSide, amount: Decimal, symbol: impl Into<String>) -> Self {
        Self {
            order_type: OrderType::Open,
            side,
            direction: None,
            amount,
            symbol: symbol.into(),
        }
    }

    pub fn close(side: TradeSide, amount: Decimal, symbol: impl Into<String>) -> Self {
        Self {
            order_type: OrderType::Close,
            side,
            direction: None,
            amount,
            symbol: symbol.into(),
        }
    }

    pub fn with_direction(mut self, direction: TradeSide) -> Self {
        self.direction = Some(direction);
        self
    }
}

/// Outcome reported by the page automator.
///
/// `success` means the UI accepted the clicks, not that the venue settled the
/// order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderResult {
    /// Result for an order whose controls were all activated.
    pub fn submitted(prefix: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(format!("{}_{}", prefix, Utc::now().timestamp_millis())),
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: None,
            error: Some(error.into()),
        }
    }
}
