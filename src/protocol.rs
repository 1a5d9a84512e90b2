//! Message contract shared by the presenter, the coordinator and the page automator.
//!
//! Requests are tagged by `action` and use camelCase keys, matching what the
//! trading page side expects on the wire. Every request is answered with a
//! [`Response`] carrying `success` plus whichever payload the action returns.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::TradingError;
use crate::models::{
    OrderRequest, OrderResult, SessionState, SessionStatePatch, TradeHistoryEntry, TradeSide,
};

/// A request addressed to the coordinator or, for the page actions, forwarded
/// to the automator hosted by a trading surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    GetTradingState,
    UpdateTradingState {
        state: SessionStatePatch,
    },
    StartAutoTrade {
        amount: Decimal,
    },
    StopAutoTrade,
    StartBatchOpen {
        direction: TradeSide,
        amount: Decimal,
        count: u32,
    },
    StopBatchOpen,
    StopAllTrading,
    GetTradeHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    ClearTradeHistory,
    LogTrade {
        #[serde(rename = "tradeData")]
        trade_data: Value,
    },
    ExecuteMarketOrder(OrderRequest),
    GetCurrentPrice {
        symbol: String,
    },
    Ping,
}

impl Request {
    /// Wire name of the action, for logs and error text.
    pub fn action(&self) -> &'static str {
        match self {
            Request::GetTradingState => "getTradingState",
            Request::UpdateTradingState { .. } => "updateTradingState",
            Request::StartAutoTrade { .. } => "startAutoTrade",
            Request::StopAutoTrade => "stopAutoTrade",
            Request::StartBatchOpen { .. } => "startBatchOpen",
            Request::StopBatchOpen => "stopBatchOpen",
            Request::StopAllTrading => "stopAllTrading",
            Request::GetTradeHistory { .. } => "getTradeHistory",
            Request::ClearTradeHistory => "clearTradeHistory",
            Request::LogTrade { .. } => "logTrade",
            Request::ExecuteMarketOrder(_) => "executeMarketOrder",
            Request::GetCurrentPrice { .. } => "getCurrentPrice",
            Request::Ping => "ping",
        }
    }

    /// Local validation, applied before anything is scheduled or forwarded.
    pub fn validate(&self) -> Result<(), TradingError> {
        match self {
            Request::StartAutoTrade { amount } => validate_amount(*amount),
            Request::StartBatchOpen { amount, count, .. } => {
                validate_amount(*amount)?;
                validate_count(*count)
            }
            Request::ExecuteMarketOrder(order) => validate_amount(order.amount),
            Request::LogTrade { trade_data } if !trade_data.is_object() => {
                Err(TradingError::InvalidTradeData)
            }
            _ => Ok(()),
        }
    }
}

/// Order sizes must be strictly positive.
pub fn validate_amount(amount: Decimal) -> Result<(), TradingError> {
    if amount <= Decimal::ZERO {
        return Err(TradingError::InvalidAmount(amount));
    }
    Ok(())
}

/// Batch sizes must be strictly positive.
pub fn validate_count(count: u32) -> Result<(), TradingError> {
    if count == 0 {
        return Err(TradingError::InvalidCount(count));
    }
    Ok(())
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<TradeHistoryEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_history(mut self, history: Vec<TradeHistoryEntry>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_price(mut self, price: Decimal, symbol: impl Into<String>) -> Self {
        self.price = Some(price);
        self.symbol = Some(symbol.into());
        self
    }

    /// Human-readable summary: the error when failed, else the message.
    pub fn summary(&self) -> String {
        match (&self.error, &self.message) {
            (Some(error), _) if !self.success => error.clone(),
            (_, Some(message)) => message.clone(),
            _ if self.success => "ok".to_string(),
            _ => "request failed".to_string(),
        }
    }
}

impl From<OrderResult> for Response {
    fn from(result: OrderResult) -> Self {
        Self {
            success: result.success,
            order_id: result.order_id,
            message: result.message,
            error: result.error,
            ..Self::default()
        }
    }
}

impl From<Response> for OrderResult {
    fn from(response: Response) -> Self {
        Self {
            success: response.success,
            order_id: response.order_id,
            message: response.message,
            error: response.error,
        }
    }
}
