//! Coordinator error taxonomy.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by coordinator operations.
///
/// Validation errors are returned to the caller immediately. Surface and order
/// errors never stop a cycle: the cycle loop reports them and re-arms.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Invalid amount {0}: order size must be greater than zero")]
    InvalidAmount(Decimal),

    #[error("Invalid count {0}: number of orders must be greater than zero")]
    InvalidCount(u32),

    #[error("Trade data must be a JSON object")]
    InvalidTradeData,

    #[error("Invalid state update: {0}")]
    InvalidState(String),

    #[error("No trading page found. Open the Variational Omni trading page (omni.variational.io)")]
    NoActiveSurface,

    #[error(
        "Cannot reach the trading page ({0}). Make sure omni.variational.io is open and fully \
         loaded, then reload the page and retry"
    )]
    SurfaceUnreachable(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Storage error: {0}")]
    Store(#[from] anyhow::Error),
}
