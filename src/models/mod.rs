//! Data models for session state, orders and trade history.

mod history;
mod order;
mod session;
mod trade;

pub use history::{TradeHistoryEntry, DEFAULT_HISTORY_LIMIT, HISTORY_CAPACITY};
pub use order::{OrderRequest, OrderResult, OrderType};
pub use session::{SessionState, SessionStatePatch};
pub use trade::TradeSide;
