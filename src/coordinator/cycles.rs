//! Cycle bookkeeping: timing constants, per-kind tick slots and status events.

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;

use crate::models::TradeSide;

/// Wait between the open and close orders of one round trip.
pub const ROUND_TRIP_HOLD: Duration = Duration::from_millis(2000);

/// Wait between auto-trade round trips, and before retrying a failed one.
pub const AUTO_TRADE_INTERVAL: Duration = Duration::from_millis(10_000);

/// Wait between batch orders, and before retrying a failed one.
pub const BATCH_ORDER_INTERVAL: Duration = Duration::from_millis(2000);

/// The two independently scheduled trading cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleKind {
    AutoTrade,
    BatchOpen,
}

impl CycleKind {
    /// Delay before the next tick, after success or failure alike.
    pub fn interval(self) -> Duration {
        match self {
            CycleKind::AutoTrade => AUTO_TRADE_INTERVAL,
            CycleKind::BatchOpen => BATCH_ORDER_INTERVAL,
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::AutoTrade => f.write_str("auto-trade"),
            CycleKind::BatchOpen => f.write_str("batch-open"),
        }
    }
}

/// Scheduling state of one cycle kind.
///
/// `generation` changes on every cancel. A tick carries the generation it was
/// scheduled under and does nothing once that no longer matches.
#[derive(Debug, Default)]
pub(crate) struct CycleSlot {
    pub generation: u64,
    pub pending: Option<JoinHandle<()>>,
    pub in_flight: bool,
}

impl CycleSlot {
    /// A tick is waiting or a step is running.
    pub fn is_active(&self) -> bool {
        self.pending.is_some() || self.in_flight
    }

    /// Drop the pending tick and invalidate any step in flight.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.is_active();
        self.generation += 1;
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.in_flight = false;
        was_active
    }
}

#[derive(Debug, Default)]
pub(crate) struct CycleTable {
    auto_trade: CycleSlot,
    batch_open: CycleSlot,
}

impl CycleTable {
    pub fn slot(&self, kind: CycleKind) -> &CycleSlot {
        match kind {
            CycleKind::AutoTrade => &self.auto_trade,
            CycleKind::BatchOpen => &self.batch_open,
        }
    }

    pub fn slot_mut(&mut self, kind: CycleKind) -> &mut CycleSlot {
        match kind {
            CycleKind::AutoTrade => &mut self.auto_trade,
            CycleKind::BatchOpen => &mut self.batch_open,
        }
    }
}

/// Status changes broadcast to the presenter.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    CycleStarted { kind: CycleKind, amount: Decimal },
    OrderPlaced { kind: CycleKind, side: TradeSide, order_id: String },
    RoundTripCompleted { trade_count: u64 },
    BatchProgress { completed: u32, total: u32 },
    BatchFinished { total: u32 },
    CycleFailed { kind: CycleKind, error: String, retry_in: Duration },
    CycleStopped { kind: CycleKind },
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorEvent::CycleStarted { kind, amount } => {
                write!(f, "{} started with amount {}", kind, amount)
            }
            CoordinatorEvent::OrderPlaced { kind, side, order_id } => {
                write!(f, "{} {} order placed ({})", kind, side, order_id)
            }
            CoordinatorEvent::RoundTripCompleted { trade_count } => {
                write!(f, "Round trip completed, waiting for next one ({} trades)", trade_count)
            }
            CoordinatorEvent::BatchProgress { completed, total } => {
                write!(f, "Batch order {}/{} placed", completed, total)
            }
            CoordinatorEvent::BatchFinished { total } => {
                write!(f, "Batch finished: {} orders placed", total)
            }
            CoordinatorEvent::CycleFailed { kind, error, retry_in } => {
                write!(f, "{} failed: {}. Retrying in {}s", kind, error, retry_in.as_secs())
            }
            CoordinatorEvent::CycleStopped { kind } => write!(f, "{} stopped", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_bumps_generation_and_aborts() {
        let mut slot = CycleSlot::default();
        let handle = tokio::spawn(std::future::pending::<()>());
        slot.pending = Some(handle);

        assert!(slot.cancel());
        assert_eq!(slot.generation, 1);
        assert!(!slot.is_active());

        // idempotent
        assert!(!slot.cancel());
        assert_eq!(slot.generation, 2);
    }

    #[test]
    fn test_event_text_is_human_readable() {
        let event = CoordinatorEvent::CycleFailed {
            kind: CycleKind::AutoTrade,
            error: "no page".to_string(),
            retry_in: AUTO_TRADE_INTERVAL,
        };
        assert_eq!(event.to_string(), "auto-trade failed: no page. Retrying in 10s");
    }
}
