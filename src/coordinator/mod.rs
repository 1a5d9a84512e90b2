//! Trading coordinator: owns the session state and schedules both trading cycles.
//!
//! Handles:
//! - Auto-trade round trips (open BUY, hold, close SELL, repeat)
//! - Batch opens (N orders in one direction, then stop)
//! - Delivering orders to the trading page and recording the surface that answered
//! - Resuming an interrupted session after restart
//!
//! Each cycle kind has one tick slot. A tick runs one step, then re-arms
//! itself with the kind's fixed interval as long as the cycle is still on and
//! nobody cancelled it meanwhile. Failures never stop a cycle.

mod cycles;
mod error;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::Envelope;
use crate::models::{
    OrderRequest, OrderResult, SessionState, SessionStatePatch, TradeHistoryEntry, TradeSide,
};
use crate::protocol::{validate_amount, validate_count, Request, Response};
use crate::store::StateStore;
use crate::surface::{resolve_surface, SurfaceHost};

use cycles::CycleTable;

pub use cycles::{CoordinatorEvent, CycleKind, AUTO_TRADE_INTERVAL, BATCH_ORDER_INTERVAL, ROUND_TRIP_HOLD};
pub use error::TradingError;

const EVENT_CAPACITY: usize = 64;

/// What [`TradingCoordinator::resume`] did with the persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing was running.
    Idle,
    /// Running cycles were restarted.
    Resumed,
    /// Cycles were running but no trading page is open; flags left as they were.
    Deferred,
}

struct Inner {
    state: RwLock<SessionState>,
    store: StateStore,
    surfaces: Arc<dyn SurfaceHost>,
    symbol: String,
    cycles: Mutex<CycleTable>,
    events: broadcast::Sender<CoordinatorEvent>,
}

/// Cheap-to-clone handle to the coordinator.
#[derive(Clone)]
pub struct TradingCoordinator {
    inner: Arc<Inner>,
}

impl TradingCoordinator {
    /// Load the persisted session. Cycles are not restarted until [`resume`](Self::resume).
    pub async fn new(
        store: StateStore,
        surfaces: Arc<dyn SurfaceHost>,
        symbol: impl Into<String>,
    ) -> Result<Self> {
        let state = store.load().await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                store,
                surfaces,
                symbol: symbol.into(),
                cycles: Mutex::new(CycleTable::default()),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    /// Shallow-merge a patch into the state. Timers are left alone.
    pub async fn update_state(&self, patch: &SessionStatePatch) -> Result<SessionState, TradingError> {
        let mut state = self.inner.state.write().await;
        let mut next = state.clone();
        next.apply(patch);
        next.validate().map_err(TradingError::InvalidState)?;

        *state = next.clone();
        self.inner.store.save(next.clone());
        Ok(next)
    }

    /// Arm the auto-trade cycle. When it is already running only the amount changes.
    pub async fn start_auto_trade(&self, amount: Decimal) -> Result<(), TradingError> {
        validate_amount(amount)?;

        let mut cycles = self.inner.cycles.lock().await;
        {
            let mut state = self.inner.state.write().await;
            state.auto_trading = true;
            state.auto_amount = amount;
            self.inner.store.save(state.clone());
        }

        if cycles.slot(CycleKind::AutoTrade).is_active() {
            info!(amount = %amount, "Auto-trade already running, amount updated");
            return Ok(());
        }

        info!(amount = %amount, "Auto-trade started");
        self.arm(&mut cycles, CycleKind::AutoTrade, Duration::ZERO);
        self.emit(CoordinatorEvent::CycleStarted {
            kind: CycleKind::AutoTrade,
            amount,
        });
        Ok(())
    }

    pub async fn stop_auto_trade(&self) {
        self.stop(CycleKind::AutoTrade).await;
    }

    /// Start a fresh batch of `count` orders, replacing any batch in progress.
    pub async fn start_batch_open(
        &self,
        direction: TradeSide,
        amount: Decimal,
        count: u32,
    ) -> Result<(), TradingError> {
        validate_amount(amount)?;
        validate_count(count)?;

        let mut cycles = self.inner.cycles.lock().await;
        cycles.slot_mut(CycleKind::BatchOpen).cancel();
        {
            let mut state = self.inner.state.write().await;
            state.batch_opening = true;
            state.batch_direction = direction;
            state.batch_amount = amount;
            state.batch_total = count;
            state.batch_completed = 0;
            self.inner.store.save(state.clone());
        }

        info!(direction = %direction, amount = %amount, count, "Batch open started");
        self.arm(&mut cycles, CycleKind::BatchOpen, Duration::ZERO);
        self.emit(CoordinatorEvent::CycleStarted {
            kind: CycleKind::BatchOpen,
            amount,
        });
        Ok(())
    }

    pub async fn stop_batch_open(&self) {
        self.stop(CycleKind::BatchOpen).await;
    }

    pub async fn stop_all_trading(&self) {
        self.stop(CycleKind::AutoTrade).await;
        self.stop(CycleKind::BatchOpen).await;
    }

    /// Clear the cycle's flag and drop its pending tick. A step already running
    /// finishes but schedules nothing.
    async fn stop(&self, kind: CycleKind) {
        let mut cycles = self.inner.cycles.lock().await;
        let was_scheduled = cycles.slot_mut(kind).cancel();

        let was_on = {
            let mut state = self.inner.state.write().await;
            let flag = match kind {
                CycleKind::AutoTrade => &mut state.auto_trading,
                CycleKind::BatchOpen => &mut state.batch_opening,
            };
            let was_on = *flag;
            *flag = false;
            self.inner.store.save(state.clone());
            was_on
        };

        if was_scheduled || was_on {
            info!(cycle = %kind, "Cycle stopped");
            self.emit(CoordinatorEvent::CycleStopped { kind });
        }
    }

    /// True when a tick is waiting to fire.
    pub async fn has_pending(&self, kind: CycleKind) -> bool {
        self.inner.cycles.lock().await.slot(kind).pending.is_some()
    }

    fn arm(&self, cycles: &mut CycleTable, kind: CycleKind, delay: Duration) {
        let slot = cycles.slot_mut(kind);
        let generation = slot.generation;
        if let Some(previous) = slot.pending.take() {
            previous.abort();
        }

        let this = self.clone();
        slot.pending = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            this.fire(kind, generation).await;
        }));
        debug!(cycle = %kind, delay_ms = delay.as_millis() as u64, generation, "Tick scheduled");
    }

    async fn fire(&self, kind: CycleKind, generation: u64) {
        {
            let mut cycles = self.inner.cycles.lock().await;
            let slot = cycles.slot_mut(kind);
            if slot.generation != generation {
                return;
            }
            slot.pending = None;
            slot.in_flight = true;
        }

        let next = if self.is_on(kind).await {
            match kind {
                CycleKind::AutoTrade => self.auto_trade_step().await,
                CycleKind::BatchOpen => self.batch_open_step(generation).await,
            }
        } else {
            None
        };

        let mut cycles = self.inner.cycles.lock().await;
        if cycles.slot(kind).generation != generation {
            debug!(cycle = %kind, generation, "Step finished after cancel, not rescheduling");
            return;
        }
        cycles.slot_mut(kind).in_flight = false;

        if let Some(delay) = next {
            if self.is_on(kind).await {
                self.arm(&mut cycles, kind, delay);
            }
        }
    }

    async fn is_on(&self, kind: CycleKind) -> bool {
        let state = self.inner.state.read().await;
        match kind {
            CycleKind::AutoTrade => state.auto_trading,
            CycleKind::BatchOpen => state.batch_opening,
        }
    }

    /// One round trip. Always asks for the next one.
    async fn auto_trade_step(&self) -> Option<Duration> {
        let amount = self.inner.state.read().await.auto_amount;

        match self.round_trip(amount).await {
            Ok((open, close)) => {
                let trade_count = {
                    let mut state = self.inner.state.write().await;
                    state.trade_count += 1;
                    self.inner.store.save(state.clone());
                    state.trade_count
                };

                self.record_history(json!({
                    "type": "round_trip",
                    "amount": amount,
                    "symbol": self.inner.symbol,
                    "openOrderId": open.order_id,
                    "closeOrderId": close.order_id,
                }))
                .await;

                info!(amount = %amount, trade_count, "Round trip completed");
                self.emit(CoordinatorEvent::RoundTripCompleted { trade_count });
            }
            Err(e) => self.report_failure(CycleKind::AutoTrade, &e),
        }

        Some(AUTO_TRADE_INTERVAL)
    }

    async fn round_trip(&self, amount: Decimal) -> Result<(OrderResult, OrderResult), TradingError> {
        let symbol = &self.inner.symbol;

        let open = self
            .execute_trade_order(OrderRequest::open(TradeSide::Buy, amount, symbol.as_str()))
            .await?;
        self.emit_order_placed(CycleKind::AutoTrade, TradeSide::Buy, &open);

        sleep(ROUND_TRIP_HOLD).await;

        let close = self
            .execute_trade_order(OrderRequest::close(TradeSide::Sell, amount, symbol.as_str()))
            .await?;
        self.emit_order_placed(CycleKind::AutoTrade, TradeSide::Sell, &close);

        Ok((open, close))
    }

    /// One batch order. Returns `None` once the batch is complete.
    async fn batch_open_step(&self, generation: u64) -> Option<Duration> {
        let (direction, amount) = {
            let state = self.inner.state.read().await;
            (state.batch_direction, state.batch_amount)
        };

        let order = OrderRequest::open(direction, amount, self.inner.symbol.as_str()).with_direction(direction);
        let result = match self.execute_trade_order(order).await {
            Ok(result) => result,
            Err(e) => {
                self.report_failure(CycleKind::BatchOpen, &e);
                return Some(BATCH_ORDER_INTERVAL);
            }
        };

        let (completed, total) = {
            let cycles = self.inner.cycles.lock().await;
            if cycles.slot(CycleKind::BatchOpen).generation != generation {
                info!("Batch replaced or stopped while an order was in flight, order not counted");
                return None;
            }

            let mut state = self.inner.state.write().await;
            if state.batch_completed < state.batch_total {
                state.batch_completed += 1;
            }
            if state.batch_completed >= state.batch_total {
                state.batch_opening = false;
            }
            self.inner.store.save(state.clone());
            (state.batch_completed, state.batch_total)
        };

        self.emit_order_placed(CycleKind::BatchOpen, direction, &result);
        self.record_history(json!({
            "type": "batch_open",
            "direction": direction,
            "amount": amount,
            "symbol": self.inner.symbol,
            "orderId": result.order_id,
            "batchIndex": completed,
            "batchTotal": total,
        }))
        .await;

        info!(completed, total, direction = %direction, "Batch order placed");
        self.emit(CoordinatorEvent::BatchProgress { completed, total });

        if completed >= total {
            info!(total, "Batch finished");
            self.emit(CoordinatorEvent::BatchFinished { total });
            return None;
        }
        Some(BATCH_ORDER_INTERVAL)
    }

    fn emit_order_placed(&self, kind: CycleKind, side: TradeSide, result: &OrderResult) {
        self.emit(CoordinatorEvent::OrderPlaced {
            kind,
            side,
            order_id: result.order_id.clone().unwrap_or_default(),
        });
    }

    fn report_failure(&self, kind: CycleKind, error: &TradingError) {
        let retry_in = kind.interval();
        warn!(
            cycle = %kind,
            error = %error,
            retry_in_ms = retry_in.as_millis() as u64,
            "Cycle step failed, retrying"
        );
        self.emit(CoordinatorEvent::CycleFailed {
            kind,
            error: error.to_string(),
            retry_in,
        });
    }

    async fn record_history(&self, payload: Value) {
        let Some(entry) = TradeHistoryEntry::from_value(payload) else {
            return;
        };
        if let Err(e) = self.inner.store.append_history(&entry).await {
            warn!(error = %e, "Failed to record trade history");
        }
    }

    /// Send an order to the trading page and wait for its result.
    pub async fn execute_trade_order(&self, order: OrderRequest) -> Result<OrderResult, TradingError> {
        info!(
            order_type = %order.order_type,
            side = %order.side,
            amount = %order.amount,
            "Sending order to trading page"
        );

        let result = OrderResult::from(self.deliver(Request::ExecuteMarketOrder(order)).await?);
        if !result.success {
            let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(TradingError::OrderRejected(reason));
        }
        Ok(result)
    }

    /// Resolve the trading page and hand it a request. The page that answered
    /// becomes the last active surface.
    async fn deliver(&self, request: Request) -> Result<Response, TradingError> {
        let last_active = self.inner.state.read().await.last_active_surface_id.clone();

        let surface = resolve_surface(self.inner.surfaces.as_ref(), last_active.as_ref())
            .await
            .map_err(|e| TradingError::SurfaceUnreachable(e.to_string()))?
            .ok_or(TradingError::NoActiveSurface)?;

        let response = self
            .inner
            .surfaces
            .send(&surface.id, request)
            .await
            .map_err(|e| TradingError::SurfaceUnreachable(e.to_string()))?;

        if last_active.as_ref() != Some(&surface.id) {
            let mut state = self.inner.state.write().await;
            state.last_active_surface_id = Some(surface.id.clone());
            self.inner.store.save(state.clone());
            debug!(surface = %surface.id, "Active trading page changed");
        }

        Ok(response)
    }

    pub async fn log_trade(&self, trade_data: Value) -> Result<TradeHistoryEntry, TradingError> {
        let entry = TradeHistoryEntry::from_value(trade_data).ok_or(TradingError::InvalidTradeData)?;
        self.inner.store.append_history(&entry).await?;
        Ok(entry)
    }

    /// Restart cycles left running by a previous process.
    ///
    /// Persisted flags whose parameters cannot be resumed are cleared. When no
    /// trading page is open nothing is scheduled and the flags stay set until
    /// an explicit stop.
    pub async fn resume(&self) -> ResumeOutcome {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            let mut reconciled = false;

            if state.batch_opening && state.batch_remaining() == 0 {
                info!(total = state.batch_total, "Persisted batch already complete, clearing flag");
                state.batch_opening = false;
                reconciled = true;
            }
            if state.batch_opening && validate_amount(state.batch_amount).is_err() {
                warn!(amount = %state.batch_amount, "Persisted batch has an invalid amount, clearing flag");
                state.batch_opening = false;
                reconciled = true;
            }
            if state.auto_trading && validate_amount(state.auto_amount).is_err() {
                warn!(amount = %state.auto_amount, "Persisted auto-trade has an invalid amount, clearing flag");
                state.auto_trading = false;
                reconciled = true;
            }

            if reconciled {
                self.inner.store.save(state.clone());
            }
            state.clone()
        };

        if !snapshot.is_trading() {
            return ResumeOutcome::Idle;
        }

        match resolve_surface(self.inner.surfaces.as_ref(), snapshot.last_active_surface_id.as_ref()).await {
            Ok(Some(surface)) => info!(surface = %surface.id, "Resuming previous session"),
            Ok(None) => {
                info!("Previous session was trading but no trading page is open, not resuming");
                return ResumeOutcome::Deferred;
            }
            Err(e) => {
                warn!(error = %e, "Could not look for a trading page, not resuming");
                return ResumeOutcome::Deferred;
            }
        }

        if snapshot.auto_trading {
            if let Err(e) = self.start_auto_trade(snapshot.auto_amount).await {
                warn!(error = %e, "Failed to resume auto-trade");
            }
        }
        if snapshot.batch_opening {
            let remaining = snapshot.batch_remaining();
            info!(remaining, "Resuming batch with remaining orders");
            if let Err(e) = self
                .start_batch_open(snapshot.batch_direction, snapshot.batch_amount, remaining)
                .await
            {
                warn!(error = %e, "Failed to resume batch open");
            }
        }

        ResumeOutcome::Resumed
    }

    /// Cancel pending ticks without touching the flags, then wait for queued
    /// writes. The next start resumes where this one left off.
    pub async fn shutdown(&self) {
        {
            let mut cycles = self.inner.cycles.lock().await;
            for kind in [CycleKind::AutoTrade, CycleKind::BatchOpen] {
                cycles.slot_mut(kind).cancel();
            }
        }
        self.inner.store.flush().await;
        info!("Coordinator stopped");
    }

    /// Answer one request from the message bus.
    pub async fn handle(&self, request: Request) -> Response {
        if let Err(e) = request.validate() {
            return Response::failure(e.to_string());
        }

        let action = request.action();
        debug!(action, "Handling request");

        match request {
            Request::GetTradingState => Response::ok().with_state(self.state().await),
            Request::UpdateTradingState { state } => match self.update_state(&state).await {
                Ok(_) => Response::ok(),
                Err(e) => Response::failure(e.to_string()),
            },
            Request::StartAutoTrade { amount } => ack(self.start_auto_trade(amount).await),
            Request::StopAutoTrade => {
                self.stop_auto_trade().await;
                Response::ok()
            }
            Request::StartBatchOpen {
                direction,
                amount,
                count,
            } => ack(self.start_batch_open(direction, amount, count).await),
            Request::StopBatchOpen => {
                self.stop_batch_open().await;
                Response::ok()
            }
            Request::StopAllTrading => {
                self.stop_all_trading().await;
                Response::ok()
            }
            Request::GetTradeHistory { limit } => match self.inner.store.history(limit).await {
                Ok(history) => Response::ok().with_history(history),
                Err(e) => Response::failure(TradingError::Store(e).to_string()),
            },
            Request::ClearTradeHistory => match self.inner.store.clear_history().await {
                Ok(()) => Response::ok(),
                Err(e) => Response::failure(TradingError::Store(e).to_string()),
            },
            Request::LogTrade { trade_data } => match self.log_trade(trade_data).await {
                Ok(_) => Response::ok(),
                Err(e) => Response::failure(e.to_string()),
            },
            Request::ExecuteMarketOrder(order) => match self.execute_trade_order(order).await {
                Ok(result) => result.into(),
                Err(e) => Response::failure(e.to_string()),
            },
            page_request @ (Request::GetCurrentPrice { .. } | Request::Ping) => {
                match self.deliver(page_request).await {
                    Ok(response) => response,
                    Err(e) => Response::failure(e.to_string()),
                }
            }
        }
    }

    /// Serve bus requests until every sender is gone. Each request runs in its
    /// own task so a slow page round trip does not block the others.
    pub async fn serve(&self, mut requests: mpsc::Receiver<Envelope>) {
        while let Some(Envelope { request, reply }) = requests.recv().await {
            let this = self.clone();
            tokio::spawn(async move {
                let response = this.handle(request).await;
                // requester may have gone away
                let _ = reply.send(response);
            });
        }
        debug!("Request bus closed");
    }
}

fn ack(result: Result<(), TradingError>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => Response::failure(e.to_string()),
    }
}
