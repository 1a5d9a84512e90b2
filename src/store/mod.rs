//! Session state store: durable session state and trade history.
//!
//! Backends implement [`SessionStore`]; the coordinator talks to them through
//! [`StateStore`], which loads with defaults, serializes state writes through a
//! single writer task (write-behind: callers never wait for durability) and
//! keeps the history capped.

mod memory;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::models::{SessionState, TradeHistoryEntry, DEFAULT_HISTORY_LIMIT, HISTORY_CAPACITY};

pub use memory::MemoryStore;

/// Persistence backend for session state and trade history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the persisted state, `None` when nothing was saved yet.
    async fn load_state(&self) -> Result<Option<SessionState>>;

    /// Overwrite the persisted state.
    async fn save_state(&self, state: &SessionState) -> Result<()>;

    /// Prepend an entry, dropping the oldest beyond [`HISTORY_CAPACITY`].
    async fn append_history(&self, entry: &TradeHistoryEntry) -> Result<()>;

    /// Newest-first history, at most `limit` entries.
    async fn history(&self, limit: usize) -> Result<Vec<TradeHistoryEntry>>;

    async fn clear_history(&self) -> Result<()>;
}

enum WriteOp {
    Save(Box<SessionState>),
    Flush(oneshot::Sender<()>),
}

/// Write-behind front end over a [`SessionStore`] backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn SessionStore>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl StateStore {
    /// Wrap a backend and spawn its writer task. Must be called inside a Tokio runtime.
    pub fn new(backend: Arc<dyn SessionStore>) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_loop(backend.clone(), rx));
        Self { backend, writes }
    }

    async fn write_loop(backend: Arc<dyn SessionStore>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Save(state) => {
                    if let Err(e) = backend.save_state(&state).await {
                        warn!(error = %e, "Failed to persist session state");
                    }
                }
                WriteOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("State writer stopped");
    }

    /// Load the session state, seeding defaults on first run.
    pub async fn load(&self) -> Result<SessionState> {
        match self.backend.load_state().await.context("Failed to load session state")? {
            Some(state) => Ok(state),
            None => {
                let state = SessionState::default();
                self.backend
                    .save_state(&state)
                    .await
                    .context("Failed to seed default session state")?;
                debug!("Seeded default session state");
                Ok(state)
            }
        }
    }

    /// Queue a full overwrite of the persisted state. Returns immediately.
    pub fn save(&self, state: SessionState) {
        if self.writes.send(WriteOp::Save(Box::new(state))).is_err() {
            warn!("State writer is gone, session state not persisted");
        }
    }

    /// Wait until every queued save has been handed to the backend.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writes.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn append_history(&self, entry: &TradeHistoryEntry) -> Result<()> {
        self.backend
            .append_history(entry)
            .await
            .context("Failed to append trade history")
    }

    /// Newest-first history; `None` means [`DEFAULT_HISTORY_LIMIT`].
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<TradeHistoryEntry>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(HISTORY_CAPACITY);
        self.backend.history(limit).await.context("Failed to read trade history")
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.backend
            .clear_history()
            .await
            .context("Failed to clear trade history")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn entry(n: usize) -> TradeHistoryEntry {
        TradeHistoryEntry::from_value(json!({ "n": n })).unwrap()
    }

    #[tokio::test]
    async fn test_load_seeds_defaults() {
        let backend = Arc::new(MemoryStore::new());
        let store = StateStore::new(backend.clone());

        let state = store.load().await.unwrap();
        assert_eq!(state, SessionState::default());
        assert_eq!(backend.load_state().await.unwrap(), Some(SessionState::default()));
    }

    #[tokio::test]
    async fn test_saves_land_in_order() {
        let backend = Arc::new(MemoryStore::new());
        let store = StateStore::new(backend.clone());

        for count in 1..=25u64 {
            store.save(SessionState {
                trade_count: count,
                auto_amount: dec!(20),
                ..SessionState::default()
            });
        }
        store.flush().await;

        let saved = backend.load_state().await.unwrap().unwrap();
        assert_eq!(saved.trade_count, 25);
    }

    #[tokio::test]
    async fn test_history_is_capped_and_newest_first() {
        let store = StateStore::new(Arc::new(MemoryStore::new()));

        for n in 0..=HISTORY_CAPACITY {
            store.append_history(&entry(n)).await.unwrap();
        }

        let all = store.history(Some(1000)).await.unwrap();
        assert_eq!(all.len(), HISTORY_CAPACITY);
        assert_eq!(all[0].payload["n"], json!(HISTORY_CAPACITY));
        // entry 0 was the oldest and fell off
        assert_eq!(all.last().unwrap().payload["n"], json!(1));
    }

    #[tokio::test]
    async fn test_history_default_limit() {
        let store = StateStore::new(Arc::new(MemoryStore::new()));
        for n in 0..70 {
            store.append_history(&entry(n)).await.unwrap();
        }

        assert_eq!(store.history(None).await.unwrap().len(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(store.history(Some(5)).await.unwrap().len(), 5);

        store.clear_history().await.unwrap();
        assert!(store.history(None).await.unwrap().is_empty());
    }
}
