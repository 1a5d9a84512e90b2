//! In-memory session store for ephemeral runs and tests.

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{SessionState, TradeHistoryEntry, HISTORY_CAPACITY};

use super::SessionStore;

/// Session store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<Option<SessionState>>,
    history: RwLock<VecDeque<TradeHistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a saved state, as if left by a previous run.
    pub fn with_state(state: SessionState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
            history: RwLock::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_state(&self) -> Result<Option<SessionState>> {
        Ok(self.state.read().await.clone())
    }

    async fn save_state(&self, state: &SessionState) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    async fn append_history(&self, entry: &TradeHistoryEntry) -> Result<()> {
        let mut history = self.history.write().await;
        history.push_front(entry.clone());
        history.truncate(HISTORY_CAPACITY);
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<TradeHistoryEntry>> {
        let history = self.history.read().await;
        Ok(history.iter().take(limit).cloned().collect())
    }

    async fn clear_history(&self) -> Result<()> {
        self.history.write().await.clear();
        Ok(())
    }
}
