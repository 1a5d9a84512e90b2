//! SQLite persistence for the trading session.
//!
//! Stores everything needed to resume after restart:
//! - The singleton session state row (cycle flags, amounts, batch progress)
//! - The capped trade history log

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{SessionState, TradeHistoryEntry, TradeSide, HISTORY_CAPACITY};
use crate::store::SessionStore;
use crate::surface::SurfaceId;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Session state row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSessionState {
    pub id: i64,
    pub auto_trading: bool,
    pub auto_amount: String,
    pub batch_opening: bool,
    pub batch_direction: String,
    pub batch_amount: String,
    pub batch_total: i64,
    pub batch_completed: i64,
    pub trade_count: i64,
    pub last_active_surface: Option<String>,
    pub updated_at: String,
}

impl TryFrom<StoredSessionState> for SessionState {
    type Error = anyhow::Error;

    fn try_from(row: StoredSessionState) -> Result<Self> {
        Ok(SessionState {
            auto_trading: row.auto_trading,
            auto_amount: Decimal::from_str(&row.auto_amount)
                .with_context(|| format!("Bad auto_amount {:?}", row.auto_amount))?,
            batch_opening: row.batch_opening,
            batch_direction: TradeSide::from_str(&row.batch_direction).map_err(|e| anyhow!(e))?,
            batch_amount: Decimal::from_str(&row.batch_amount)
                .with_context(|| format!("Bad batch_amount {:?}", row.batch_amount))?,
            batch_total: u32::try_from(row.batch_total).context("Bad batch_total")?,
            batch_completed: u32::try_from(row.batch_completed).context("Bad batch_completed")?,
            trade_count: u64::try_from(row.trade_count).context("Bad trade_count")?,
            last_active_surface_id: row.last_active_surface.map(SurfaceId::new),
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that is never recycled,
    /// since every SQLite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                auto_trading INTEGER NOT NULL DEFAULT 0,
                auto_amount TEXT NOT NULL DEFAULT '0',
                batch_opening INTEGER NOT NULL DEFAULT 0,
                batch_direction TEXT NOT NULL DEFAULT 'BUY',
                batch_amount TEXT NOT NULL DEFAULT '0',
                batch_total INTEGER NOT NULL DEFAULT 0,
                batch_completed INTEGER NOT NULL DEFAULT 0,
                trade_count INTEGER NOT NULL DEFAULT 0,
                last_active_surface TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                CHECK (batch_completed <= batch_total)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trade_history_trade_id ON trade_history(trade_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn load_state(&self) -> Result<Option<SessionState>> {
        let row = sqlx::query_as::<_, StoredSessionState>("SELECT * FROM session_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch session state")?;

        row.map(SessionState::try_from).transpose()
    }

    async fn save_state(&self, state: &SessionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_state (
                id, auto_trading, auto_amount, batch_opening, batch_direction, batch_amount,
                batch_total, batch_completed, trade_count, last_active_surface, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                auto_trading = excluded.auto_trading,
                auto_amount = excluded.auto_amount,
                batch_opening = excluded.batch_opening,
                batch_direction = excluded.batch_direction,
                batch_amount = excluded.batch_amount,
                batch_total = excluded.batch_total,
                batch_completed = excluded.batch_completed,
                trade_count = excluded.trade_count,
                last_active_surface = excluded.last_active_surface,
                updated_at = datetime('now')
            "#,
        )
        .bind(state.auto_trading)
        .bind(state.auto_amount.to_string())
        .bind(state.batch_opening)
        .bind(state.batch_direction.as_str())
        .bind(state.batch_amount.to_string())
        .bind(i64::from(state.batch_total))
        .bind(i64::from(state.batch_completed))
        .bind(i64::try_from(state.trade_count).unwrap_or(i64::MAX))
        .bind(state.last_active_surface_id.as_ref().map(|id| id.as_str().to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to save session state")?;

        Ok(())
    }

    async fn append_history(&self, entry: &TradeHistoryEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO trade_history (trade_id, timestamp, payload) VALUES (?, ?, ?)")
            .bind(&entry.id)
            .bind(&entry.timestamp)
            .bind(payload)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM trade_history WHERE seq NOT IN (
                SELECT seq FROM trade_history ORDER BY seq DESC LIMIT ?
            )
            "#,
        )
        .bind(HISTORY_CAPACITY as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to append trade history")?;
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<TradeHistoryEntry>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT trade_id, timestamp, payload FROM trade_history ORDER BY seq DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trade history")?;

        rows.into_iter()
            .map(|(id, timestamp, payload)| {
                let payload: Map<String, Value> = serde_json::from_str(&payload)
                    .with_context(|| format!("Corrupt payload for {}", id))?;
                Ok(TradeHistoryEntry { payload, timestamp, id })
            })
            .collect()
    }

    async fn clear_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM trade_history")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_round_trips_through_sqlite() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_state().await.unwrap().is_none());

        let state = SessionState {
            auto_trading: true,
            auto_amount: dec!(20.5),
            batch_opening: true,
            batch_direction: TradeSide::Sell,
            batch_amount: dec!(15),
            batch_total: 3,
            batch_completed: 1,
            trade_count: 42,
            last_active_surface_id: Some(SurfaceId::new("tab-7")),
        };
        tokio_test::assert_ok!(db.save_state(&state).await);
        assert_eq!(db.load_state().await.unwrap(), Some(state.clone()));

        let stopped = SessionState {
            auto_trading: false,
            ..state
        };
        db.save_state(&stopped).await.unwrap();
        assert_eq!(db.load_state().await.unwrap(), Some(stopped));
    }

    #[tokio::test]
    async fn test_history_keeps_newest_hundred() {
        let db = Database::in_memory().await.unwrap();

        for n in 0..(HISTORY_CAPACITY + 5) {
            let entry = TradeHistoryEntry::from_value(json!({ "n": n })).unwrap();
            db.append_history(&entry).await.unwrap();
        }

        let history = db.history(500).await.unwrap();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].payload["n"], json!(HISTORY_CAPACITY + 4));
        assert_eq!(history[HISTORY_CAPACITY - 1].payload["n"], json!(5));

        db.clear_history().await.unwrap();
        assert!(db.history(10).await.unwrap().is_empty());
    }
}
