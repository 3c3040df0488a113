//! PostgreSQL state store

use super::{StateStats, StateStore};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::OrderEvent;
use crate::order::Order;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// State store backed by PostgreSQL
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Connect using the `[database]` section
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| RelayerError::Config("database.url is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_cursors (
                chain_id VARCHAR(64) PRIMARY KEY,
                cursor_position BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id VARCHAR(66) PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_status
            ON orders (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_events (
                id BIGSERIAL PRIMARY KEY,
                order_id VARCHAR(66) NOT NULL,
                event_type VARCHAR(50) NOT NULL,
                event_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_order_events_order
            ON order_events (order_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        // Amounts are u128, so bodies travel as text rather than `serde_json::Value`
        let rows = sqlx::query("SELECT body::text AS body FROM orders ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let body: String = row.get("body");
                serde_json::from_str(&body).map_err(RelayerError::from)
            })
            .collect()
    }

    async fn save_order(&self, order: &Order) -> RelayerResult<()> {
        let body = serde_json::to_string(order)?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, status, body, created_at, updated_at)
            VALUES ($1, $2, $3::jsonb, $4, $5)
            ON CONFLICT (order_id)
            DO UPDATE SET status = $2, body = $3::jsonb, updated_at = $5
            WHERE orders.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(&order.order_id)
        .bind(order.status.as_str())
        .bind(body)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved order {} ({})", order.order_id, order.status);
        Ok(())
    }

    async fn load_cursor(&self, chain_id: &str) -> RelayerResult<u64> {
        let row = sqlx::query("SELECT cursor_position FROM chain_cursors WHERE chain_id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("cursor_position") as u64)
            .unwrap_or(0))
    }

    async fn save_cursor(&self, chain_id: &str, cursor: u64) -> RelayerResult<()> {
        let position = i64::try_from(cursor)
            .map_err(|_| RelayerError::Validation(format!("cursor {} out of range", cursor)))?;

        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, cursor_position, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET cursor_position = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_id)
        .bind(position)
        .execute(&self.pool)
        .await?;

        debug!("Saved cursor for chain {}: {}", chain_id, cursor);
        Ok(())
    }

    async fn append_event(&self, event: &OrderEvent) -> RelayerResult<()> {
        let event_data = serde_json::to_string(event)?;

        sqlx::query(
            r#"
            INSERT INTO order_events (order_id, event_type, event_data, created_at)
            VALUES ($1, $2, $3::jsonb, $4)
            "#,
        )
        .bind(&event.order_id)
        .bind(event.name())
        .bind(event_data)
        .bind(event.at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_stats(&self) -> RelayerResult<StateStats> {
        let mut stats = StateStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM orders GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            stats.orders_by_status.insert(status, count as u64);
        }

        let row = sqlx::query("SELECT COUNT(*) AS count FROM order_events")
            .fetch_one(&self.pool)
            .await?;
        stats.events_recorded = row.get::<i64, _>("count") as u64;

        let rows = sqlx::query("SELECT chain_id, cursor_position FROM chain_cursors")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let chain_id: String = row.get("chain_id");
            let position: i64 = row.get("cursor_position");
            stats.cursors.insert(chain_id, position as u64);
        }

        Ok(stats)
    }
}
