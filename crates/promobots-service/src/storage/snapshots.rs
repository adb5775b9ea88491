//! Scenario state and payment bookkeeping feeding broadcast targeting.

use std::collections::HashMap;

use async_trait::async_trait;
use promobots_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::repository::SnapshotSource;
use crate::broadcast::UserSnapshot;

/// Payment status that counts as "paid".
pub const PAYMENT_SUCCEEDED: &str = "succeeded";

impl Database {
    /// Record the scenario a user is currently in. An empty id clears it.
    pub async fn set_active_scenario(
        &self,
        telegram_id: i64,
        scenario_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO scenario_states (telegram_id, active_scenario_id, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(telegram_id) DO UPDATE SET \
             active_scenario_id = excluded.active_scenario_id, updated_at = excluded.updated_at",
        )
        .bind(telegram_id)
        .bind(scenario_id)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_payment(
        &self,
        telegram_id: i64,
        product_id: &str,
        status: &str,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO payments (id, telegram_id, product_id, status, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(telegram_id)
        .bind(product_id)
        .bind(status)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(id)
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    telegram_id: i64,
    active_scenario_id: String,
    has_paid: bool,
}

#[async_trait]
impl SnapshotSource for Database {
    async fn snapshots(&self) -> Result<HashMap<i64, UserSnapshot>, DatabaseError> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT u.telegram_id AS telegram_id, \
             COALESCE(s.active_scenario_id, '') AS active_scenario_id, \
             EXISTS (SELECT 1 FROM payments p \
                     WHERE p.telegram_id = u.telegram_id AND p.status = ?) AS has_paid \
             FROM users u \
             LEFT JOIN scenario_states s ON s.telegram_id = u.telegram_id \
             WHERE u.is_active = 1",
        )
        .bind(PAYMENT_SUCCEEDED)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.telegram_id,
                    UserSnapshot {
                        active_scenario_id: row.active_scenario_id,
                        has_paid_any_product: row.has_paid,
                    },
                )
            })
            .collect())
    }
}
