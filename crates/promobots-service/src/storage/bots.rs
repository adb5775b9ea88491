//! Bot queries.

use async_trait::async_trait;
use promobots_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{BotRecord, BotRow};
use super::repository::BotRepository;

const SELECT_BOT: &str = "SELECT id, bot_id, username, first_name, last_name, encrypted_token, \
     encryption_version, status, last_error, last_checked_at, revoked_at, disabled_at, \
     created_at, updated_at FROM telegram_bots";

fn select_bot(clause: &str) -> String {
    format!("{SELECT_BOT} WHERE {clause}")
}

#[async_trait]
impl BotRepository for Database {
    async fn create(&self, mut record: BotRecord) -> Result<BotRecord, DatabaseError> {
        record.validate()?;
        let now = unix_timestamp();
        record.id = Uuid::new_v4();
        record.created_at = now;
        record.updated_at = now;

        sqlx::query(
            "INSERT INTO telegram_bots (id, bot_id, username, first_name, last_name, \
             encrypted_token, encryption_version, status, last_error, last_checked_at, \
             revoked_at, disabled_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.bot_id)
        .bind(&record.username)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.encrypted_token)
        .bind(i64::from(record.encryption_version))
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(record.last_checked_at)
        .bind(record.revoked_at)
        .bind(record.disabled_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.pool())
        .await?;

        Ok(record)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<BotRecord, DatabaseError> {
        sqlx::query_as::<_, BotRow>(&select_bot("id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Bot {id}")))?
            .try_into()
    }

    async fn get_by_platform_id(&self, bot_id: i64) -> Result<BotRecord, DatabaseError> {
        sqlx::query_as::<_, BotRow>(&select_bot(
            "bot_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        ))
        .bind(bot_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Bot with platform id {bot_id}")))?
        .try_into()
    }

    async fn get_by_username(&self, username: &str) -> Result<BotRecord, DatabaseError> {
        sqlx::query_as::<_, BotRow>(&select_bot("username = ? AND revoked_at IS NULL"))
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Bot with username {username}")))?
            .try_into()
    }

    async fn update(&self, record: &BotRecord) -> Result<BotRecord, DatabaseError> {
        record.validate()?;
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE telegram_bots SET bot_id = ?, username = ?, first_name = ?, last_name = ?, \
             encrypted_token = ?, encryption_version = ?, status = ?, last_error = ?, \
             last_checked_at = ?, revoked_at = ?, disabled_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(record.bot_id)
        .bind(&record.username)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.encrypted_token)
        .bind(i64::from(record.encryption_version))
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(record.last_checked_at)
        .bind(record.revoked_at)
        .bind(record.disabled_at)
        .bind(now)
        .bind(record.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Bot {}", record.id)));
        }

        let mut updated = record.clone();
        updated.updated_at = now;
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM telegram_bots WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Bot {id}")));
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<BotRecord>, DatabaseError> {
        let sql = format!("{SELECT_BOT} ORDER BY created_at ASC, rowid ASC");
        sqlx::query_as::<_, BotRow>(&sql)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(BotRecord::try_from)
            .collect()
    }
}
