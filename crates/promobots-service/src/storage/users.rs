//! User queries. Every read filters on `is_active = 1`.

use async_trait::async_trait;
use promobots_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{UserRecord, UserRow};
use super::repository::UserRepository;

const SELECT_USER: &str = "SELECT id, telegram_id, username, first_name, last_name, role, \
     is_active, created_at, blocked_at FROM users";

#[async_trait]
impl UserRepository for Database {
    async fn create(&self, mut record: UserRecord) -> Result<UserRecord, DatabaseError> {
        record.id = Uuid::new_v4();
        record.created_at = unix_timestamp();
        record.is_active = true;
        record.blocked_at = None;

        sqlx::query(
            "INSERT INTO users (id, telegram_id, username, first_name, last_name, role, \
             is_active, created_at, blocked_at) VALUES (?, ?, ?, ?, ?, ?, 1, ?, NULL)",
        )
        .bind(record.id)
        .bind(record.telegram_id)
        .bind(&record.username)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(record.role.as_str())
        .bind(record.created_at)
        .execute(self.pool())
        .await?;

        Ok(record)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<UserRecord, DatabaseError> {
        sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} WHERE id = ? AND is_active = 1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))?
            .try_into()
    }

    async fn get_by_telegram_id(&self, telegram_id: i64) -> Result<UserRecord, DatabaseError> {
        sqlx::query_as::<_, UserRow>(&format!(
            "{SELECT_USER} WHERE telegram_id = ? AND is_active = 1"
        ))
        .bind(telegram_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("User with telegram id {telegram_id}")))?
        .try_into()
    }

    async fn update(&self, record: &UserRecord) -> Result<UserRecord, DatabaseError> {
        let result = sqlx::query(
            "UPDATE users SET telegram_id = ?, username = ?, first_name = ?, last_name = ?, \
             role = ? WHERE id = ? AND is_active = 1",
        )
        .bind(record.telegram_id)
        .bind(&record.username)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(record.role.as_str())
        .bind(record.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {}", record.id)));
        }
        self.get_by_id(record.id).await
    }

    async fn deactivate(&self, id: Uuid) -> Result<Uuid, DatabaseError> {
        let result = sqlx::query(
            "UPDATE users SET is_active = 0, blocked_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {id}")));
        }
        Ok(id)
    }

    async fn list_all(&self, limit: u32, offset: u32) -> Result<Vec<UserRecord>, DatabaseError> {
        sqlx::query_as::<_, UserRow>(&format!(
            "{SELECT_USER} WHERE is_active = 1 ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(UserRecord::try_from)
        .collect()
    }

    async fn count_active(&self) -> Result<u64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE is_active = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
