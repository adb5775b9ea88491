//! Repository interfaces over the storage backend.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use super::db::DatabaseError;
use super::models::{BotRecord, UserRecord};
use crate::broadcast::UserSnapshot;

/// Durable CRUD over hosted bots.
#[async_trait]
pub trait BotRepository: Send + Sync {
    /// Insert `record`, assigning a fresh id and timestamps.
    ///
    /// Fails with `Conflict` if a non-revoked bot already has the username.
    async fn create(&self, record: BotRecord) -> Result<BotRecord, DatabaseError>;

    async fn get_by_id(&self, id: Uuid) -> Result<BotRecord, DatabaseError>;

    /// Look up by the platform-assigned bot id.
    async fn get_by_platform_id(&self, bot_id: i64) -> Result<BotRecord, DatabaseError>;

    /// Look up a non-revoked bot by username.
    async fn get_by_username(&self, username: &str) -> Result<BotRecord, DatabaseError>;

    /// Replace every mutable column of the record keyed by `record.id`.
    async fn update(&self, record: &BotRecord) -> Result<BotRecord, DatabaseError>;

    async fn delete(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// All bots, revoked and failed ones included.
    async fn list_all(&self) -> Result<Vec<BotRecord>, DatabaseError>;
}

/// Durable CRUD over end users. Reads only ever see active users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, record: UserRecord) -> Result<UserRecord, DatabaseError>;

    async fn get_by_id(&self, id: Uuid) -> Result<UserRecord, DatabaseError>;

    async fn get_by_telegram_id(&self, telegram_id: i64) -> Result<UserRecord, DatabaseError>;

    async fn update(&self, record: &UserRecord) -> Result<UserRecord, DatabaseError>;

    /// Soft-delete: clears `is_active` and stamps `blocked_at`.
    async fn deactivate(&self, id: Uuid) -> Result<Uuid, DatabaseError>;

    /// Deactivate the active user with `telegram_id`, if there is one.
    ///
    /// Used when the platform reports that the user blocked the bot or
    /// deleted their account.
    async fn deactivate_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<Uuid>, DatabaseError> {
        match self.get_by_telegram_id(telegram_id).await {
            Ok(user) => self.deactivate(user.id).await.map(Some),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Newest first.
    async fn list_all(&self, limit: u32, offset: u32) -> Result<Vec<UserRecord>, DatabaseError>;

    async fn count_active(&self) -> Result<u64, DatabaseError>;
}

/// Per-user state used to evaluate broadcast targeting, keyed by chat id.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshots(&self) -> Result<HashMap<i64, UserSnapshot>, DatabaseError>;
}
