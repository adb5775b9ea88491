//! Data models for promobots storage.
//!
//! Rows are decoded into private `*Row` structs and converted into the
//! public records, so every value leaving the storage layer has passed
//! validation.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::db::DatabaseError;

/// Lifecycle status of a hosted bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotStatus {
    Active,
    Inactive,
    Error,
}

impl BotStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            other => Err(DatabaseError::Validation(format!(
                "unknown bot status '{other}'"
            ))),
        }
    }
}

/// A hosted bot. The token is only ever held here as ciphertext sealed by
/// key `encryption_version`.
#[derive(Clone, PartialEq, Eq)]
pub struct BotRecord {
    pub id: Uuid,
    /// Platform-assigned bot id, unknown until the first successful auth.
    pub bot_id: Option<i64>,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub encrypted_token: Vec<u8>,
    pub encryption_version: u32,
    pub status: BotStatus,
    pub last_error: Option<String>,
    pub last_checked_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub disabled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BotRecord {
    /// A fresh, not yet persisted record. `id` and timestamps are assigned on create.
    pub fn new(
        username: impl Into<String>,
        encrypted_token: Vec<u8>,
        encryption_version: u32,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            bot_id: None,
            username: username.into(),
            first_name: None,
            last_name: None,
            encrypted_token,
            encryption_version,
            status: BotStatus::Inactive,
            last_error: None,
            last_checked_at: None,
            revoked_at: None,
            disabled_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Whether the bot may be brought online.
    pub const fn is_live(&self) -> bool {
        self.revoked_at.is_none() && self.disabled_at.is_none()
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.username.trim().is_empty() {
            return Err(DatabaseError::Validation("bot username is empty".into()));
        }
        if self.encryption_version == 0 {
            return Err(DatabaseError::Validation(
                "encryption_version must be positive".into(),
            ));
        }
        if self.encrypted_token.is_empty() {
            return Err(DatabaseError::Validation("encrypted_token is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for BotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotRecord")
            .field("id", &self.id)
            .field("bot_id", &self.bot_id)
            .field("username", &self.username)
            .field("encrypted_token", &format_args!("<{} bytes>", self.encrypted_token.len()))
            .field("encryption_version", &self.encryption_version)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("revoked_at", &self.revoked_at)
            .field("disabled_at", &self.disabled_at)
            .finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct BotRow {
    id: Uuid,
    bot_id: Option<i64>,
    username: String,
    first_name: Option<String>,
    last_name: Option<String>,
    encrypted_token: Vec<u8>,
    encryption_version: i64,
    status: String,
    last_error: Option<String>,
    last_checked_at: Option<i64>,
    revoked_at: Option<i64>,
    disabled_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<BotRow> for BotRecord {
    type Error = DatabaseError;

    fn try_from(row: BotRow) -> Result<Self, Self::Error> {
        let encryption_version = u32::try_from(row.encryption_version).map_err(|_| {
            DatabaseError::Validation(format!(
                "bot {} has out-of-range encryption_version {}",
                row.id, row.encryption_version
            ))
        })?;
        Ok(Self {
            id: row.id,
            bot_id: row.bot_id,
            username: row.username,
            first_name: row.first_name,
            last_name: row.last_name,
            encrypted_token: row.encrypted_token,
            encryption_version,
            status: row.status.parse()?,
            last_error: row.last_error,
            last_checked_at: row.last_checked_at,
            revoked_at: row.revoked_at,
            disabled_at: row.disabled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

impl UserRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(DatabaseError::Validation(format!(
                "unknown user role '{other}'"
            ))),
        }
    }
}

/// An end user who contacted one of the hosted bots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: i64,
    pub blocked_at: Option<i64>,
}

impl UserRecord {
    pub fn new(telegram_id: i64) -> Self {
        Self {
            id: Uuid::nil(),
            telegram_id,
            username: None,
            first_name: None,
            last_name: None,
            role: UserRole::User,
            is_active: true,
            created_at: 0,
            blocked_at: None,
        }
    }

    pub const fn is_admin(&self) -> bool {
        matches!(self.role, UserRole::Admin)
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct UserRow {
    id: Uuid,
    telegram_id: i64,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    role: String,
    is_active: bool,
    created_at: i64,
    blocked_at: Option<i64>,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = DatabaseError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            telegram_id: row.telegram_id,
            username: row.username,
            first_name: row.first_name,
            last_name: row.last_name,
            role: row.role.parse()?,
            is_active: row.is_active,
            created_at: row.created_at,
            blocked_at: row.blocked_at,
        })
    }
}
