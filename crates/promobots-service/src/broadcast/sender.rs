//! Best-effort delivery of a broadcast to its targeted users.
//!
//! Recipients who blocked the bot are deactivated so later broadcasts skip
//! them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::BroadcastRegistry;
use super::targeting::TargetResolver;
use crate::platform::{OutboundMessage, PlatformClient, PlatformError};
use crate::storage::{DatabaseError, SnapshotSource, UserRepository};

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Broadcast '{0}' not found")]
    NotFound(String),

    #[error("Failed to read template {path}: {reason}")]
    Template { path: PathBuf, reason: String },

    #[error("Failed to load user snapshots: {0}")]
    Snapshots(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub targeted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Failed recipients whose user record was deactivated.
    pub deactivated: usize,
}

pub struct BroadcastSender {
    registry: Arc<BroadcastRegistry>,
    snapshots: Arc<dyn SnapshotSource>,
    users: Arc<dyn UserRepository>,
    resolver: Arc<dyn TargetResolver>,
    send_interval: Duration,
}

impl BroadcastSender {
    pub fn new(
        registry: Arc<BroadcastRegistry>,
        snapshots: Arc<dyn SnapshotSource>,
        users: Arc<dyn UserRepository>,
        resolver: Arc<dyn TargetResolver>,
        send_interval: Duration,
    ) -> Self {
        Self {
            registry,
            snapshots,
            users,
            resolver,
            send_interval,
        }
    }

    /// Send broadcast `id` through `client` to every user its targeting selects.
    ///
    /// Individual send failures are counted, not returned. Cancellation stops
    /// the run between recipients and reports what was done so far.
    pub async fn send(
        &self,
        id: &str,
        client: &dyn PlatformClient,
        cancel: &CancellationToken,
    ) -> Result<BroadcastReport, BroadcastError> {
        let definition = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| BroadcastError::NotFound(id.to_owned()))?;

        let text = tokio::fs::read_to_string(&definition.template_file)
            .await
            .map_err(|e| BroadcastError::Template {
                path: definition.template_file.clone(),
                reason: e.to_string(),
            })?;

        if let Some(targeting) = &definition.targeting {
            let unknown = targeting.unknown_conditions();
            if !unknown.is_empty() {
                warn!(broadcast_id = %id, conditions = ?unknown, "Broadcast has unknown targeting conditions; no user will match");
            }
        }

        let users = self.snapshots.snapshots().await?;
        let recipients = self.resolver.select(&users, definition.targeting.as_ref());
        let mut report = BroadcastReport {
            targeted: recipients.len(),
            ..BroadcastReport::default()
        };

        let mut message = OutboundMessage {
            chat_id: 0,
            text,
            photos: definition.photos.clone(),
            keyboard: definition.inline_keyboard.clone(),
        };

        for (index, chat_id) in recipients.into_iter().enumerate() {
            if index > 0 && !self.send_interval.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.send_interval) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            message.chat_id = chat_id;
            match client.send(&message).await {
                Ok(()) => report.sent += 1,
                Err(PlatformError::Blocked) => {
                    report.failed += 1;
                    match self.users.deactivate_by_telegram_id(chat_id).await {
                        Ok(Some(user_id)) => {
                            info!(broadcast_id = %id, chat_id, %user_id, "Recipient blocked the bot; user deactivated");
                            report.deactivated += 1;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(broadcast_id = %id, chat_id, error = %e, "Failed to deactivate blocked recipient");
                        }
                    }
                }
                Err(e) => {
                    warn!(broadcast_id = %id, chat_id, error = %e, "Broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            broadcast_id = %id,
            targeted = report.targeted,
            sent = report.sent,
            failed = report.failed,
            deactivated = report.deactivated,
            "Broadcast finished"
        );
        Ok(report)
    }
}
