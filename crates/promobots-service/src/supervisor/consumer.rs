//! Per-bot update consumer.
//!
//! ```text
//! INIT --auth ok--> RUNNING --cancel / token rejected--> STOPPED
//!   |
//!   +--auth fail--> DEAD (recorded on the bot, not retried)
//! ```
//!
//! Poll and send errors inside RUNNING are logged and the loop continues.

use std::sync::Arc;

use promobots_core::db::unix_timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::BotSupervisor;
use crate::platform::{BotProfile, PlatformClient, PlatformError};
use crate::storage::{BotRecord, BotStatus, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Cancelled,
    /// The platform stopped accepting the token mid-run.
    ChannelClosed,
    /// `get_me` failed; the bot never reached RUNNING.
    Dead,
}

pub(super) struct Consumer {
    record: BotRecord,
    client: Arc<dyn PlatformClient>,
    supervisor: BotSupervisor,
    cancel: CancellationToken,
}

impl Consumer {
    pub(super) fn new(
        record: BotRecord,
        client: Arc<dyn PlatformClient>,
        supervisor: BotSupervisor,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            record,
            client,
            supervisor,
            cancel,
        }
    }

    pub(super) async fn run(mut self) -> ConsumerExit {
        let me = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return ConsumerExit::Cancelled,
            me = self.client.get_me() => me,
        };
        match me {
            Ok(profile) => self.mark_active(&profile).await,
            Err(e) => {
                error!(bot_id = %self.record.id, username = %self.record.username, error = %e, "Bot authentication failed");
                self.mark_error(&e).await;
                return ConsumerExit::Dead;
            }
        }

        let poll_timeout = self.supervisor.settings().poll_timeout;
        let retry_delay = self.supervisor.settings().retry_delay;
        let mut offset = None;

        loop {
            let batch = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return ConsumerExit::Cancelled,
                batch = self.client.get_updates(offset, poll_timeout) => batch,
            };

            match batch {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.next_offset);
                        if let Some(message) = update.message {
                            self.supervisor
                                .handle_message(self.client.as_ref(), &self.record, message, &self.cancel)
                                .await;
                        }
                    }
                }
                Err(PlatformError::Unauthorized) => {
                    warn!(bot_id = %self.record.id, "Bot token rejected while polling");
                    self.mark_error(&PlatformError::Unauthorized).await;
                    return ConsumerExit::ChannelClosed;
                }
                Err(e) => {
                    warn!(bot_id = %self.record.id, error = %e, "Polling for updates failed");
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return ConsumerExit::Cancelled,
                        () = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn mark_active(&mut self, profile: &BotProfile) {
        let id = self.record.id;
        let result = self
            .patch_record(|record| {
                record.bot_id = Some(profile.bot_id);
                record.username.clone_from(&profile.username);
                record.first_name = Some(profile.first_name.clone());
                record.last_name.clone_from(&profile.last_name);
                record.status = BotStatus::Active;
                record.last_error = None;
            })
            .await;
        match result {
            Ok(()) => info!(bot_id = %id, username = %self.record.username, platform_id = profile.bot_id, "Bot authenticated"),
            Err(e) => warn!(bot_id = %id, error = %e, "Failed to record bot activation"),
        }
    }

    async fn mark_error(&mut self, cause: &PlatformError) {
        let reason = cause.to_string();
        let result = self
            .patch_record(|record| {
                record.status = BotStatus::Error;
                record.last_error = Some(reason);
            })
            .await;
        if let Err(e) = result {
            warn!(bot_id = %self.record.id, error = %e, "Failed to record bot error");
        }
    }

    /// Apply `patch` to the stored record and persist it, stamping `last_checked_at`.
    ///
    /// Re-reads first so admin edits made while this consumer ran are kept.
    /// Nothing is written once the bot has been stopped or revoked.
    async fn patch_record(
        &mut self,
        patch: impl FnOnce(&mut BotRecord),
    ) -> Result<(), DatabaseError> {
        let bots = &self.supervisor.bots;
        let mut record = bots.get_by_id(self.record.id).await?;
        if self.cancel.is_cancelled() || !record.is_live() {
            return Ok(());
        }
        patch(&mut record);
        record.last_checked_at = Some(unix_timestamp());
        self.record = bots.update(&record).await?;
        Ok(())
    }
}
