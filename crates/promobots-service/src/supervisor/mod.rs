//! Bot supervisor.
//!
//! Owns one long-poll consumer task per live bot. Tokens are decrypted only
//! here, copied once into a zeroizing string for the platform client, and
//! the decrypted buffer is wiped before the client is built.

mod consumer;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use promobots_crypto::{CryptoError, KeyStore};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::broadcast::{BroadcastRegistry, BroadcastSender};
use crate::platform::{ClientFactory, PlatformClient, PlatformError};
use crate::storage::{BotRecord, BotRepository, DatabaseError, UserRepository};

use consumer::Consumer;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Token unavailable: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Decrypted token is not valid UTF-8")]
    MalformedToken,

    #[error("Platform client error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Bot {0} is revoked or disabled")]
    NotLive(Uuid),

    #[error("Bot {0} is already running")]
    AlreadyRunning(Uuid),
}

/// Runtime knobs for consumers and command handlers.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Server-side wait for each long-poll request.
    pub poll_timeout: Duration,
    /// Pause after a failed poll before retrying.
    pub retry_delay: Duration,
    /// Platform user ids granted the admin role on first contact.
    pub admin_ids: Vec<i64>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            admin_ids: Vec::new(),
        }
    }
}

/// Collaborators the supervisor and its handlers use.
pub struct SupervisorDeps {
    pub bots: Arc<dyn BotRepository>,
    pub users: Arc<dyn UserRepository>,
    pub keys: KeyStore,
    pub factory: Arc<dyn ClientFactory>,
    pub registry: Arc<BroadcastRegistry>,
    pub sender: Arc<BroadcastSender>,
}

/// Outcome of [`BotSupervisor::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<Uuid>,
    /// Bots left offline, with the reason.
    pub skipped: Vec<(Uuid, String)>,
}

struct ConsumerHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct BotSupervisor {
    bots: Arc<dyn BotRepository>,
    users: Arc<dyn UserRepository>,
    keys: KeyStore,
    factory: Arc<dyn ClientFactory>,
    registry: Arc<BroadcastRegistry>,
    sender: Arc<BroadcastSender>,
    settings: Arc<SupervisorSettings>,
    ctx: CancellationToken,
    consumers: Arc<RwLock<HashMap<Uuid, ConsumerHandle>>>,
    generations: Arc<AtomicU64>,
}

impl BotSupervisor {
    /// Every consumer runs on a child of `ctx` and stops when it is cancelled.
    pub fn new(deps: SupervisorDeps, settings: SupervisorSettings, ctx: CancellationToken) -> Self {
        Self {
            bots: deps.bots,
            users: deps.users,
            keys: deps.keys,
            factory: deps.factory,
            registry: deps.registry,
            sender: deps.sender,
            settings: Arc::new(settings),
            ctx,
            consumers: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bring every stored, live bot online.
    ///
    /// Only a failure to list bots is returned; a bot that cannot be started
    /// is logged and reported in [`StartReport::skipped`].
    pub async fn start(&self) -> Result<StartReport, SupervisorError> {
        let records = self.bots.list_all().await?;
        let mut report = StartReport::default();

        for record in records {
            let id = record.id;
            if !record.is_live() {
                info!(bot_id = %id, username = %record.username, "Skipping revoked or disabled bot");
                report.skipped.push((id, "revoked or disabled".into()));
                continue;
            }

            let username = record.username.clone();
            let encryption_version = record.encryption_version;
            match self.launch(record).await {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    error!(
                        bot_id = %id,
                        username = %username,
                        encryption_version,
                        error = %e,
                        "Failed to start bot consumer"
                    );
                    report.skipped.push((id, e.to_string()));
                }
            }
        }

        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            "Bot fleet started"
        );
        Ok(report)
    }

    /// Decrypt the token of `record`, build its client and spawn a consumer.
    // Explicit `Send` bound breaks the auto-trait inference cycle
    // launch -> consumer task -> command handler -> launch.
    pub fn launch(
        &self,
        record: BotRecord,
    ) -> impl std::future::Future<Output = Result<(), SupervisorError>> + Send + '_ {
        async move {
            if !record.is_live() {
                return Err(SupervisorError::NotLive(record.id));
            }

            let mut consumers = self.consumers.write().await;
            if consumers.contains_key(&record.id) {
                return Err(SupervisorError::AlreadyRunning(record.id));
            }

            let client = self.connect(&record)?;
            if record.encryption_version != self.keys.current_version() {
                // TODO: re-seal the token under the current key and persist it once
                // rotation is meant to rewrite stored ciphertexts.
                debug!(
                    bot_id = %record.id,
                    encryption_version = record.encryption_version,
                    current_version = self.keys.current_version(),
                    "Bot token is sealed under an older key"
                );
            }
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);
            let cancel = self.ctx.child_token();
            let id = record.id;
            let username = record.username.clone();

            let consumer = Consumer::new(record, client, self.clone(), cancel.clone());
            let supervisor = self.clone();
            let task = tokio::spawn(async move {
                let exit = consumer.run().await;
                info!(bot_id = %id, ?exit, "Bot consumer stopped");
                supervisor.forget(id, generation).await;
            });

            consumers.insert(
                id,
                ConsumerHandle {
                    generation,
                    cancel,
                    task,
                },
            );
            info!(bot_id = %id, username = %username, "Bot consumer started");
            Ok(())
        }
    }

    fn connect(&self, record: &BotRecord) -> Result<Arc<dyn PlatformClient>, SupervisorError> {
        let encryptor = self.keys.encryptor_for(record.encryption_version)?;
        let plaintext = encryptor.decrypt(&record.encrypted_token)?;
        let token = Zeroizing::new(
            std::str::from_utf8(&plaintext)
                .map_err(|_| SupervisorError::MalformedToken)?
                .to_owned(),
        );
        drop(plaintext);

        Ok(self.factory.connect(&token)?)
    }

    /// Cancel the consumer for `id`. Returns `false` if none was running.
    ///
    /// Does not wait for the task: a handler may stop the bot it runs on.
    pub async fn stop(&self, id: Uuid) -> bool {
        let Some(handle) = self.consumers.write().await.remove(&id) else {
            return false;
        };
        handle.cancel.cancel();
        info!(bot_id = %id, "Bot consumer stop requested");
        true
    }

    /// Wait for every consumer task to finish. Call after cancelling the root context.
    pub async fn join_all(&self) {
        let handles: Vec<_> = self.consumers.write().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(bot_id = %id, error = %e, "Bot consumer task ended abnormally");
            }
        }
    }

    /// Ids of bots with a live consumer.
    pub async fn running(&self) -> Vec<Uuid> {
        self.consumers.read().await.keys().copied().collect()
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.consumers.read().await.contains_key(&id)
    }

    /// Drop the registry entry for a finished consumer unless it was relaunched.
    async fn forget(&self, id: Uuid, generation: u64) {
        let mut consumers = self.consumers.write().await;
        if consumers.get(&id).is_some_and(|h| h.generation == generation) {
            consumers.remove(&id);
        }
    }

    pub(crate) fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }
}
