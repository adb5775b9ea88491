//! Promobots service binary
//!
//! Loads configuration, brings every stored bot online and runs until
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use promobots_core::config::load_config;
use promobots_core::tracing_init::init_tracing;
use promobots_crypto::KeyStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use promobots_service::broadcast::{BroadcastRegistry, BroadcastSender, ConditionResolver};
use promobots_service::health::spawn_health_checker;
use promobots_service::platform::TelegramClientFactory;
use promobots_service::shutdown::ShutdownCoordinator;
use promobots_service::storage::Database;
use promobots_service::supervisor::{BotSupervisor, SupervisorDeps, SupervisorSettings};

#[derive(Parser, Debug)]
#[command(name = "promobots")]
#[command(version, about = "Promobots - multi-bot supervisor and broadcaster")]
struct Args {
    /// Directory containing config.yaml
    #[arg(long, default_value = ".", env = "PROMO_BOTS_CONFIG_PATH")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading configuration from {}", args.config_path.display()))?;
    init_tracing(&config.logger).context("initialising logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting promobots");

    let keys = KeyStore::from_env(config.crypto.pinned_version())
        .context("loading token encryption keys")?;
    info!(
        current_version = keys.current_version(),
        versions = ?keys.versions(),
        "Key store ready"
    );

    let db = Database::open(&config.database)
        .await
        .context("opening database")?;
    let registry = Arc::new(
        BroadcastRegistry::open(&config.broadcasts.path)
            .await
            .context("loading broadcast registry")?,
    );

    let ctx = CancellationToken::new();
    let health = spawn_health_checker(
        db.clone(),
        Duration::from_secs(config.database.health_check_period),
        ctx.clone(),
    );

    let shared = Arc::new(db.clone());
    let sender = Arc::new(BroadcastSender::new(
        Arc::clone(&registry),
        Arc::<Database>::clone(&shared),
        Arc::<Database>::clone(&shared),
        Arc::new(ConditionResolver),
        Duration::from_millis(config.broadcasts.send_interval_ms),
    ));
    let settings = SupervisorSettings {
        poll_timeout: Duration::from_secs(config.bots.poll_timeout_secs),
        admin_ids: config.bots.admin_ids.clone(),
        ..SupervisorSettings::default()
    };
    let supervisor = BotSupervisor::new(
        SupervisorDeps {
            bots: Arc::<Database>::clone(&shared),
            users: shared,
            keys,
            factory: Arc::new(TelegramClientFactory::new(settings.poll_timeout)),
            registry,
            sender,
        },
        settings,
        ctx.clone(),
    );

    supervisor.start().await.context("starting bot fleet")?;

    #[cfg(unix)]
    sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;

    let trigger = ShutdownCoordinator::new(ctx, db).run().await;
    if let Err(e) = health.await {
        warn!(error = %e, "Health checker task failed");
    }

    match trigger {
        Ok(trigger) => info!(?trigger, "Promobots stopped"),
        Err(e) => tracing::error!(error = %e, "Shutdown did not complete cleanly"),
    }
    Ok(())
}
