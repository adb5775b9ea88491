//! Bot command parsing and dispatch.
//!
//! Commands are messages starting with `/`. Each name maps to a [`Command`]
//! in one of two static tables; admin commands additionally require the
//! sender's active user record to carry the admin role. The sender is the
//! message author, not the chat, so group chats do not borrow a member's
//! role. Unknown commands and plain text are dropped without a reply.

use promobots_core::db::unix_timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::{BotSupervisor, SupervisorError};
use crate::broadcast::{BroadcastDefinition, RegistryError};
use crate::platform::{IncomingMessage, OutboundMessage, PlatformClient, PlatformError};
use crate::storage::{BotRecord, BotStatus, DatabaseError, UserRecord, UserRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Public,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Broadcasts,
    Broadcast,
    BroadcastAdd,
    BroadcastDelete,
    Bots,
    AddBot,
    RevokeBot,
    DeleteBot,
    Stats,
}

/// Commands anyone may run, with their help text.
pub const PUBLIC_COMMANDS: &[(&str, Command, &str)] = &[
    ("start", Command::Start, "register with this bot"),
    ("help", Command::Help, "list available commands"),
];

pub const ADMIN_COMMANDS: &[(&str, Command, &str)] = &[
    ("broadcasts", Command::Broadcasts, "list broadcasts"),
    ("broadcast", Command::Broadcast, "<id> send a broadcast"),
    ("broadcast_add", Command::BroadcastAdd, "<json> define a broadcast"),
    ("broadcast_delete", Command::BroadcastDelete, "<id> delete a broadcast"),
    ("bots", Command::Bots, "list hosted bots"),
    ("addbot", Command::AddBot, "<token> host a new bot"),
    ("revokebot", Command::RevokeBot, "<username> stop and revoke a bot"),
    ("deletebot", Command::DeleteBot, "<username> stop a bot and delete it"),
    ("stats", Command::Stats, "user and bot counts"),
];

const ADMIN_ONLY: &str = "This command is available to administrators only.";

/// Split `/name@bot args` into `(name, args)`. Returns `None` for non-commands.
pub fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim().strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();
    let name = head.split_once('@').map_or(head, |(name, _)| name);
    if name.is_empty() {
        return None;
    }
    Some((name, args))
}

pub fn lookup(name: &str) -> Option<(Role, Command)> {
    let find = |table: &[(&str, Command, &str)]| {
        table
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, command, _)| *command)
    };
    find(PUBLIC_COMMANDS)
        .map(|c| (Role::Public, c))
        .or_else(|| find(ADMIN_COMMANDS).map(|c| (Role::Admin, c)))
}

fn help_text(is_admin: bool) -> String {
    let mut lines: Vec<String> = PUBLIC_COMMANDS
        .iter()
        .map(|(name, _, about)| format!("/{name} {about}"))
        .collect();
    if is_admin {
        lines.extend(
            ADMIN_COMMANDS
                .iter()
                .map(|(name, _, about)| format!("/{name} {about}")),
        );
    }
    lines.join("\n")
}

impl BotSupervisor {
    /// Route one incoming message. Message text is never logged.
    pub(crate) async fn handle_message(
        &self,
        client: &dyn PlatformClient,
        bot: &BotRecord,
        message: IncomingMessage,
        cancel: &CancellationToken,
    ) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let Some((name, args)) = parse_command(text) else {
            return;
        };
        let Some((role, command)) = lookup(name) else {
            debug!(bot_id = %bot.id, chat_id = message.chat_id, "Dropping unknown command");
            return;
        };

        let sender = match self.users.get_by_telegram_id(message.sender_id).await {
            Ok(user) => Some(user),
            Err(DatabaseError::NotFound(_)) => None,
            Err(e) => {
                error!(bot_id = %bot.id, sender_id = message.sender_id, error = %e, "Failed to look up sender");
                return;
            }
        };
        let is_admin = sender.as_ref().is_some_and(UserRecord::is_admin);

        let reply = if role == Role::Admin && !is_admin {
            warn!(bot_id = %bot.id, chat_id = message.chat_id, sender_id = message.sender_id, ?command, "Refused admin command from non-admin");
            ADMIN_ONLY.to_owned()
        } else {
            self.run_command(command, args, &message, sender, client, cancel)
                .await
        };

        match client.send(&OutboundMessage::text(message.chat_id, reply)).await {
            Ok(()) => {}
            Err(PlatformError::Blocked) => self.forget_unreachable(bot, message.chat_id).await,
            Err(e) => {
                warn!(bot_id = %bot.id, chat_id = message.chat_id, error = %e, "Failed to send reply");
            }
        }
    }

    /// Deactivate the user behind `chat_id` after the platform reported it unreachable.
    async fn forget_unreachable(&self, bot: &BotRecord, chat_id: i64) {
        match self.users.deactivate_by_telegram_id(chat_id).await {
            Ok(Some(user_id)) => {
                info!(bot_id = %bot.id, chat_id, %user_id, "User blocked the bot; deactivated");
            }
            Ok(None) => debug!(bot_id = %bot.id, chat_id, "Unreachable chat has no active user"),
            Err(e) => {
                warn!(bot_id = %bot.id, chat_id, error = %e, "Failed to deactivate unreachable user");
            }
        }
    }

    async fn run_command(
        &self,
        command: Command,
        args: &str,
        message: &IncomingMessage,
        sender: Option<UserRecord>,
        client: &dyn PlatformClient,
        cancel: &CancellationToken,
    ) -> String {
        match command {
            Command::Start => self.start_command(message, sender).await,
            Command::Help => help_text(sender.as_ref().is_some_and(UserRecord::is_admin)),
            Command::Broadcasts => self.list_broadcasts().await,
            Command::Broadcast => self.send_broadcast(args, client, cancel).await,
            Command::BroadcastAdd => self.add_broadcast(args).await,
            Command::BroadcastDelete => self.delete_broadcast(args).await,
            Command::Bots => self.list_bots().await,
            Command::AddBot => self.add_bot(Zeroizing::new(args.to_owned())).await,
            Command::RevokeBot => self.revoke_bot(args).await,
            Command::DeleteBot => self.delete_bot(args).await,
            Command::Stats => self.stats().await,
        }
    }

    async fn start_command(&self, message: &IncomingMessage, sender: Option<UserRecord>) -> String {
        let grant_admin = self.settings().admin_ids.contains(&message.sender_id);

        let result = match sender {
            Some(mut user) => {
                if grant_admin && !user.is_admin() {
                    user.role = UserRole::Admin;
                    self.users.update(&user).await
                } else {
                    Ok(user)
                }
            }
            None => {
                let user = UserRecord {
                    username: message.username.clone(),
                    first_name: message.first_name.clone(),
                    last_name: message.last_name.clone(),
                    role: if grant_admin {
                        UserRole::Admin
                    } else {
                        UserRole::User
                    },
                    ..UserRecord::new(message.sender_id)
                };
                self.users.create(user).await.inspect(|u| {
                    info!(user_id = %u.id, role = %u.role, "User registered");
                })
            }
        };

        match result {
            Ok(_) => "Welcome! Send /help to see what I can do.".to_owned(),
            Err(e) => {
                error!(sender_id = message.sender_id, error = %e, "Failed to register user");
                "Something went wrong, please try again later.".to_owned()
            }
        }
    }

    async fn list_broadcasts(&self) -> String {
        let broadcasts = self.registry.list().await;
        if broadcasts.is_empty() {
            return "No broadcasts defined.".to_owned();
        }
        broadcasts
            .iter()
            .map(|b| format!("{}: {}", b.id, b.name))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn send_broadcast(
        &self,
        id: &str,
        client: &dyn PlatformClient,
        cancel: &CancellationToken,
    ) -> String {
        if id.is_empty() {
            return "Usage: /broadcast <id>".to_owned();
        }
        match self.sender.send(id, client, cancel).await {
            Ok(report) if report.deactivated > 0 => format!(
                "Broadcast {id}: targeted {}, sent {}, failed {}, deactivated {}",
                report.targeted, report.sent, report.failed, report.deactivated
            ),
            Ok(report) => format!(
                "Broadcast {id}: targeted {}, sent {}, failed {}",
                report.targeted, report.sent, report.failed
            ),
            Err(e) => {
                warn!(broadcast_id = %id, error = %e, "Broadcast failed");
                format!("Broadcast {id} failed: {e}")
            }
        }
    }

    /// Define a broadcast from its JSON form, e.g.
    /// `{"id": "spring", "name": "Spring sale", "template_file": "templates/spring.txt"}`.
    async fn add_broadcast(&self, json: &str) -> String {
        if json.is_empty() {
            return "Usage: /broadcast_add <json>".to_owned();
        }
        let definition: BroadcastDefinition = match serde_json::from_str(json) {
            Ok(definition) => definition,
            Err(e) => return format!("Invalid broadcast definition: {e}"),
        };
        if definition.id.trim().is_empty() {
            return "Broadcast id must not be empty.".to_owned();
        }
        if let Some(targeting) = &definition.targeting {
            let unknown = targeting.unknown_conditions();
            if !unknown.is_empty() {
                return format!("Unknown targeting conditions: {}", unknown.join(", "));
            }
        }

        match self.registry.add(definition).await {
            Ok(added) => format!("Broadcast {} added.", added.id),
            Err(RegistryError::AlreadyExists(id)) => format!("Broadcast {id} already exists."),
            Err(e) => {
                error!(error = %e, "Failed to add broadcast");
                "Failed to add broadcast.".to_owned()
            }
        }
    }

    async fn delete_broadcast(&self, id: &str) -> String {
        if id.is_empty() {
            return "Usage: /broadcast_delete <id>".to_owned();
        }
        match self.registry.delete(id).await {
            Ok(true) => format!("Broadcast {id} deleted."),
            Ok(false) => format!("Broadcast {id} not found."),
            Err(e) => {
                error!(broadcast_id = %id, error = %e, "Failed to delete broadcast");
                format!("Failed to delete broadcast {id}.")
            }
        }
    }

    async fn list_bots(&self) -> String {
        let bots = match self.bots.list_all().await {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Failed to list bots");
                return "Failed to list bots.".to_owned();
            }
        };
        if bots.is_empty() {
            return "No bots registered.".to_owned();
        }
        let running = self.running().await;
        bots.iter()
            .map(|b| {
                let state = if b.revoked_at.is_some() {
                    "revoked"
                } else if running.contains(&b.id) {
                    "running"
                } else {
                    "stopped"
                };
                format!("@{} {} ({state})", b.username, b.status)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Seal `token` under the current key, store the bot and start it.
    async fn add_bot(&self, token: Zeroizing<String>) -> String {
        if token.is_empty() {
            return "Usage: /addbot <token>".to_owned();
        }
        match self.register_bot(&token).await {
            Ok(record) => format!("Bot @{} added and started.", record.username),
            Err(e) => {
                warn!(error = %e, "Failed to add bot");
                format!("Failed to add bot: {e}")
            }
        }
    }

    async fn register_bot(&self, token: &str) -> Result<BotRecord, SupervisorError> {
        let profile = self.factory.connect(token)?.get_me().await?;
        let (version, ciphertext) = self.keys.seal(token.as_bytes())?;

        let mut record = BotRecord::new(profile.username.clone(), ciphertext, version);
        record.bot_id = Some(profile.bot_id);
        record.first_name = Some(profile.first_name);
        record.last_name = profile.last_name;
        record.status = BotStatus::Active;
        record.last_checked_at = Some(unix_timestamp());

        let record = self.bots.create(record).await?;
        info!(bot_id = %record.id, username = %record.username, encryption_version = version, "Bot registered");
        self.launch(record.clone()).await?;
        Ok(record)
    }

    async fn revoke_bot(&self, username: &str) -> String {
        let username = username.trim_start_matches('@');
        if username.is_empty() {
            return "Usage: /revokebot <username>".to_owned();
        }
        let mut record = match self.bots.get_by_username(username).await {
            Ok(record) => record,
            Err(DatabaseError::NotFound(_)) => return format!("Bot @{username} not found."),
            Err(e) => {
                error!(username = %username, error = %e, "Failed to look up bot");
                return "Failed to revoke bot.".to_owned();
            }
        };

        self.stop(record.id).await;
        record.revoked_at = Some(unix_timestamp());
        record.status = BotStatus::Inactive;
        match self.bots.update(&record).await {
            Ok(_) => {
                info!(bot_id = %record.id, username = %username, "Bot revoked");
                format!("Bot @{username} revoked.")
            }
            Err(e) => {
                error!(bot_id = %record.id, error = %e, "Failed to revoke bot");
                "Failed to revoke bot.".to_owned()
            }
        }
    }

    /// Stop a bot and remove its record for good.
    async fn delete_bot(&self, username: &str) -> String {
        let username = username.trim_start_matches('@');
        if username.is_empty() {
            return "Usage: /deletebot <username>".to_owned();
        }
        let record = match self.bots.get_by_username(username).await {
            Ok(record) => record,
            Err(DatabaseError::NotFound(_)) => return format!("Bot @{username} not found."),
            Err(e) => {
                error!(username = %username, error = %e, "Failed to look up bot");
                return "Failed to delete bot.".to_owned();
            }
        };

        self.stop(record.id).await;
        match self.bots.delete(record.id).await {
            Ok(()) => {
                info!(bot_id = %record.id, username = %username, "Bot deleted");
                format!("Bot @{username} deleted.")
            }
            Err(e) => {
                error!(bot_id = %record.id, error = %e, "Failed to delete bot");
                "Failed to delete bot.".to_owned()
            }
        }
    }

    async fn stats(&self) -> String {
        let users = self.users.count_active().await;
        let bots = self.bots.list_all().await;
        match (users, bots) {
            (Ok(users), Ok(bots)) => {
                let live = bots.iter().filter(|b| b.is_live()).count();
                format!(
                    "Active users: {users}\nBots: {live} live, {} total\nRunning consumers: {}",
                    bots.len(),
                    self.running().await.len()
                )
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to collect stats");
                "Failed to collect stats.".to_owned()
            }
        }
    }
}
