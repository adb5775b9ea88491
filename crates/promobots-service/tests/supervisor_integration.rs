#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests for the bot supervisor.
//!
//! Wires the supervisor to an in-memory database, a real key store and a
//! fake platform whose clients are scripted per token.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use promobots_crypto::{KeyMaterial, KeyStore};
use promobots_service::broadcast::{
    BroadcastDefinition, BroadcastRegistry, BroadcastSender, ConditionResolver, Targeting,
};
use promobots_service::platform::{
    BotProfile, ClientFactory, IncomingMessage, IncomingUpdate, OutboundMessage, PlatformClient,
    PlatformError,
};
use promobots_service::storage::{
    BotRecord, BotRepository, BotStatus, Database, DatabaseError, UserRecord, UserRepository,
    UserRole,
};
use promobots_service::supervisor::{BotSupervisor, SupervisorDeps, SupervisorSettings};

const ADMIN_CHAT: i64 = 9000;
const GROUP_CHAT: i64 = -4200;

// === Fake platform ===

type Inbox = Arc<Mutex<VecDeque<Vec<IncomingUpdate>>>>;

/// Behaviour of every client built for one token. Clones share the inbox and poll counter.
#[derive(Clone, Default)]
struct Script {
    /// `None` makes `get_me` fail with `Unauthorized`.
    profile: Option<BotProfile>,
    inbox: Inbox,
    /// Reject the token once the inbox runs dry.
    revoke_when_drained: bool,
    polls: Arc<AtomicUsize>,
}

impl Script {
    fn serving(profile: BotProfile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    fn push(&self, batch: Vec<IncomingUpdate>) {
        self.inbox.lock().unwrap().push_back(batch);
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

struct FakeClient {
    script: Script,
    outbox: Arc<Mutex<Vec<OutboundMessage>>>,
    blocked: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl PlatformClient for FakeClient {
    async fn get_me(&self) -> Result<BotProfile, PlatformError> {
        self.script.profile.clone().ok_or(PlatformError::Unauthorized)
    }

    async fn get_updates(
        &self,
        _offset: Option<i32>,
        _timeout: Duration,
    ) -> Result<Vec<IncomingUpdate>, PlatformError> {
        self.script.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.inbox.lock().unwrap().pop_front();
        match next {
            Some(batch) => Ok(batch),
            None if self.script.revoke_when_drained => Err(PlatformError::Unauthorized),
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), PlatformError> {
        if self.blocked.lock().unwrap().contains(&message.chat_id) {
            return Err(PlatformError::Blocked);
        }
        self.outbox.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeFactory {
    scripts: Mutex<HashMap<String, Script>>,
    connected: Mutex<Vec<String>>,
    outbox: Arc<Mutex<Vec<OutboundMessage>>>,
    /// Chats that have blocked every bot.
    blocked: Arc<Mutex<Vec<i64>>>,
}

impl FakeFactory {
    fn script(&self, token: &str, script: Script) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .insert(token.to_owned(), script.clone());
        script
    }

    fn replies_to(&self, chat_id: i64) -> Vec<String> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text.clone())
            .collect()
    }
}

impl ClientFactory for FakeFactory {
    fn connect(&self, token: &str) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        self.connected.lock().unwrap().push(token.to_owned());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(PlatformError::Unauthorized)?;
        Ok(Arc::new(FakeClient {
            script,
            outbox: Arc::clone(&self.outbox),
            blocked: Arc::clone(&self.blocked),
        }))
    }
}

// === Helpers ===

fn profile(bot_id: i64, username: &str) -> BotProfile {
    BotProfile {
        bot_id,
        username: username.into(),
        first_name: "Promo".into(),
        last_name: None,
    }
}

/// A private-chat message, where the chat id is the author's id.
fn command(chat_id: i64, offset: i32, text: &str) -> IncomingUpdate {
    group_command(chat_id, chat_id, offset, text)
}

fn group_command(chat_id: i64, sender_id: i64, offset: i32, text: &str) -> IncomingUpdate {
    IncomingUpdate {
        next_offset: offset,
        message: Some(IncomingMessage {
            chat_id,
            sender_id,
            username: Some(format!("user{sender_id}")),
            first_name: Some("Test".into()),
            last_name: None,
            text: Some(text.into()),
        }),
    }
}

fn keys(versions: &[u32]) -> KeyStore {
    KeyStore::new(
        None,
        versions
            .iter()
            .map(|&v| KeyMaterial::new(v, vec![u8::try_from(v).unwrap(); 32])),
    )
    .unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds.
async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

struct Harness {
    db: Database,
    keys: KeyStore,
    factory: Arc<FakeFactory>,
    registry: Arc<BroadcastRegistry>,
    ctx: CancellationToken,
    supervisor: BotSupervisor,
    dir: tempfile::TempDir,
}

async fn harness(keys: KeyStore) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    let shared = Arc::new(db.clone());
    let factory = Arc::new(FakeFactory::default());
    let registry = Arc::new(BroadcastRegistry::new(dir.path().join("broadcasts.json")));
    let sender = Arc::new(BroadcastSender::new(
        Arc::clone(&registry),
        Arc::clone(&shared) as _,
        Arc::clone(&shared) as _,
        Arc::new(ConditionResolver),
        Duration::ZERO,
    ));
    let ctx = CancellationToken::new();
    let supervisor = BotSupervisor::new(
        SupervisorDeps {
            bots: Arc::clone(&shared) as _,
            users: shared,
            keys: keys.clone(),
            factory: Arc::clone(&factory) as _,
            registry: Arc::clone(&registry),
            sender,
        },
        SupervisorSettings {
            poll_timeout: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
            admin_ids: vec![ADMIN_CHAT],
        },
        ctx.clone(),
    );
    Harness {
        db,
        keys,
        factory,
        registry,
        ctx,
        supervisor,
        dir,
    }
}

impl Harness {
    async fn store_bot(&self, username: &str, token: &str) -> BotRecord {
        let (version, ciphertext) = self.keys.seal(token.as_bytes()).unwrap();
        BotRepository::create(&self.db, BotRecord::new(username, ciphertext, version))
            .await
            .unwrap()
    }

    async fn add_admin(&self) {
        UserRepository::create(
            &self.db,
            UserRecord {
                role: UserRole::Admin,
                ..UserRecord::new(ADMIN_CHAT)
            },
        )
        .await
        .unwrap();
    }

    async fn wait_for_replies(&self, chat_id: i64, count: usize) -> Vec<String> {
        let factory = &self.factory;
        wait_for(move || async move { factory.replies_to(chat_id).len() >= count }).await;
        self.factory.replies_to(chat_id)
    }

    async fn shutdown(self) {
        self.ctx.cancel();
        self.supervisor.join_all().await;
        assert!(self.supervisor.running().await.is_empty());
    }
}

// === Fleet start ===

#[tokio::test]
async fn fleet_partial_start_skips_unknown_key_version() {
    let h = harness(keys(&[1])).await;
    h.factory
        .script("good-token", Script::serving(profile(1, "good_bot")));
    let good = h.store_bot("good_bot", "good-token").await;

    // Sealed under a key this process does not have.
    let (_, foreign) = keys(&[2]).seal(b"other-token").unwrap();
    let bad = BotRepository::create(&h.db, BotRecord::new("bad_bot", foreign, 2))
        .await
        .unwrap();

    let report = h.supervisor.start().await.unwrap();
    assert_eq!(report.started, vec![good.id]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, bad.id);
    assert_eq!(h.supervisor.running().await, vec![good.id]);
    assert_eq!(*h.factory.connected.lock().unwrap(), ["good-token"]);

    // Still serving until the context is cancelled.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.supervisor.is_running(good.id).await);

    h.shutdown().await;
}

#[tokio::test]
async fn undecryptable_and_revoked_bots_are_skipped() {
    let h = harness(keys(&[1])).await;

    let mut tampered = BotRecord::new("tampered_bot", vec![0; 48], 1);
    tampered.status = BotStatus::Active;
    BotRepository::create(&h.db, tampered).await.unwrap();

    let mut revoked = h.store_bot("revoked_bot", "revoked-token").await;
    revoked.revoked_at = Some(1);
    BotRepository::update(&h.db, &revoked).await.unwrap();

    let report = h.supervisor.start().await.unwrap();
    assert!(report.started.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert!(h.factory.connected.lock().unwrap().is_empty());
}

#[tokio::test]
async fn successful_auth_refreshes_bot_record() {
    let h = harness(keys(&[1])).await;
    let script = h
        .factory
        .script("token-a", Script::serving(profile(777, "renamed_bot")));
    let stored = h.store_bot("promo_bot", "token-a").await;

    h.supervisor.start().await.unwrap();
    // Activation is written before the first poll.
    let polled = &script;
    wait_for(move || async move { polled.polls() > 0 }).await;

    let refreshed = BotRepository::get_by_platform_id(&h.db, 777).await.unwrap();
    assert_eq!(refreshed.id, stored.id);
    assert_eq!(refreshed.username, "renamed_bot");
    assert_eq!(refreshed.status, BotStatus::Active);
    assert!(refreshed.last_checked_at.is_some());
    assert!(refreshed.last_error.is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn auth_failure_marks_bot_dead() {
    let h = harness(keys(&[1])).await;
    h.factory.script("stale-token", Script::default());
    let stored = h.store_bot("stale_bot", "stale-token").await;

    let report = h.supervisor.start().await.unwrap();
    assert_eq!(report.started, vec![stored.id]);

    let supervisor = &h.supervisor;
    wait_for(move || async move { !supervisor.is_running(stored.id).await }).await;

    let record = BotRepository::get_by_id(&h.db, stored.id).await.unwrap();
    assert_eq!(record.status, BotStatus::Error);
    let last_error = record.last_error.unwrap();
    assert!(!last_error.contains("stale-token"));
}

#[tokio::test]
async fn token_rejected_while_polling_closes_consumer() {
    let h = harness(keys(&[1])).await;
    h.factory.script(
        "token-a",
        Script {
            revoke_when_drained: true,
            ..Script::serving(profile(1, "promo_bot"))
        },
    );
    let stored = h.store_bot("promo_bot", "token-a").await;

    h.supervisor.start().await.unwrap();
    let supervisor = &h.supervisor;
    wait_for(move || async move { !supervisor.is_running(stored.id).await }).await;

    let record = BotRepository::get_by_id(&h.db, stored.id).await.unwrap();
    assert_eq!(record.status, BotStatus::Error);
}

#[tokio::test]
async fn stop_cancels_a_single_consumer() {
    let h = harness(keys(&[1])).await;
    h.factory.script("token-a", Script::serving(profile(1, "a_bot")));
    h.factory.script("token-b", Script::serving(profile(2, "b_bot")));
    let a = h.store_bot("a_bot", "token-a").await;
    let b = h.store_bot("b_bot", "token-b").await;
    h.supervisor.start().await.unwrap();

    assert!(h.supervisor.stop(a.id).await);
    assert!(!h.supervisor.stop(a.id).await);
    assert_eq!(h.supervisor.running().await, vec![b.id]);

    // A stopped bot can be relaunched, but only once.
    let record = BotRepository::get_by_id(&h.db, a.id).await.unwrap();
    h.supervisor.launch(record.clone()).await.unwrap();
    assert!(h.supervisor.launch(record).await.is_err());
    assert!(h.supervisor.is_running(a.id).await);

    h.shutdown().await;
}

// === Commands ===

#[tokio::test]
async fn start_registers_users_and_admins() {
    let h = harness(keys(&[1])).await;
    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![
        command(100, 1, "/start"),
        command(100, 2, "just chatting"),
        command(100, 3, "/nonexistent"),
        command(ADMIN_CHAT, 4, "/start@promo_bot"),
    ]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    h.wait_for_replies(ADMIN_CHAT, 1).await;

    let user = UserRepository::get_by_telegram_id(&h.db, 100).await.unwrap();
    assert_eq!(user.role, UserRole::User);
    assert_eq!(user.username.as_deref(), Some("user100"));
    let admin = UserRepository::get_by_telegram_id(&h.db, ADMIN_CHAT)
        .await
        .unwrap();
    assert_eq!(admin.role, UserRole::Admin);

    // Plain text and unknown commands get no reply.
    assert_eq!(h.factory.replies_to(100).len(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn admin_commands_require_admin_role() {
    let h = harness(keys(&[1])).await;
    UserRepository::create(&h.db, UserRecord::new(100)).await.unwrap();
    h.add_admin().await;

    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![command(100, 1, "/stats"), command(ADMIN_CHAT, 2, "/stats")]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    let stats = h.wait_for_replies(ADMIN_CHAT, 1).await;
    assert!(stats[0].contains("Active users: 2"), "{stats:?}");
    assert!(stats[0].contains("Running consumers: 1"), "{stats:?}");

    let refused = h.factory.replies_to(100);
    assert_eq!(refused.len(), 1);
    assert!(refused[0].contains("administrators only"));

    h.shutdown().await;
}

#[tokio::test]
async fn admin_sends_targeted_broadcast() {
    let h = harness(keys(&[1])).await;
    let template = h.dir.path().join("promo.txt");
    std::fs::write(&template, "Last chance!").unwrap();

    for telegram_id in [100, 101, 102] {
        UserRepository::create(&h.db, UserRecord::new(telegram_id))
            .await
            .unwrap();
    }
    h.add_admin().await;
    h.db.set_active_scenario(101, "welcome").await.unwrap();
    h.db.record_payment(102, "course", "succeeded").await.unwrap();
    h.db.set_active_scenario(ADMIN_CHAT, "admin-flow").await.unwrap();

    h.registry
        .add(BroadcastDefinition {
            id: "promo".into(),
            name: "Promo".into(),
            template_file: template,
            photos: Vec::new(),
            inline_keyboard: None,
            targeting: Some(Targeting::new(["no_active_scenario", "has_not_paid"])),
            created_at: 0,
        })
        .await
        .unwrap();

    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![command(ADMIN_CHAT, 1, "/broadcasts")]);
    script.push(vec![command(ADMIN_CHAT, 2, "/broadcast promo")]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    let replies = h.wait_for_replies(ADMIN_CHAT, 2).await;
    assert_eq!(replies[0], "promo: Promo");
    assert_eq!(replies[1], "Broadcast promo: targeted 1, sent 1, failed 0");
    assert_eq!(h.factory.replies_to(100), ["Last chance!"]);
    assert!(h.factory.replies_to(101).is_empty());
    assert!(h.factory.replies_to(102).is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn addbot_seals_token_and_revokebot_stops_it() {
    let h = harness(keys(&[1, 2])).await;
    h.add_admin().await;

    let admin_script = h
        .factory
        .script("admin-token", Script::serving(profile(1, "admin_bot")));
    let new_script = h
        .factory
        .script("555:NEW-TOKEN", Script::serving(profile(555, "new_bot")));
    h.store_bot("admin_bot", "admin-token").await;
    h.supervisor.start().await.unwrap();

    admin_script.push(vec![command(ADMIN_CHAT, 1, "/addbot 555:NEW-TOKEN")]);
    let replies = h.wait_for_replies(ADMIN_CHAT, 1).await;
    assert_eq!(replies[0], "Bot @new_bot added and started.");

    let added = BotRepository::get_by_platform_id(&h.db, 555).await.unwrap();
    assert_eq!(added.encryption_version, 2);
    assert_ne!(added.encrypted_token, b"555:NEW-TOKEN");
    assert_eq!(
        h.keys.open(2, &added.encrypted_token).unwrap().as_slice(),
        b"555:NEW-TOKEN"
    );
    assert!(h.supervisor.is_running(added.id).await);
    let polled = &new_script;
    wait_for(move || async move { polled.polls() > 0 }).await;

    admin_script.push(vec![command(ADMIN_CHAT, 2, "/revokebot @new_bot")]);
    let replies = h.wait_for_replies(ADMIN_CHAT, 2).await;
    assert_eq!(replies[1], "Bot @new_bot revoked.");

    let revoked = BotRepository::get_by_id(&h.db, added.id).await.unwrap();
    assert!(revoked.revoked_at.is_some());
    assert!(!h.supervisor.is_running(added.id).await);
    assert!(BotRepository::get_by_username(&h.db, "new_bot").await.is_err());

    h.shutdown().await;
}

#[tokio::test]
async fn group_commands_are_authorised_by_author() {
    let h = harness(keys(&[1])).await;
    UserRepository::create(&h.db, UserRecord::new(100)).await.unwrap();
    h.add_admin().await;

    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![
        group_command(GROUP_CHAT, 100, 1, "/stats"),
        group_command(GROUP_CHAT, ADMIN_CHAT, 2, "/stats"),
        group_command(GROUP_CHAT, 200, 3, "/start"),
    ]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    let replies = h.wait_for_replies(GROUP_CHAT, 3).await;
    assert!(replies[0].contains("administrators only"), "{replies:?}");
    assert!(replies[1].contains("Active users: 2"), "{replies:?}");
    assert!(h.factory.replies_to(ADMIN_CHAT).is_empty());

    // /start in a group registers the author, not the group.
    let member = UserRepository::get_by_telegram_id(&h.db, 200).await.unwrap();
    assert_eq!(member.username.as_deref(), Some("user200"));
    assert!(matches!(
        UserRepository::get_by_telegram_id(&h.db, GROUP_CHAT).await,
        Err(DatabaseError::NotFound(_))
    ));

    h.shutdown().await;
}

#[tokio::test]
async fn reply_to_blocked_user_deactivates_them() {
    let h = harness(keys(&[1])).await;
    UserRepository::create(&h.db, UserRecord::new(100)).await.unwrap();
    UserRepository::create(&h.db, UserRecord::new(101)).await.unwrap();
    h.factory.blocked.lock().unwrap().push(100);

    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![command(100, 1, "/help"), command(101, 2, "/help")]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    h.wait_for_replies(101, 1).await;
    assert!(matches!(
        UserRepository::get_by_telegram_id(&h.db, 100).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(UserRepository::get_by_telegram_id(&h.db, 101).await.is_ok());
    assert_eq!(UserRepository::count_active(&h.db).await.unwrap(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn admin_defines_broadcast_then_sends_it() {
    let h = harness(keys(&[1])).await;
    let template = h.dir.path().join("launch.txt");
    std::fs::write(&template, "We are live!").unwrap();
    UserRepository::create(&h.db, UserRecord::new(100)).await.unwrap();
    h.add_admin().await;
    h.db.set_active_scenario(ADMIN_CHAT, "admin-flow").await.unwrap();

    let definition = serde_json::json!({
        "id": "launch",
        "name": "Launch",
        "template_file": template,
        "targeting": {"conditions": ["no_active_scenario"]},
    });
    let add = format!("/broadcast_add {definition}");

    let script = h
        .factory
        .script("token-a", Script::serving(profile(1, "promo_bot")));
    script.push(vec![command(ADMIN_CHAT, 1, &add)]);
    script.push(vec![command(ADMIN_CHAT, 2, "/broadcast launch")]);
    script.push(vec![command(ADMIN_CHAT, 3, &add)]);
    script.push(vec![command(ADMIN_CHAT, 4, "/broadcast_add {not json")]);
    h.store_bot("promo_bot", "token-a").await;
    h.supervisor.start().await.unwrap();

    let replies = h.wait_for_replies(ADMIN_CHAT, 4).await;
    assert_eq!(replies[0], "Broadcast launch added.");
    assert_eq!(replies[1], "Broadcast launch: targeted 1, sent 1, failed 0");
    assert_eq!(replies[2], "Broadcast launch already exists.");
    assert!(replies[3].starts_with("Invalid broadcast definition"), "{replies:?}");
    assert_eq!(h.factory.replies_to(100), ["We are live!"]);

    let on_disk = BroadcastRegistry::open(h.registry.path()).await.unwrap();
    let stored = on_disk.get("launch").await.unwrap();
    assert_eq!(stored.name, "Launch");
    assert!(stored.created_at > 0);

    h.shutdown().await;
}

#[tokio::test]
async fn deletebot_stops_and_removes_the_record() {
    let h = harness(keys(&[1])).await;
    h.add_admin().await;

    let admin_script = h
        .factory
        .script("admin-token", Script::serving(profile(1, "admin_bot")));
    let doomed_script = h
        .factory
        .script("doomed-token", Script::serving(profile(2, "doomed_bot")));
    h.store_bot("admin_bot", "admin-token").await;
    let doomed = h.store_bot("doomed_bot", "doomed-token").await;
    h.supervisor.start().await.unwrap();
    let polled = &doomed_script;
    wait_for(move || async move { polled.polls() > 0 }).await;

    admin_script.push(vec![
        command(ADMIN_CHAT, 1, "/deletebot @doomed_bot"),
        command(ADMIN_CHAT, 2, "/deletebot doomed_bot"),
    ]);
    let replies = h.wait_for_replies(ADMIN_CHAT, 2).await;
    assert_eq!(replies[0], "Bot @doomed_bot deleted.");
    assert_eq!(replies[1], "Bot @doomed_bot not found.");

    assert!(matches!(
        BotRepository::get_by_id(&h.db, doomed.id).await,
        Err(DatabaseError::NotFound(_))
    ));
    let supervisor = &h.supervisor;
    wait_for(move || async move { !supervisor.is_running(doomed.id).await }).await;

    h.shutdown().await;
}
