#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bulwark_contracts::{
    EntityKind, InboundCommand, PolicyContent, PolicyRecord, ProtectedRoom, Recommendation,
    TrustState, WatchedList,
};
use bulwark_server::{
    Collaborators, Homeserver, HomeserverError, LocalStore, MembershipCache, Moderator,
    ModeratorSettings, Notifier, PolicyStore, StaticAdmins, StaticLists,
};

pub const ADMIN: &str = "@admin:example.org";
pub const BOT: &str = "@bot:example.org";
pub const SPAM_LIST: &str = "!spam:example.org";
pub const APPEALS_LIST: &str = "!appeals:example.org";

#[derive(Debug, Clone)]
pub struct Published {
    pub list_room: String,
    pub kind: EntityKind,
    pub state_key: String,
    pub content: PolicyContent,
}

#[derive(Default)]
pub struct FakeHomeserver {
    pub published: Mutex<Vec<Published>>,
    pub kicks: Mutex<Vec<(String, String)>>,
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
    pub redactions: Mutex<Vec<(String, String)>>,
    pub failing_kick_rooms: Mutex<HashSet<String>>,
    pub aliases: Mutex<HashMap<String, String>>,
    pub event_senders: Mutex<HashMap<(String, String), String>>,
    pub fail_publish: AtomicBool,
    counter: AtomicUsize,
}

impl FakeHomeserver {
    pub fn fail_kicks_in(&self, room_id: &str) {
        self.failing_kick_rooms
            .lock()
            .unwrap()
            .insert(room_id.to_string());
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn kicks(&self) -> Vec<(String, String)> {
        self.kicks.lock().unwrap().clone()
    }

    fn not_found(what: &str) -> HomeserverError {
        HomeserverError::Http {
            status: 404,
            errcode: "M_NOT_FOUND".to_string(),
            message: format!("{what} not found"),
        }
    }
}

#[async_trait]
impl Homeserver for FakeHomeserver {
    async fn publish_policy(
        &self,
        list_room: &str,
        kind: EntityKind,
        state_key: &str,
        content: &PolicyContent,
    ) -> Result<String, HomeserverError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(HomeserverError::Transport("connection refused".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            list_room: list_room.to_string(),
            kind,
            state_key: state_key.to_string(),
            content: content.clone(),
        });
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("$evt{n}"))
    }

    async fn kick_user(
        &self,
        room_id: &str,
        user_id: &str,
        _reason: &str,
    ) -> Result<(), HomeserverError> {
        self.kicks
            .lock()
            .unwrap()
            .push((room_id.to_string(), user_id.to_string()));
        if self.failing_kick_rooms.lock().unwrap().contains(room_id) {
            return Err(HomeserverError::Http {
                status: 403,
                errcode: "M_FORBIDDEN".to_string(),
                message: "not allowed".to_string(),
            });
        }
        Ok(())
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, HomeserverError> {
        self.joined.lock().unwrap().push(room_id_or_alias.to_string());
        Ok(room_id_or_alias.to_string())
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), HomeserverError> {
        self.left.lock().unwrap().push(room_id.to_string());
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<String, HomeserverError> {
        self.aliases
            .lock()
            .unwrap()
            .get(alias)
            .cloned()
            .ok_or_else(|| Self::not_found("alias"))
    }

    async fn redact_user_events(
        &self,
        room_id: &str,
        user_id: &str,
        _reason: &str,
    ) -> Result<(), HomeserverError> {
        self.redactions
            .lock()
            .unwrap()
            .push((room_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String, HomeserverError> {
        self.event_senders
            .lock()
            .unwrap()
            .get(&(room_id.to_string(), event_id.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found("event"))
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub notices: Mutex<Vec<String>>,
    pub reactions: Mutex<Vec<String>>,
}

impl FakeNotifier {
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<String> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn any_notice_contains(&self, needle: &str) -> bool {
        self.notices().iter().any(|n| n.contains(needle))
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notice(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }

    async fn react_success(&self, event_id: &str) {
        self.reactions.lock().unwrap().push(event_id.to_string());
    }
}

pub struct Harness {
    pub moderator: Moderator,
    pub store: Arc<LocalStore>,
    pub membership: Arc<MembershipCache>,
    pub homeserver: Arc<FakeHomeserver>,
    pub notifier: Arc<FakeNotifier>,
}

pub fn settings() -> ModeratorSettings {
    ModeratorSettings {
        bot_user_id: BOT.to_string(),
        require_encryption: true,
        min_trust_state: TrustState::CrossSignedTofu,
        dry_run: false,
        kick_safety_threshold: 10,
        kick_concurrency: 4,
    }
}

pub fn harness() -> Harness {
    harness_with(settings())
}

pub fn harness_with(settings: ModeratorSettings) -> Harness {
    let store = Arc::new(LocalStore::memory());
    let membership = Arc::new(MembershipCache::new([ProtectedRoom {
        room_id: "!lobby:example.org".to_string(),
        name: "Lobby".to_string(),
    }]));
    let homeserver = Arc::new(FakeHomeserver::default());
    let notifier = Arc::new(FakeNotifier::default());
    let lists = StaticLists::new(vec![
        WatchedList {
            room_id: SPAM_LIST.to_string(),
            shortcode: "spam".to_string(),
            name: "Spam list".to_string(),
        },
        WatchedList {
            room_id: APPEALS_LIST.to_string(),
            shortcode: "appeals".to_string(),
            name: "Appeals".to_string(),
        },
    ]);
    let deps = Collaborators {
        store: store.clone(),
        lists: Arc::new(lists),
        admins: Arc::new(StaticAdmins::new([ADMIN])),
        membership: membership.clone(),
        hashes: store.clone(),
        homeserver: homeserver.clone(),
        notifier: notifier.clone(),
    };
    Harness {
        moderator: Moderator::new(settings, deps),
        store,
        membership,
        homeserver,
        notifier,
    }
}

pub fn command(body: &str) -> InboundCommand {
    InboundCommand {
        event_id: "$cmd".to_string(),
        sender: ADMIN.to_string(),
        body: body.to_string(),
        was_encrypted: true,
        trust_state: TrustState::Verified,
    }
}

pub fn seed_policy(
    store: &LocalStore,
    list_room: &str,
    entity: &str,
    recommendation: Recommendation,
    state_key: &str,
) {
    store.record_published(PolicyRecord {
        list_room: list_room.to_string(),
        entity_kind: EntityKind::User,
        state_key: state_key.to_string(),
        sender: "@mod:example.org".to_string(),
        timestamp_ms: 1_700_000_000_000,
        content: PolicyContent {
            entity: entity.to_string(),
            reason: "seeded".to_string(),
            recommendation: Some(recommendation),
            hashes: None,
        },
    });
}
