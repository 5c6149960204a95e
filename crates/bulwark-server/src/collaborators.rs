use std::collections::HashSet;

use async_trait::async_trait;
use bulwark_contracts::{EntityKind, MatchResult, PolicyContent, PolicyRecord, WatchedList};
use bulwark_kernel::Glob;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum HomeserverError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{errcode} (HTTP {status}): {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Policy records from every list the bot can see. `lists = None` searches
/// all of them.
pub trait PolicyStore: Send + Sync {
    fn match_exact(&self, lists: Option<&[String]>, kind: EntityKind, value: &str) -> MatchResult;
    fn match_user(&self, lists: Option<&[String]>, user_id: &str) -> MatchResult;
    fn match_room(&self, lists: Option<&[String]>, room_id: &str) -> MatchResult;
    fn match_server(&self, lists: Option<&[String]>, server_name: &str) -> MatchResult;
    fn record_published(&self, record: PolicyRecord);

    fn match_kind(&self, lists: Option<&[String]>, kind: EntityKind, value: &str) -> MatchResult {
        match kind {
            EntityKind::User => self.match_user(lists, value),
            EntityKind::Room => self.match_room(lists, value),
            EntityKind::Server => self.match_server(lists, value),
        }
    }
}

pub trait PolicyLists: Send + Sync {
    fn find_by_shortcode(&self, shortcode: &str) -> Option<WatchedList>;
    fn watched_rooms(&self) -> Vec<String>;
    fn list_meta(&self, room_id: &str) -> Option<WatchedList>;
}

pub trait AdminSet: Send + Sync {
    fn is_admin(&self, user_id: &str) -> bool;
}

pub trait Membership: Send + Sync {
    fn find_matching_users(&self, pattern: &Glob, rooms: Option<&[String]>) -> Vec<String>;
    fn rooms_user_is_in(&self, user_id: &str) -> Vec<String>;
    fn room_names(&self, room_ids: &[String]) -> Vec<String>;
}

pub trait HashIndex: Send + Sync {
    fn reverse(&self, digest: &[u8; 32]) -> Option<String>;
    fn remember(&self, user_id: &str);
}

#[async_trait]
pub trait Homeserver: Send + Sync {
    async fn publish_policy(
        &self,
        list_room: &str,
        kind: EntityKind,
        state_key: &str,
        content: &PolicyContent,
    ) -> Result<String, HomeserverError>;
    async fn kick_user(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), HomeserverError>;
    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, HomeserverError>;
    async fn leave_room(&self, room_id: &str) -> Result<(), HomeserverError>;
    async fn resolve_alias(&self, alias: &str) -> Result<String, HomeserverError>;
    async fn redact_user_events(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), HomeserverError>;
    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String, HomeserverError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notice(&self, message: &str);
    async fn react_success(&self, event_id: &str);
}

#[derive(Debug, Clone, Default)]
pub struct StaticLists {
    lists: Vec<WatchedList>,
}

impl StaticLists {
    pub fn new(lists: Vec<WatchedList>) -> Self {
        Self { lists }
    }
}

impl PolicyLists for StaticLists {
    fn find_by_shortcode(&self, shortcode: &str) -> Option<WatchedList> {
        self.lists.iter().find(|l| l.shortcode == shortcode).cloned()
    }

    fn watched_rooms(&self) -> Vec<String> {
        self.lists.iter().map(|l| l.room_id.clone()).collect()
    }

    fn list_meta(&self, room_id: &str) -> Option<WatchedList> {
        self.lists.iter().find(|l| l.room_id == room_id).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticAdmins {
    admins: HashSet<String>,
}

impl StaticAdmins {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl AdminSet for StaticAdmins {
    fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }
}
