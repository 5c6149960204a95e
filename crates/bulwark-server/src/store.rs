use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bulwark_contracts::{EntityKind, MatchResult, PolicyContent, PolicyRecord};
use bulwark_kernel::{sha256_base64, Glob};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::collaborators::{HashIndex, PolicyStore};

pub struct LocalStore {
    backend: Mutex<StoreBackend>,
    globs: Mutex<HashMap<String, Glob>>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
struct MemoryStore {
    policies: Vec<PolicyRecord>,
    hashes: HashMap<[u8; 32], String>,
}

struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Exact,
    Pattern,
}

impl LocalStore {
    pub fn memory() -> Self {
        Self {
            backend: Mutex::new(StoreBackend::Memory(MemoryStore::default())),
            globs: Mutex::default(),
        }
    }

    pub fn sqlite(path: &str) -> Result<Self, String> {
        Ok(Self {
            backend: Mutex::new(StoreBackend::Sqlite(SqliteStore::new(path)?)),
            globs: Mutex::default(),
        })
    }

    fn backend(&self) -> MutexGuard<'_, StoreBackend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(
        &self,
        lists: Option<&[String]>,
        kind: EntityKind,
        value: &str,
        mode: MatchMode,
    ) -> MatchResult {
        let value_hash = sha256_base64(value);
        let accept = |p: &PolicyRecord| {
            p.entity_kind == kind
                && lists.map_or(true, |l| l.contains(&p.list_room))
                && self.record_matches(&p.content, value, &value_hash, mode)
        };
        match &*self.backend() {
            StoreBackend::Memory(store) => {
                store.policies.iter().filter(|p| accept(*p)).cloned().collect()
            }
            StoreBackend::Sqlite(store) => store
                .policies_of_kind(kind)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "failed to read policies from sqlite");
                    Vec::new()
                })
                .into_iter()
                .filter(|p| accept(p))
                .collect(),
        }
    }

    fn record_matches(
        &self,
        content: &PolicyContent,
        value: &str,
        value_hash: &str,
        mode: MatchMode,
    ) -> bool {
        if content.is_tombstone() {
            return false;
        }
        if content.entity.is_empty() {
            return content.sha256() == Some(value_hash);
        }
        if content.entity == value {
            return true;
        }
        mode == MatchMode::Pattern
            && is_glob(&content.entity)
            && self.glob_matches(&content.entity, value)
    }

    fn glob_matches(&self, pattern: &str, value: &str) -> bool {
        let mut globs = self.globs.lock().unwrap_or_else(PoisonError::into_inner);
        if !globs.contains_key(pattern) {
            match Glob::compile(pattern) {
                Ok(glob) => {
                    globs.insert(pattern.to_string(), glob);
                }
                Err(err) => {
                    tracing::debug!(error = %err, pattern = %pattern, "skipping uncompilable policy glob");
                    return false;
                }
            }
        }
        globs.get(pattern).is_some_and(|glob| glob.is_match(value))
    }

    fn cache_glob(&self, pattern: &str) {
        let mut globs = self.globs.lock().unwrap_or_else(PoisonError::into_inner);
        if globs.contains_key(pattern) {
            return;
        }
        if let Ok(glob) = Glob::compile(pattern) {
            globs.insert(pattern.to_string(), glob);
        }
    }
}

fn is_glob(entity: &str) -> bool {
    entity.contains(['*', '?'])
}

impl PolicyStore for LocalStore {
    fn match_exact(&self, lists: Option<&[String]>, kind: EntityKind, value: &str) -> MatchResult {
        self.find(lists, kind, value, MatchMode::Exact)
    }

    fn match_user(&self, lists: Option<&[String]>, user_id: &str) -> MatchResult {
        self.find(lists, EntityKind::User, user_id, MatchMode::Pattern)
    }

    fn match_room(&self, lists: Option<&[String]>, room_id: &str) -> MatchResult {
        self.find(lists, EntityKind::Room, room_id, MatchMode::Pattern)
    }

    fn match_server(&self, lists: Option<&[String]>, server_name: &str) -> MatchResult {
        self.find(lists, EntityKind::Server, server_name, MatchMode::Pattern)
    }

    fn record_published(&self, record: PolicyRecord) {
        if is_glob(&record.content.entity) {
            self.cache_glob(&record.content.entity);
        }
        match &mut *self.backend() {
            StoreBackend::Memory(store) => {
                let existing = store.policies.iter().position(|p| {
                    p.list_room == record.list_room
                        && p.entity_kind == record.entity_kind
                        && p.state_key == record.state_key
                });
                match (existing, record.content.is_tombstone()) {
                    (Some(idx), true) => {
                        store.policies.remove(idx);
                    }
                    (Some(idx), false) => store.policies[idx] = record,
                    (None, true) => {}
                    (None, false) => store.policies.push(record),
                }
            }
            StoreBackend::Sqlite(store) => {
                if let Err(err) = store.save_policy(&record) {
                    tracing::warn!(error = %err, state_key = %record.state_key, "failed to save policy to sqlite");
                }
            }
        }
    }
}

impl HashIndex for LocalStore {
    fn reverse(&self, digest: &[u8; 32]) -> Option<String> {
        match &*self.backend() {
            StoreBackend::Memory(store) => store.hashes.get(digest).cloned(),
            StoreBackend::Sqlite(store) => store.get_hash(digest).ok().flatten(),
        }
    }

    fn remember(&self, user_id: &str) {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(user_id.as_bytes()));
        match &mut *self.backend() {
            StoreBackend::Memory(store) => {
                store.hashes.insert(digest, user_id.to_string());
            }
            StoreBackend::Sqlite(store) => {
                if let Err(err) = store.save_hash(&digest, user_id) {
                    tracing::warn!(error = %err, "failed to save entity hash to sqlite");
                }
            }
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS policies (
                list_room TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                state_key TEXT NOT NULL,
                sender TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                content_json TEXT NOT NULL,
                PRIMARY KEY (list_room, entity_kind, state_key)
            );
            CREATE TABLE IF NOT EXISTS entity_hashes (
                hash TEXT PRIMARY KEY,
                entity TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn policies_of_kind(&self, kind: EntityKind) -> Result<Vec<PolicyRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT list_room, state_key, sender, timestamp_ms, content_json
                 FROM policies WHERE entity_kind = ?1 ORDER BY rowid",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        for row in rows {
            let (list_room, state_key, sender, timestamp_ms, content_json) =
                row.map_err(|e| e.to_string())?;
            let content: PolicyContent =
                serde_json::from_str(&content_json).map_err(|e| e.to_string())?;
            out.push(PolicyRecord {
                list_room,
                entity_kind: kind,
                state_key,
                sender,
                timestamp_ms,
                content,
            });
        }
        Ok(out)
    }

    fn save_policy(&mut self, record: &PolicyRecord) -> Result<(), String> {
        if record.content.is_tombstone() {
            self.conn
                .execute(
                    "DELETE FROM policies WHERE list_room = ?1 AND entity_kind = ?2 AND state_key = ?3",
                    params![record.list_room, record.entity_kind.as_str(), record.state_key],
                )
                .map_err(|e| e.to_string())?;
            return Ok(());
        }
        let content_json = serde_json::to_string(&record.content).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO policies(list_room, entity_kind, state_key, sender, timestamp_ms, content_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(list_room, entity_kind, state_key) DO UPDATE SET
                    sender=excluded.sender,
                    timestamp_ms=excluded.timestamp_ms,
                    content_json=excluded.content_json
                ",
                params![
                    record.list_room,
                    record.entity_kind.as_str(),
                    record.state_key,
                    record.sender,
                    record.timestamp_ms,
                    content_json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_hash(&self, digest: &[u8; 32]) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT entity FROM entity_hashes WHERE hash = ?1",
                params![hash_key(digest)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn save_hash(&mut self, digest: &[u8; 32], entity: &str) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO entity_hashes(hash, entity) VALUES (?1, ?2)",
                params![hash_key(digest), entity],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn hash_key(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
