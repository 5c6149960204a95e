use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSONL log of enforcement decisions, chained by SHA-256.
pub struct AuditJsonl {
    file: Mutex<tokio::fs::File>,
    immutable_mirror: Option<Mutex<tokio::fs::File>>,
    sqlite: Option<Mutex<Connection>>,
    last_hash: Mutex<Option<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub action: String,
    pub result: String,
    pub actor: String,
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(action: &str, result: &str, actor: &str, entity: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            action: action.to_string(),
            result: result.to_string(),
            actor: actor.to_string(),
            entity: entity.to_string(),
            list_room: None,
            state_key: None,
            event_id: None,
            detail: None,
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_policy(mut self, list_room: &str, state_key: &str, event_id: Option<&str>) -> Self {
        self.list_room = Some(list_room.to_string());
        self.state_key = Some(state_key.to_string());
        self.event_id = event_id.map(str::to_string);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl AuditJsonl {
    pub async fn new(
        path: &str,
        sqlite_path: Option<&str>,
        immutable_mirror_path: Option<&str>,
    ) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Mutex::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| e.to_string())?,
            )),
            _ => None,
        };

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        action TEXT NOT NULL,
                        result TEXT NOT NULL,
                        actor TEXT NOT NULL,
                        entity TEXT NOT NULL,
                        list_room TEXT,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Mutex::new(conn))
            }
            None => None,
        };

        Ok(Self {
            file: Mutex::new(file),
            immutable_mirror,
            sqlite,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub async fn append(&self, mut rec: AuditRecord) {
        // held across the write; the chain must stay linear
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash.clear();
        match record_hash(&rec) {
            Ok(hash) => rec.record_hash = hash,
            Err(err) => {
                tracing::warn!(error = %err, action = %rec.action, "failed to hash audit record");
                return;
            }
        }

        let Ok(line) = serde_json::to_string(&rec) else {
            return;
        };
        {
            let mut file = self.file.lock().await;
            if let Err(err) = write_line(&mut file, &line).await {
                tracing::warn!(error = %err, "failed to append audit record");
                return;
            }
        }
        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            let _ = write_line(&mut mirror_file, &line).await;
        }
        *last_hash = Some(rec.record_hash.clone());
        drop(last_hash);

        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite.lock().await;
            let _ = conn.execute(
                "
                INSERT OR REPLACE INTO audit_records
                (audit_id, action, result, actor, entity, list_room, ts, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    rec.audit_id,
                    rec.action,
                    rec.result,
                    rec.actor,
                    rec.entity,
                    rec.list_room,
                    rec.ts,
                    line
                ],
            );
        }
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

fn record_hash(rec: &AuditRecord) -> Result<String, String> {
    let canonical = serde_jcs::to_string(rec)
        .map_err(|err| format!("failed to canonicalize audit record via JCS: {err}"))?;
    Ok(hash_hex(canonical.as_bytes()))
}

fn hash_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let expected_hash =
            record_hash(&seeded).map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
