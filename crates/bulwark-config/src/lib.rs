use std::collections::HashSet;

use bulwark_contracts::TrustState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub homeserver: Homeserver,
    #[serde(default)]
    pub commands: Commands,
    #[serde(default)]
    pub enforcement: Enforcement,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub watched_lists: Vec<WatchedListConfig>,
    #[serde(default)]
    pub protected_rooms: Vec<ProtectedRoomConfig>,
    pub store: Store,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Homeserver {
    pub url: String,
    pub user_id: String,
    pub access_token: String,
    pub management_room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default = "default_require_encryption")]
    pub require_encryption: bool,
    #[serde(default = "default_min_trust_state")]
    pub min_trust_state: TrustState,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            require_encryption: default_require_encryption(),
            min_trust_state: default_min_trust_state(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enforcement {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_kick_safety_threshold")]
    pub kick_safety_threshold: usize,
    #[serde(default = "default_kick_concurrency")]
    pub kick_concurrency: usize,
}

impl Default for Enforcement {
    fn default() -> Self {
        Self {
            dry_run: false,
            kick_safety_threshold: default_kick_safety_threshold(),
            kick_concurrency: default_kick_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedListConfig {
    pub room_id: String,
    pub shortcode: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedRoomConfig {
    pub room_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

fn default_require_encryption() -> bool {
    true
}

fn default_min_trust_state() -> TrustState {
    TrustState::CrossSignedTofu
}

fn default_kick_safety_threshold() -> usize {
    10
}

fn default_kick_concurrency() -> usize {
    4
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.enforcement.kick_concurrency == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "enforcement.kick_concurrency must be >= 1".to_string(),
        ));
    }
    if !cfg.homeserver.management_room.starts_with('!') {
        return Err(ConfigError::UnsupportedConfig(
            "homeserver.management_room must be a room ID".to_string(),
        ));
    }
    let mut shortcodes = HashSet::new();
    for list in &cfg.watched_lists {
        if !shortcodes.insert(list.shortcode.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "watched_lists shortcode {} is used more than once",
                list.shortcode
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("bulwark-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

homeserver:
  url: "https://matrix.example.org"
  user_id: "@bulwark:example.org"
  access_token: "secret"
  management_room: "!mgmt:example.org"

admins:
  - "@admin:example.org"

watched_lists:
  - room_id: "!spam:example.org"
    shortcode: "spam"
    name: "Spam list"

store:
  type: "memory"

audit:
  jsonl_path: "./bulwark-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should load");
        assert!(cfg.commands.require_encryption);
        assert_eq!(cfg.commands.min_trust_state, TrustState::CrossSignedTofu);
        assert_eq!(cfg.enforcement.kick_safety_threshold, 10);
        assert_eq!(cfg.enforcement.kick_concurrency, 4);
        assert!(!cfg.enforcement.dry_run);
        assert_eq!(cfg.watched_lists[0].shortcode, "spam");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaLoad(_)
                | ConfigError::SchemaValidation(_)
                | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_duplicate_list_shortcodes() {
        let yaml = base_yaml().replace(
            "    name: \"Spam list\"",
            "    name: \"Spam list\"\n  - room_id: \"!other:example.org\"\n    shortcode: \"spam\"\n    name: \"Other\"",
        );
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected duplicate shortcode rejection");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_zero_kick_concurrency() {
        let yaml = format!("{}\nenforcement:\n  kick_concurrency: 0\n", base_yaml());
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn parses_trust_state_names() {
        let yaml = format!(
            "{}\ncommands:\n  require_encryption: false\n  min_trust_state: \"cross_signed_verified\"\n",
            base_yaml()
        );
        let path = write_temp_config(&yaml);
        let cfg = load_and_validate(&path).expect("config should load");
        assert!(!cfg.commands.require_encryption);
        assert_eq!(cfg.commands.min_trust_state, TrustState::CrossSignedVerified);
    }
}
