use std::fmt;
use std::sync::LazyLock;

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use bulwark_contracts::{
    EntityKind, MatchResult, PolicyContent, PolicyHashes, PolicyRecord, Recommendation,
    TrustState,
};
use regex::Regex;
use sha2::{Digest, Sha256};

pub const REPORT_COMMAND_SIGIL: char = '/';

static SERVER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.*?-]+\.[a-zA-Z0-9*?-]+$").expect("valid server pattern regex")
});

pub fn classify_entity(raw: &str) -> Option<EntityKind> {
    if raw.starts_with('@') {
        Some(EntityKind::User)
    } else if raw.starts_with('!') {
        Some(EntityKind::Room)
    } else if SERVER_PATTERN.is_match(raw) {
        Some(EntityKind::Server)
    } else {
        None
    }
}

pub fn sha256_base64(value: &str) -> String {
    BASE64_STANDARD.encode(Sha256::digest(value.as_bytes()))
}

/// State key for a record that has no prior key to reuse. Identical
/// `(entity, recommendation)` pairs always land on the same key.
pub fn policy_state_key(raw_entity: &str, recommendation: Option<Recommendation>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_entity.as_bytes());
    hasher.update(recommendation.map(|r| r.tag()).unwrap_or_default().as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

pub fn decode_base64_hash(value: &str) -> Option<[u8; 32]> {
    let bytes = BASE64_STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .ok()?;
    bytes.try_into().ok()
}

pub fn matrix_to_url(id: &str) -> String {
    format!("https://matrix.to/#/{id}")
}

pub fn event_url(room_id: &str, event_id: &str) -> String {
    format!("https://matrix.to/#/{room_id}/{event_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedPolicy {
    pub state_key: String,
    pub content: PolicyContent,
    pub entity_hash: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyDraft<'a> {
    pub entity: &'a str,
    pub recommendation: Recommendation,
    pub reason: &'a str,
    pub hashed: bool,
}

pub fn synthesize_policy(draft: PolicyDraft<'_>, reuse_state_key: Option<&str>) -> SynthesizedPolicy {
    let mut content = PolicyContent {
        entity: draft.entity.to_string(),
        reason: draft.reason.to_string(),
        recommendation: Some(draft.recommendation),
        hashes: None,
    };
    let mut entity_hash = None;
    if draft.hashed {
        let digest = sha256_base64(draft.entity);
        content.hashes = Some(PolicyHashes {
            sha256: Some(digest.clone()),
        });
        content.entity.clear();
        entity_hash = Some(digest);
    }
    if draft.recommendation == Recommendation::Takedown {
        content.reason.clear();
    }
    SynthesizedPolicy {
        state_key: state_key_or_derived(reuse_state_key, draft.entity, content.recommendation),
        content,
        entity_hash,
    }
}

pub fn synthesize_removal(raw_entity: &str, reuse_state_key: Option<&str>) -> SynthesizedPolicy {
    SynthesizedPolicy {
        state_key: state_key_or_derived(reuse_state_key, raw_entity, None),
        content: PolicyContent::tombstone(),
        entity_hash: None,
    }
}

fn state_key_or_derived(
    reuse: Option<&str>,
    raw_entity: &str,
    recommendation: Option<Recommendation>,
) -> String {
    match reuse {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => policy_state_key(raw_entity, recommendation),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    UnbanRecommended { entity: String, reason: String },
    AlreadyUnbanned { entity: String, reason: String },
    AlreadyBanned { entity: String, reason: String },
    NothingToRemove { entity: String },
    RecommendationMismatch { entity: String, expected: Recommendation },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::UnbanRecommended { entity, reason } => {
                write!(f, "`{entity}` has an unban recommendation: {reason}")
            }
            Conflict::AlreadyUnbanned { entity, reason } => {
                write!(f, "`{entity}` already has an unban recommendation: {reason}")
            }
            Conflict::AlreadyBanned { entity, reason } => {
                write!(f, "`{entity}` is already banned for: {reason}")
            }
            Conflict::NothingToRemove { entity } => {
                write!(f, "no rule for `{entity}` found")
            }
            Conflict::RecommendationMismatch {
                entity,
                expected: Recommendation::Unban,
            } => write!(f, "`{entity}` does not have an unban recommendation"),
            Conflict::RecommendationMismatch { entity, .. } => {
                write!(f, "`{entity}` does not have a ban recommendation")
            }
        }
    }
}

impl std::error::Error for Conflict {}

fn targets_entity(record: &PolicyRecord, entity: &str) -> bool {
    if record.content.entity == entity {
        return true;
    }
    record.content.entity.is_empty()
        && record
            .content
            .sha256()
            .is_some_and(|hash| hash == sha256_base64(entity))
}

fn existing_key_in_list(matches: &MatchResult, list_room: &str, entity: &str) -> Option<String> {
    matches
        .iter()
        .filter(|p| p.list_room == list_room && targets_entity(p, entity))
        .last()
        .map(|p| p.state_key.clone())
}

/// Ban or takedown from the command path. A standing unban anywhere blocks it;
/// otherwise the key of an existing record in the target list is reused.
pub fn resolve_ban(
    matches: &MatchResult,
    list_room: &str,
    entity: &str,
) -> Result<Option<String>, Conflict> {
    let summary = matches.summary();
    if let Some(rec) = summary.ban_or_unban.as_ref().filter(|_| summary.is_unban()) {
        return Err(Conflict::UnbanRecommended {
            entity: entity.to_string(),
            reason: rec.reason().to_string(),
        });
    }
    Ok(existing_key_in_list(matches, list_room, entity))
}

/// Reports never overwrite a standing decision. Needs no target list, so it
/// can run before the list shortcode is looked up.
pub fn report_ban_conflict(matches: &MatchResult, entity: &str) -> Result<(), Conflict> {
    let summary = matches.summary();
    match summary.ban_or_unban.as_ref() {
        Some(rec) if summary.is_unban() => Err(Conflict::UnbanRecommended {
            entity: entity.to_string(),
            reason: rec.reason().to_string(),
        }),
        Some(rec) => Err(Conflict::AlreadyBanned {
            entity: entity.to_string(),
            reason: rec.reason().to_string(),
        }),
        None => Ok(()),
    }
}

pub fn resolve_report_ban(
    matches: &MatchResult,
    list_room: &str,
    entity: &str,
) -> Result<Option<String>, Conflict> {
    report_ban_conflict(matches, entity)?;
    Ok(existing_key_in_list(matches, list_room, entity))
}

pub fn resolve_unban(
    matches: &MatchResult,
    list_room: &str,
    entity: &str,
) -> Result<Option<String>, Conflict> {
    let summary = matches.summary();
    if let Some(rec) = summary.ban_or_unban.as_ref().filter(|_| summary.is_unban()) {
        return Err(Conflict::AlreadyUnbanned {
            entity: entity.to_string(),
            reason: rec.reason().to_string(),
        });
    }
    Ok(existing_key_in_list(matches, list_room, entity))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    Ban,
    Unban,
    Any,
}

/// Picks the record a removal overwrites. `list_matches` must come from the
/// target list only. With several matches the summary record (or the first
/// one) is used; no most-specific ordering is attempted.
pub fn resolve_removal(
    list_matches: &MatchResult,
    entity: &str,
    kind: RemovalKind,
) -> Result<String, Conflict> {
    let summary = list_matches.summary();
    let record = summary
        .ban_or_unban
        .as_ref()
        .or_else(|| list_matches.first())
        .ok_or_else(|| Conflict::NothingToRemove {
            entity: entity.to_string(),
        })?;
    let expected = match kind {
        RemovalKind::Ban => Some(Recommendation::Ban),
        RemovalKind::Unban => Some(Recommendation::Unban),
        RemovalKind::Any => None,
    };
    if let Some(expected) = expected {
        if record.recommendation() != Some(expected) {
            return Err(Conflict::RecommendationMismatch {
                entity: entity.to_string(),
                expected,
            });
        }
    }
    Ok(record.state_key.clone())
}

/// Shell-style pattern over user IDs: `*` matches any run, `?` one character.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut literal))),
            }
        }
        expr.push('$');
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

pub fn requires_force(candidates: usize, threshold: usize, force: bool) -> bool {
    candidates > threshold && !force
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandGate {
    Admit,
    DropUnencrypted,
    DropUntrusted(TrustState),
}

pub fn gate_command(
    was_encrypted: bool,
    trust_state: TrustState,
    require_encryption: bool,
    min_trust_state: TrustState,
) -> CommandGate {
    if !was_encrypted {
        if require_encryption {
            CommandGate::DropUnencrypted
        } else {
            CommandGate::Admit
        }
    } else if trust_state < min_trust_state {
        CommandGate::DropUntrusted(trust_state)
    } else {
        CommandGate::Admit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join {
        rooms: Vec<String>,
    },
    Leave {
        targets: Vec<String>,
    },
    Redact {
        user: String,
        reason: String,
    },
    Kick {
        force: bool,
        pattern: String,
        reason: String,
    },
    Ban {
        takedown: bool,
        hashed: bool,
        list: String,
        target: String,
        reason: String,
    },
    RemovePolicy {
        kind: RemovalKind,
        list: String,
        target: String,
    },
    AddUnban {
        list: String,
        target: String,
        reason: String,
    },
    Match {
        target: String,
    },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Join { .. } => "!join",
            Command::Leave { .. } => "!leave",
            Command::Redact { .. } => "!redact",
            Command::Kick { .. } => "!kick",
            Command::Ban { takedown: false, .. } => "!ban",
            Command::Ban { takedown: true, .. } => "!takedown",
            Command::RemovePolicy {
                kind: RemovalKind::Ban,
                ..
            } => "!remove-ban",
            Command::RemovePolicy {
                kind: RemovalKind::Unban,
                ..
            } => "!remove-unban",
            Command::RemovePolicy {
                kind: RemovalKind::Any,
                ..
            } => "!remove-policy",
            Command::AddUnban { .. } => "!add-unban",
            Command::Match { .. } => "!match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    Usage(String),
}

impl fmt::Display for CommandParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandParseError::Usage(usage) => write!(f, "Usage: `{usage}`"),
        }
    }
}

impl std::error::Error for CommandParseError {}

fn usage(text: &str) -> CommandParseError {
    CommandParseError::Usage(text.to_string())
}

/// Splits a message body into a command. Unknown verbs yield `Ok(None)`.
pub fn parse_command(body: &str) -> Result<Option<Command>, CommandParseError> {
    let fields: Vec<&str> = body.split_whitespace().collect();
    let Some((verb, args)) = fields.split_first() else {
        return Ok(None);
    };
    let verb = verb.to_lowercase();
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let command = match verb.as_str() {
        "!join" => {
            if args.is_empty() {
                return Err(usage("!join <room ID>..."));
            }
            Command::Join {
                rooms: owned(args),
            }
        }
        "!leave" => {
            if args.is_empty() {
                return Err(usage("!leave <room ID>..."));
            }
            Command::Leave {
                targets: owned(args),
            }
        }
        "!redact" => {
            let Some((user, rest)) = args.split_first() else {
                return Err(usage("!redact <user ID> [reason]"));
            };
            Command::Redact {
                user: user.to_string(),
                reason: rest.join(" "),
            }
        }
        "!kick" => {
            let force = args.first() == Some(&"--force");
            let rest = if force { &args[1..] } else { args };
            let Some((pattern, reason)) = rest.split_first() else {
                return Err(usage("!kick [--force] <user ID or glob> [reason]"));
            };
            Command::Kick {
                force,
                pattern: pattern.to_string(),
                reason: reason.join(" "),
            }
        }
        "!ban" | "!takedown" => {
            let hashed = args.first() == Some(&"--hash");
            let rest = if hashed { &args[1..] } else { args };
            if rest.len() < 2 {
                return Err(CommandParseError::Usage(format!(
                    "{verb} [--hash] <list shortcode> <entity> [reason]"
                )));
            }
            Command::Ban {
                takedown: verb == "!takedown",
                hashed,
                list: rest[0].to_string(),
                target: rest[1].to_string(),
                reason: rest[2..].join(" "),
            }
        }
        "!remove-ban" | "!remove-unban" | "!remove-policy" => {
            if args.len() < 2 {
                return Err(CommandParseError::Usage(format!(
                    "{verb} <list shortcode> <entity>"
                )));
            }
            let kind = match verb.as_str() {
                "!remove-ban" => RemovalKind::Ban,
                "!remove-unban" => RemovalKind::Unban,
                _ => RemovalKind::Any,
            };
            Command::RemovePolicy {
                kind,
                list: args[0].to_string(),
                target: args[1].to_string(),
            }
        }
        "!add-unban" => {
            if args.len() < 2 {
                return Err(usage("!add-unban <list shortcode> <entity> <reason>"));
            }
            Command::AddUnban {
                list: args[0].to_string(),
                target: args[1].to_string(),
                reason: args[2..].join(" "),
            }
        }
        "!match" => {
            let Some(target) = args.first() else {
                return Err(usage("!match <entity or hash>"));
            };
            Command::Match {
                target: target.to_string(),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(command))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportCommand {
    Ban { list: String, reason: String },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportParseError {
    InvalidParam(String),
}

impl fmt::Display for ReportParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportParseError::InvalidParam(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ReportParseError {}

pub fn is_report_command(reason: &str) -> bool {
    reason.starts_with(REPORT_COMMAND_SIGIL)
}

/// Parses a report reason such as `/ban spam flooding the lobby`. Reasons
/// without the command sigil yield `Ok(None)`.
pub fn parse_report_command(reason: &str) -> Result<Option<ReportCommand>, ReportParseError> {
    if !is_report_command(reason) {
        return Ok(None);
    }
    let fields: Vec<&str> = reason.split_whitespace().collect();
    let Some((verb, args)) = fields.split_first() else {
        return Ok(None);
    };
    let verb = verb.trim_start_matches(REPORT_COMMAND_SIGIL).to_lowercase();
    match verb.as_str() {
        "ban" => {
            if args.len() < 2 {
                return Err(ReportParseError::InvalidParam(
                    "Not enough arguments for ban".to_string(),
                ));
            }
            Ok(Some(ReportCommand::Ban {
                list: args[0].to_string(),
                reason: args[1..].join(" "),
            }))
        }
        _ => Ok(Some(ReportCommand::Unknown(verb))),
    }
}
