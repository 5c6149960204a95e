use serde::{Deserialize, Serialize};
use std::fmt;

pub const USER_POLICY_EVENT_TYPE: &str = "m.policy.rule.user";
pub const ROOM_POLICY_EVENT_TYPE: &str = "m.policy.rule.room";
pub const SERVER_POLICY_EVENT_TYPE: &str = "m.policy.rule.server";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Room,
    Server,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Room => "room",
            EntityKind::Server => "server",
        }
    }

    pub fn event_type(self) -> &'static str {
        match self {
            EntityKind::User => USER_POLICY_EVENT_TYPE,
            EntityKind::Room => ROOM_POLICY_EVENT_TYPE,
            EntityKind::Server => SERVER_POLICY_EVENT_TYPE,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Recommendation {
    #[serde(rename = "m.ban")]
    Ban,
    #[serde(rename = "net.bulwark.unban")]
    Unban,
    #[serde(rename = "org.matrix.msc4204.takedown")]
    Takedown,
}

impl Recommendation {
    pub fn tag(self) -> &'static str {
        match self {
            Recommendation::Ban => "m.ban",
            Recommendation::Unban => "net.bulwark.unban",
            Recommendation::Takedown => "org.matrix.msc4204.takedown",
        }
    }

    /// Takedowns block the same way bans do.
    pub fn is_ban_like(self) -> bool {
        matches!(self, Recommendation::Ban | Recommendation::Takedown)
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Body of a policy state event. A body without a recommendation is a
/// tombstone and removes whatever was published under the same state key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(
        default,
        rename = "org.matrix.msc4205.hashes",
        skip_serializing_if = "Option::is_none"
    )]
    pub hashes: Option<PolicyHashes>,
}

impl PolicyContent {
    pub fn tombstone() -> Self {
        Self::default()
    }

    pub fn is_tombstone(&self) -> bool {
        self.recommendation.is_none()
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.as_ref().and_then(|h| h.sha256.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRecord {
    pub list_room: String,
    pub entity_kind: EntityKind,
    pub state_key: String,
    pub sender: String,
    #[serde(default)]
    pub timestamp_ms: i64,
    pub content: PolicyContent,
}

impl PolicyRecord {
    pub fn entity_or_hash(&self) -> &str {
        if self.content.entity.is_empty() {
            self.content.sha256().unwrap_or_default()
        } else {
            &self.content.entity
        }
    }

    pub fn recommendation(&self) -> Option<Recommendation> {
        self.content.recommendation
    }

    pub fn reason(&self) -> &str {
        &self.content.reason
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedList {
    pub room_id: String,
    pub shortcode: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectedRoom {
    pub room_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult(pub Vec<PolicyRecord>);

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PolicyRecord> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&PolicyRecord> {
        self.0.first()
    }

    /// The first unban wins over any ban; otherwise the first ban-like record.
    pub fn summary(&self) -> RecommendationSummary {
        let mut ban_or_unban: Option<&PolicyRecord> = None;
        for record in &self.0 {
            match record.recommendation() {
                Some(Recommendation::Unban) => {
                    if ban_or_unban.and_then(|r| r.recommendation())
                        != Some(Recommendation::Unban)
                    {
                        ban_or_unban = Some(record);
                    }
                }
                Some(rec) if rec.is_ban_like() => {
                    if ban_or_unban.is_none() {
                        ban_or_unban = Some(record);
                    }
                }
                _ => {}
            }
        }
        RecommendationSummary {
            ban_or_unban: ban_or_unban.cloned(),
        }
    }
}

impl FromIterator<PolicyRecord> for MatchResult {
    fn from_iter<T: IntoIterator<Item = PolicyRecord>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for MatchResult {
    type Item = PolicyRecord;
    type IntoIter = std::vec::IntoIter<PolicyRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecommendationSummary {
    pub ban_or_unban: Option<PolicyRecord>,
}

impl RecommendationSummary {
    pub fn recommendation(&self) -> Option<Recommendation> {
        self.ban_or_unban.as_ref().and_then(|r| r.recommendation())
    }

    pub fn is_unban(&self) -> bool {
        self.recommendation() == Some(Recommendation::Unban)
    }
}

impl fmt::Display for RecommendationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ban_or_unban {
            Some(record) => write!(
                f,
                "{{ban_or_unban: {} in {}}}",
                record.recommendation().map(|r| r.tag()).unwrap_or("none"),
                record.list_room
            ),
            None => f.write_str("{ban_or_unban: none}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Blacklisted,
    #[default]
    Unset,
    UnknownDevice,
    Forwarded,
    CrossSignedUntrusted,
    CrossSignedTofu,
    CrossSignedVerified,
    Verified,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Blacklisted => "blacklisted",
            TrustState::Unset => "unset",
            TrustState::UnknownDevice => "unknown_device",
            TrustState::Forwarded => "forwarded",
            TrustState::CrossSignedUntrusted => "cross_signed_untrusted",
            TrustState::CrossSignedTofu => "cross_signed_tofu",
            TrustState::CrossSignedVerified => "cross_signed_verified",
            TrustState::Verified => "verified",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundCommand {
    pub event_id: String,
    pub sender: String,
    pub body: String,
    #[serde(default)]
    pub was_encrypted: bool,
    #[serde(default)]
    pub trust_state: TrustState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundReport {
    pub reporter: String,
    #[serde(default)]
    pub target_user: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyAction {
    pub list_room: String,
    pub list_shortcode: String,
    pub entity_kind: EntityKind,
    pub entity: String,
    pub recommendation: Recommendation,
    pub reason: String,
    pub state_key: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Notice,
    Ignored,
    Policy(PolicyAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipUpdate {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub joined: Vec<String>,
    #[serde(default)]
    pub left: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errcode: String,
    pub error: String,
}
