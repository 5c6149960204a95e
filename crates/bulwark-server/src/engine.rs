use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use axum::http::StatusCode;
use bulwark_config::Config;
use bulwark_contracts::{
    EntityKind, InboundCommand, InboundReport, MatchResult, PolicyAction, PolicyRecord,
    Recommendation, ReportOutcome, TrustState, WatchedList,
};
use bulwark_kernel::{
    classify_entity, decode_base64_hash, event_url, gate_command, is_report_command,
    matrix_to_url, parse_command, parse_report_command, report_ban_conflict, requires_force,
    resolve_ban, resolve_removal, resolve_report_ban, resolve_unban, synthesize_policy,
    synthesize_removal,
    Command, CommandGate, CommandParseError, Conflict, Glob, PolicyDraft, RemovalKind,
    ReportCommand, ReportParseError, SynthesizedPolicy,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::collaborators::{
    AdminSet, HashIndex, Homeserver, HomeserverError, Membership, Notifier, PolicyLists,
    PolicyStore,
};

#[derive(Debug, Clone)]
pub struct ModeratorSettings {
    pub bot_user_id: String,
    pub require_encryption: bool,
    pub min_trust_state: TrustState,
    pub dry_run: bool,
    pub kick_safety_threshold: usize,
    pub kick_concurrency: usize,
}

impl ModeratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bot_user_id: cfg.homeserver.user_id.clone(),
            require_encryption: cfg.commands.require_encryption,
            min_trust_state: cfg.commands.min_trust_state,
            dry_run: cfg.enforcement.dry_run,
            kick_safety_threshold: cfg.enforcement.kick_safety_threshold,
            kick_concurrency: cfg.enforcement.kick_concurrency,
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn PolicyStore>,
    pub lists: Arc<dyn PolicyLists>,
    pub admins: Arc<dyn AdminSet>,
    pub membership: Arc<dyn Membership>,
    pub hashes: Arc<dyn HashIndex>,
    pub homeserver: Arc<dyn Homeserver>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Usage(#[from] CommandParseError),
    #[error("List \"{0}\" not found")]
    ListNotFound(String),
    #[error("No rule banning `{entity}` found in [{list_name}]({list_url})")]
    NothingToRemove {
        entity: String,
        list_name: String,
        list_url: String,
    },
    #[error("Invalid entity `{0}`")]
    InvalidEntity(String),
    #[error("Invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error(transparent)]
    Conflict(#[from] Conflict),
    #[error("Failed to {action}: {source}")]
    External {
        action: &'static str,
        source: HomeserverError,
    },
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0}")]
    InvalidParam(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Conflict(#[from] Conflict),
    #[error("failed to fetch event: {0}")]
    EventFetch(HomeserverError),
    #[error("failed to send policy: {0}")]
    External(HomeserverError),
}

impl ReportError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReportError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            ReportError::NotFound(_) => StatusCode::NOT_FOUND,
            ReportError::Conflict(_) => StatusCode::CONFLICT,
            ReportError::EventFetch(_) | ReportError::External(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn errcode(&self) -> &'static str {
        match self {
            ReportError::InvalidParam(_) => "M_INVALID_PARAM",
            ReportError::NotFound(_) => "M_NOT_FOUND",
            ReportError::Conflict(Conflict::UnbanRecommended { .. }) => {
                "NET.BULWARK.UNBAN_RECOMMENDED"
            }
            ReportError::Conflict(Conflict::AlreadyBanned { .. }) => "NET.BULWARK.ALREADY_BANNED",
            ReportError::Conflict(_) => "NET.BULWARK.CONFLICT",
            ReportError::EventFetch(_) | ReportError::External(_) => "M_UNKNOWN",
        }
    }
}

impl From<ReportParseError> for ReportError {
    fn from(err: ReportParseError) -> Self {
        match err {
            ReportParseError::InvalidParam(message) => ReportError::InvalidParam(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Dropped,
    Ignored,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acknowledge {
    React,
    Quiet,
}

#[derive(Debug, Clone)]
pub struct KickFailure {
    pub room_id: String,
    pub error: HomeserverError,
}

#[derive(Debug, Clone)]
pub struct KickOutcome {
    pub user_id: String,
    pub rooms: Vec<String>,
    pub succeeded: usize,
    pub failures: Vec<KickFailure>,
}

#[derive(Debug, Clone)]
pub enum KickReport {
    NoMatch,
    NeedsForce { candidates: usize },
    Executed(Vec<KickOutcome>),
}

/// Serializes query-then-publish per `(list_room, entity)`.
#[derive(Default)]
struct PolicyLocks {
    inner: StdMutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl PolicyLocks {
    async fn acquire(&self, list_room: &str, entity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((list_room.to_string(), entity.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct Moderator {
    settings: ModeratorSettings,
    deps: Collaborators,
    audit: Option<Arc<AuditJsonl>>,
    locks: PolicyLocks,
}

impl Moderator {
    pub fn new(settings: ModeratorSettings, deps: Collaborators) -> Self {
        Self {
            settings,
            deps,
            audit: None,
            locks: PolicyLocks::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditJsonl>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn handle_command(&self, cmd: InboundCommand) -> CommandStatus {
        match gate_command(
            cmd.was_encrypted,
            cmd.trust_state,
            self.settings.require_encryption,
            self.settings.min_trust_state,
        ) {
            CommandGate::Admit => {}
            CommandGate::DropUnencrypted => {
                tracing::warn!(event_id = %cmd.event_id, "dropping unencrypted command event");
                return CommandStatus::Dropped;
            }
            CommandGate::DropUntrusted(trust_state) => {
                tracing::warn!(
                    event_id = %cmd.event_id,
                    trust_state = %trust_state,
                    "dropping encrypted command with insufficient trust state"
                );
                return CommandStatus::Dropped;
            }
        }

        let result = match parse_command(&cmd.body) {
            Ok(None) => return CommandStatus::Ignored,
            Ok(Some(command)) => {
                tracing::info!(command = command.verb(), sender = %cmd.sender, "handling command");
                self.execute(&command, &cmd.sender).await
            }
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(Acknowledge::React) => {
                self.deps.notifier.react_success(&cmd.event_id).await;
                CommandStatus::Completed
            }
            Ok(Acknowledge::Quiet) => CommandStatus::Completed,
            Err(err) => {
                tracing::debug!(error = %err, "command rejected");
                self.notice(&err.to_string()).await;
                CommandStatus::Failed
            }
        }
    }

    async fn execute(&self, command: &Command, actor: &str) -> Result<Acknowledge, CommandError> {
        match command {
            Command::Join { rooms } => self.join(rooms).await,
            Command::Leave { targets } => self.leave(targets).await,
            Command::Redact { user, reason } => self.redact(user, reason).await,
            Command::Kick {
                force,
                pattern,
                reason,
            } => {
                let glob = Glob::compile(pattern).map_err(|e| CommandError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                match self.execute_kick(&glob, reason, *force, actor).await {
                    KickReport::Executed(_) => Ok(Acknowledge::React),
                    KickReport::NoMatch | KickReport::NeedsForce { .. } => Ok(Acknowledge::Quiet),
                }
            }
            Command::Ban {
                takedown,
                hashed,
                list,
                target,
                reason,
            } => {
                let recommendation = if *takedown {
                    Recommendation::Takedown
                } else {
                    Recommendation::Ban
                };
                self.ban(list, target, recommendation, reason, *hashed, actor)
                    .await
            }
            Command::RemovePolicy { kind, list, target } => {
                self.remove_policy(*kind, list, target, actor).await
            }
            Command::AddUnban {
                list,
                target,
                reason,
            } => self.add_unban(list, target, reason, actor).await,
            Command::Match { target } => self.match_entity(target).await,
        }
    }

    async fn join(&self, rooms: &[String]) -> Result<Acknowledge, CommandError> {
        for room in rooms {
            match self.deps.homeserver.join_room(room).await {
                Ok(room_id) => {
                    tracing::info!(room = %room, room_id = %room_id, "joined room");
                    self.notice(&format!("Joined room \"{room}\"")).await;
                }
                Err(err) => {
                    self.notice(&format!("Failed to join room \"{room}\": {err}"))
                        .await
                }
            }
        }
        Ok(Acknowledge::React)
    }

    async fn leave(&self, targets: &[String]) -> Result<Acknowledge, CommandError> {
        for target in targets {
            let room_id = if target.starts_with('#') {
                match self.deps.homeserver.resolve_alias(target).await {
                    Ok(room_id) => room_id,
                    Err(err) => {
                        self.notice(&format!("Failed to resolve alias \"{target}\": {err}"))
                            .await;
                        continue;
                    }
                }
            } else {
                target.clone()
            };
            match self.deps.homeserver.leave_room(&room_id).await {
                Ok(()) => self.notice(&format!("Left room \"{target}\"")).await,
                Err(err) => {
                    self.notice(&format!("Failed to leave room \"{target}\": {err}"))
                        .await
                }
            }
        }
        Ok(Acknowledge::Quiet)
    }

    async fn redact(&self, user_id: &str, reason: &str) -> Result<Acknowledge, CommandError> {
        let rooms = self.deps.membership.rooms_user_is_in(user_id);
        if rooms.is_empty() {
            self.notice(&format!("`{user_id}` is not in any protected rooms"))
                .await;
        }
        for room_id in &rooms {
            if let Err(err) = self
                .deps
                .homeserver
                .redact_user_events(room_id, user_id, reason)
                .await
            {
                self.notice(&format!(
                    "Failed to redact messages from `{user_id}` in `{room_id}`: {err}"
                ))
                .await;
            }
        }
        Ok(Acknowledge::React)
    }

    /// Expands `pattern` over known members and kicks every match from each
    /// protected room they are in. Room failures are reported and skipped.
    pub async fn execute_kick(
        &self,
        pattern: &Glob,
        reason: &str,
        force: bool,
        actor: &str,
    ) -> KickReport {
        let users = self.deps.membership.find_matching_users(pattern, None);
        if users.is_empty() {
            self.notice(&format!(
                "No users matching `{}` found in any rooms",
                pattern.as_str()
            ))
            .await;
            return KickReport::NoMatch;
        }
        if requires_force(users.len(), self.settings.kick_safety_threshold, force) {
            self.notice(&format!(
                "{} users matching `{}` found, use `--force` to kick all of them.",
                users.len(),
                pattern.as_str()
            ))
            .await;
            return KickReport::NeedsForce {
                candidates: users.len(),
            };
        }

        let mut outcomes = Vec::with_capacity(users.len());
        for user_id in users {
            let rooms = self.deps.membership.rooms_user_is_in(&user_id);
            if rooms.is_empty() {
                continue;
            }
            let outcome = self.kick_from_rooms(user_id, rooms, reason).await;
            for failure in &outcome.failures {
                self.notice(&format!(
                    "Failed to kick `{}` from `{}`: {}",
                    outcome.user_id, failure.room_id, failure.error
                ))
                .await;
            }
            let links: Vec<String> = outcome
                .rooms
                .iter()
                .map(|room| format!("[{room}]({})", matrix_to_url(room)))
                .collect();
            self.notice(&format!(
                "Kicked `{}` from {} rooms: {}",
                outcome.user_id,
                outcome.succeeded,
                links.join(", ")
            ))
            .await;
            let result = match (outcome.succeeded, outcome.failures.len()) {
                (_, 0) => "ok",
                (0, _) => "failed",
                _ => "partial",
            };
            self.record_audit(
                AuditRecord::new("kick", result, actor, &outcome.user_id).with_detail(format!(
                    "{} of {} rooms{}",
                    outcome.succeeded,
                    outcome.rooms.len(),
                    if self.settings.dry_run { " (dry run)" } else { "" }
                )),
            )
            .await;
            outcomes.push(outcome);
        }
        KickReport::Executed(outcomes)
    }

    async fn kick_from_rooms(&self, user_id: String, rooms: Vec<String>, reason: &str) -> KickOutcome {
        let dry_run = self.settings.dry_run;
        let homeserver = &self.deps.homeserver;
        let user = user_id.as_str();
        let results: Vec<(String, Result<(), HomeserverError>)> = stream::iter(rooms.iter().cloned())
            .map(|room_id| async move {
                let result = if dry_run {
                    Ok(())
                } else {
                    homeserver.kick_user(&room_id, user, reason).await
                };
                (room_id, result)
            })
            .buffered(self.settings.kick_concurrency.max(1))
            .collect()
            .await;

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for (room_id, result) in results {
            match result {
                Ok(()) => succeeded += 1,
                Err(error) => failures.push(KickFailure { room_id, error }),
            }
        }
        tracing::info!(
            user_id = %user_id,
            succeeded,
            failed = failures.len(),
            dry_run,
            "kick fan-out finished"
        );
        KickOutcome {
            user_id,
            rooms,
            succeeded,
            failures,
        }
    }

    async fn ban(
        &self,
        list_code: &str,
        target: &str,
        recommendation: Recommendation,
        reason: &str,
        hashed: bool,
        actor: &str,
    ) -> Result<Acknowledge, CommandError> {
        let list = self.find_list(list_code)?;
        let kind = classify(target)?;
        let _guard = self.locks.acquire(&list.room_id, target).await;
        let watched = self.deps.lists.watched_rooms();
        let matches = self.deps.store.match_exact(Some(&watched), kind, target);
        let reuse = resolve_ban(&matches, &list.room_id, target)?;
        let policy = synthesize_policy(
            PolicyDraft {
                entity: target,
                recommendation,
                reason,
                hashed,
            },
            reuse.as_deref(),
        );
        let action = if recommendation == Recommendation::Takedown {
            "takedown"
        } else {
            "ban"
        };
        let event_id = self
            .send_policy(&list, kind, target, &policy, actor, action)
            .await
            .map_err(|source| CommandError::External {
                action: "send ban policy",
                source,
            })?;
        tracing::info!(
            policy_list = %list.room_id,
            state_key = %policy.state_key,
            policy_event_id = %event_id,
            recommendation = %recommendation,
            "sent ban policy from command"
        );
        Ok(Acknowledge::React)
    }

    async fn remove_policy(
        &self,
        kind: RemovalKind,
        list_code: &str,
        target: &str,
        actor: &str,
    ) -> Result<Acknowledge, CommandError> {
        let list = self.find_list(list_code)?;
        let entity_kind = classify(target)?;
        let _guard = self.locks.acquire(&list.room_id, target).await;
        let scope = [list.room_id.clone()];
        let matches = self.deps.store.match_exact(Some(&scope), entity_kind, target);
        let state_key = resolve_removal(&matches, target, kind).map_err(|conflict| match conflict {
            Conflict::NothingToRemove { entity } => CommandError::NothingToRemove {
                entity,
                list_name: list.name.clone(),
                list_url: matrix_to_url(&list.room_id),
            },
            other => CommandError::Conflict(other),
        })?;
        let policy = synthesize_removal(target, Some(&state_key));
        let event_id = self
            .send_policy(&list, entity_kind, target, &policy, actor, "remove_policy")
            .await
            .map_err(|source| CommandError::External {
                action: "remove policy",
                source,
            })?;
        tracing::info!(
            policy_list = %list.room_id,
            state_key = %state_key,
            policy_event_id = %event_id,
            "removed policy from command"
        );
        Ok(Acknowledge::React)
    }

    async fn add_unban(
        &self,
        list_code: &str,
        target: &str,
        reason: &str,
        actor: &str,
    ) -> Result<Acknowledge, CommandError> {
        let list = self.find_list(list_code)?;
        let kind = classify(target)?;
        let _guard = self.locks.acquire(&list.room_id, target).await;
        let watched = self.deps.lists.watched_rooms();
        let matches = self.deps.store.match_kind(Some(&watched), kind, target);
        let reuse = resolve_unban(&matches, &list.room_id, target)?;
        let policy = synthesize_policy(
            PolicyDraft {
                entity: target,
                recommendation: Recommendation::Unban,
                reason,
                hashed: false,
            },
            reuse.as_deref(),
        );
        let event_id = self
            .send_policy(&list, kind, target, &policy, actor, "unban")
            .await
            .map_err(|source| CommandError::External {
                action: "send unban policy",
                source,
            })?;
        tracing::info!(
            policy_list = %list.room_id,
            state_key = %policy.state_key,
            policy_event_id = %event_id,
            "sent unban policy from command"
        );
        Ok(Acknowledge::React)
    }

    async fn match_entity(&self, raw_target: &str) -> Result<Acknowledge, CommandError> {
        let mut target = raw_target.to_string();
        if let Some(digest) = decode_base64_hash(raw_target) {
            match self.resolve_pseudonym(&digest) {
                Some(user_id) => {
                    self.notice(&format!("Matched user `{user_id}` for hash `{raw_target}`"))
                        .await;
                    target = user_id;
                }
                None => {
                    self.notice(&format!("No user found for hash `{raw_target}`"))
                        .await;
                    return Ok(Acknowledge::Quiet);
                }
            }
        }
        let kind = classify(&target)?;

        let start = Instant::now();
        let matches = self.deps.store.match_kind(None, kind, &target);
        let elapsed = start.elapsed();
        tracing::debug!(entity = %target, matches = matches.len(), ?elapsed, "policy match");

        if kind == EntityKind::User {
            let rooms = self.deps.membership.rooms_user_is_in(&target);
            if !rooms.is_empty() {
                let names = self.deps.membership.room_names(&rooms);
                let lines: Vec<String> = rooms
                    .iter()
                    .zip(names)
                    .map(|(room_id, name)| format!("* [{name}]({})", matrix_to_url(room_id)))
                    .collect();
                self.notice(&format!(
                    "User is in {} protected rooms:\n\n{}",
                    rooms.len(),
                    lines.join("\n")
                ))
                .await;
            }
        }

        if matches.is_empty() {
            self.notice(&format!("No match in {elapsed:?}")).await;
        } else {
            self.notice(&format!(
                "Matched in {elapsed:?} with recommendations {}\n\n{}",
                matches.summary(),
                self.describe_matches(&matches)
            ))
            .await;
        }
        Ok(Acknowledge::Quiet)
    }

    fn describe_matches(&self, matches: &MatchResult) -> String {
        matches
            .iter()
            .map(|policy| {
                let list_name = self
                    .deps
                    .lists
                    .list_meta(&policy.list_room)
                    .map(|meta| meta.name)
                    .unwrap_or_else(|| policy.list_room.clone());
                let recommendation = policy
                    .recommendation()
                    .map(|r| r.tag())
                    .unwrap_or_default();
                format!(
                    "* [{list_name}] [{sender}]({sender_url}) set recommendation `{recommendation}` for `{entity}` at {ts} for {reason}",
                    sender = policy.sender,
                    sender_url = matrix_to_url(&policy.sender),
                    entity = policy.entity_or_hash(),
                    ts = format_timestamp(policy.timestamp_ms),
                    reason = policy.reason(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn resolve_pseudonym(&self, digest: &[u8; 32]) -> Option<String> {
        self.deps.hashes.reverse(digest)
    }

    pub async fn handle_report(&self, report: InboundReport) -> Result<ReportOutcome, ReportError> {
        let reporter = report.reporter.as_str();
        let reason = report.reason.as_str();
        let mut target_user = report.target_user.clone().filter(|u| !u.is_empty());
        let mut event_sender = None;

        if let (Some(room_id), Some(event_id)) = (&report.room_id, &report.event_id) {
            match self.deps.homeserver.event_sender(room_id, event_id).await {
                Ok(sender) => {
                    target_user = Some(sender.clone());
                    event_sender = Some(sender);
                }
                Err(err) => {
                    tracing::warn!(error = %err, room_id = %room_id, event_id = %event_id, "failed to fetch reported event");
                    self.notice(&format!(
                        "[{reporter}]({}) reported [an event]({}) for {reason}, but the event could not be fetched: {err}",
                        matrix_to_url(reporter),
                        event_url(room_id, event_id),
                    ))
                    .await;
                    return Err(ReportError::EventFetch(err));
                }
            }
        }

        let escalate = self.deps.admins.is_admin(reporter) && is_report_command(reason);
        let Some(target) = target_user.filter(|_| escalate) else {
            self.forward_report(&report, event_sender.as_deref()).await;
            return Ok(ReportOutcome::Notice);
        };

        match parse_report_command(reason)? {
            Some(ReportCommand::Ban { list, reason }) => {
                self.report_ban(reporter, &target, &list, &reason).await
            }
            Some(ReportCommand::Unknown(verb)) => {
                tracing::debug!(verb = %verb, reporter = %reporter, "ignoring unknown report command");
                Ok(ReportOutcome::Ignored)
            }
            None => Ok(ReportOutcome::Ignored),
        }
    }

    async fn forward_report(&self, report: &InboundReport, event_sender: Option<&str>) {
        let reporter = &report.reporter;
        let reporter_link = format!("[{reporter}]({})", matrix_to_url(reporter));
        let reason = &report.reason;
        let message = match (&report.room_id, &report.event_id, event_sender) {
            (Some(room_id), Some(event_id), Some(sender)) => format!(
                "{reporter_link} reported [an event]({}) from [{sender}]({}) for {reason}",
                event_url(room_id, event_id),
                matrix_to_url(sender),
            ),
            (Some(room_id), _, _) => format!(
                "{reporter_link} reported [a room]({}) for {reason}",
                matrix_to_url(room_id)
            ),
            _ => match &report.target_user {
                Some(user) => format!(
                    "{reporter_link} reported [{user}]({}) for {reason}",
                    matrix_to_url(user)
                ),
                None => format!("{reporter_link} sent a report for {reason}"),
            },
        };
        self.notice(&message).await;
    }

    async fn report_ban(
        &self,
        reporter: &str,
        target: &str,
        list_code: &str,
        reason: &str,
    ) -> Result<ReportOutcome, ReportError> {
        let reporter_link = format!("[{reporter}]({})", matrix_to_url(reporter));
        let target_link = format!("[{target}]({})", matrix_to_url(target));
        let watched = self.deps.lists.watched_rooms();
        report_ban_conflict(&self.deps.store.match_user(Some(&watched), target), target)?;
        let Some(list) = self.deps.lists.find_by_shortcode(list_code) else {
            self.notice(&format!(
                "Failed to handle {reporter_link}'s report of {target_link}: list \"{list_code}\" not found"
            ))
            .await;
            return Err(ReportError::NotFound(format!(
                "List with shortcode \"{list_code}\" not found"
            )));
        };
        let list_link = format!(
            "{} ([{}]({}))",
            list.name,
            list.room_id,
            matrix_to_url(&list.room_id)
        );

        let _guard = self.locks.acquire(&list.room_id, target).await;
        let matches = self.deps.store.match_user(Some(&watched), target);
        let reuse = resolve_report_ban(&matches, &list.room_id, target)?;
        let policy = synthesize_policy(
            PolicyDraft {
                entity: target,
                recommendation: Recommendation::Ban,
                reason,
                hashed: false,
            },
            reuse.as_deref(),
        );
        let event_id = match self
            .send_policy(&list, EntityKind::User, target, &policy, reporter, "report_ban")
            .await
        {
            Ok(event_id) => event_id,
            Err(err) => {
                self.notice(&format!(
                    "Failed to handle {reporter_link}'s report of {target_link} for {list_link}: {err}"
                ))
                .await;
                return Err(ReportError::External(err));
            }
        };
        tracing::info!(
            policy_list = %list.room_id,
            state_key = %policy.state_key,
            policy_event_id = %event_id,
            "sent ban policy from report"
        );
        self.notice(&format!(
            "Processed {reporter_link}'s report of {target_link} and sent a ban policy to {list_link} for {reason}"
        ))
        .await;

        Ok(ReportOutcome::Policy(PolicyAction {
            list_room: list.room_id,
            list_shortcode: list.shortcode,
            entity_kind: EntityKind::User,
            entity: target.to_string(),
            recommendation: Recommendation::Ban,
            reason: policy.content.reason,
            state_key: policy.state_key,
            event_id,
        }))
    }

    async fn send_policy(
        &self,
        list: &WatchedList,
        kind: EntityKind,
        raw_entity: &str,
        policy: &SynthesizedPolicy,
        actor: &str,
        action: &str,
    ) -> Result<String, HomeserverError> {
        let audit_entity = policy.entity_hash.as_deref().unwrap_or(raw_entity);
        let published = self
            .deps
            .homeserver
            .publish_policy(&list.room_id, kind, &policy.state_key, &policy.content)
            .await;
        match &published {
            Ok(event_id) => {
                self.deps.store.record_published(PolicyRecord {
                    list_room: list.room_id.clone(),
                    entity_kind: kind,
                    state_key: policy.state_key.clone(),
                    sender: self.settings.bot_user_id.clone(),
                    timestamp_ms: Utc::now().timestamp_millis(),
                    content: policy.content.clone(),
                });
                if policy.entity_hash.is_some() {
                    self.deps.hashes.remember(raw_entity);
                }
                self.record_audit(
                    AuditRecord::new(action, "ok", actor, audit_entity).with_policy(
                        &list.room_id,
                        &policy.state_key,
                        Some(event_id),
                    ),
                )
                .await;
            }
            Err(err) => {
                tracing::warn!(error = %err, policy_list = %list.room_id, "failed to publish policy");
                self.record_audit(
                    AuditRecord::new(action, "failed", actor, audit_entity)
                        .with_policy(&list.room_id, &policy.state_key, None)
                        .with_detail(err.to_string()),
                )
                .await;
            }
        }
        published
    }

    fn find_list(&self, shortcode: &str) -> Result<WatchedList, CommandError> {
        self.deps
            .lists
            .find_by_shortcode(shortcode)
            .ok_or_else(|| CommandError::ListNotFound(shortcode.to_string()))
    }

    async fn notice(&self, message: &str) {
        self.deps.notifier.notice(message).await;
    }

    async fn record_audit(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.append(record).await;
        }
    }
}

fn classify(target: &str) -> Result<EntityKind, CommandError> {
    classify_entity(target).ok_or_else(|| CommandError::InvalidEntity(target.to_string()))
}

fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}
