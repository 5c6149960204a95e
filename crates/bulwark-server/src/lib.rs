use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bulwark_config::Config;
use bulwark_contracts::{
    EntityKind, ErrorBody, InboundCommand, InboundReport, MembershipUpdate, PolicyRecord,
    ProtectedRoom, ReportOutcome, WatchedList,
};

pub mod audit;
pub mod collaborators;
pub mod engine;
pub mod homeserver;
pub mod membership;
pub mod store;

pub use audit::{verify_audit_chain, AuditJsonl, AuditRecord};
pub use collaborators::{
    AdminSet, HashIndex, Homeserver, HomeserverError, Membership, Notifier, PolicyLists,
    PolicyStore, StaticAdmins, StaticLists,
};
pub use engine::{
    Collaborators, CommandError, CommandStatus, KickFailure, KickOutcome, KickReport, Moderator,
    ModeratorSettings, ReportError,
};
pub use homeserver::HomeserverClient;
pub use membership::MembershipCache;
pub use store::LocalStore;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg).await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/commands", post(commands))
        .route("/v1/reports", post(reports))
        .route("/v1/policies", post(policies))
        .route("/v1/memberships", post(memberships))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    moderator: Arc<Moderator>,
    store: Arc<LocalStore>,
    membership: Arc<MembershipCache>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self, String> {
        let client = Arc::new(HomeserverClient::new(&cfg)?);
        Self::with_homeserver(cfg, client.clone(), client).await
    }

    pub async fn with_homeserver(
        cfg: Config,
        homeserver: Arc<dyn Homeserver>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            LocalStore::sqlite(sqlite_path)?
        } else {
            LocalStore::memory()
        };
        let store = Arc::new(store);
        let membership = Arc::new(MembershipCache::new(cfg.protected_rooms.iter().map(|r| {
            ProtectedRoom {
                room_id: r.room_id.clone(),
                name: r.name.clone(),
            }
        })));
        let lists = StaticLists::new(
            cfg.watched_lists
                .iter()
                .map(|l| WatchedList {
                    room_id: l.room_id.clone(),
                    shortcode: l.shortcode.clone(),
                    name: l.name.clone(),
                })
                .collect(),
        );
        let audit = AuditJsonl::new(
            &cfg.audit.jsonl_path,
            cfg.store.sqlite_path.as_deref(),
            cfg.audit.immutable_mirror_path.as_deref(),
        )
        .await?;

        let deps = Collaborators {
            store: store.clone(),
            lists: Arc::new(lists),
            admins: Arc::new(StaticAdmins::new(cfg.admins.iter().cloned())),
            membership: membership.clone(),
            hashes: store.clone(),
            homeserver,
            notifier,
        };
        let moderator = Moderator::new(ModeratorSettings::from_config(&cfg), deps)
            .with_audit(Arc::new(audit));
        Ok(Self {
            moderator: Arc::new(moderator),
            store,
            membership,
        })
    }
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, errcode: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            errcode: errcode.to_string(),
            error: error.into(),
        }),
    )
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn commands(
    State(state): State<AppState>,
    Json(command): Json<InboundCommand>,
) -> Result<StatusCode, ApiError> {
    if command.event_id.is_empty() || command.sender.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "M_INVALID_PARAM",
            "event_id and sender are required",
        ));
    }
    let status = state.moderator.handle_command(command).await;
    tracing::debug!(?status, "command handled");
    Ok(StatusCode::NO_CONTENT)
}

async fn reports(
    State(state): State<AppState>,
    Json(report): Json<InboundReport>,
) -> Result<Json<ReportOutcome>, ApiError> {
    if report.reporter.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "M_INVALID_PARAM",
            "reporter is required",
        ));
    }
    state
        .moderator
        .handle_report(report)
        .await
        .map(Json)
        .map_err(|e| api_error(e.status_code(), e.errcode(), e.to_string()))
}

async fn policies(
    State(state): State<AppState>,
    Json(record): Json<PolicyRecord>,
) -> Result<StatusCode, ApiError> {
    if record.list_room.is_empty() || record.state_key.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "M_INVALID_PARAM",
            "list_room and state_key are required",
        ));
    }
    let plain_user = record.entity_kind == EntityKind::User
        && !record.content.entity.is_empty()
        && !record.content.entity.contains(['*', '?']);
    if plain_user {
        state.store.remember(&record.content.entity);
    }
    tracing::debug!(
        policy_list = %record.list_room,
        state_key = %record.state_key,
        tombstone = record.content.is_tombstone(),
        "ingested policy record"
    );
    state.store.record_published(record);
    Ok(StatusCode::NO_CONTENT)
}

async fn memberships(
    State(state): State<AppState>,
    Json(update): Json<MembershipUpdate>,
) -> Result<StatusCode, ApiError> {
    if !update.room_id.starts_with('!') {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "M_INVALID_PARAM",
            "room_id must be a room ID",
        ));
    }
    for user_id in &update.joined {
        state.store.remember(user_id);
    }
    state.membership.apply(&update);
    Ok(StatusCode::NO_CONTENT)
}
