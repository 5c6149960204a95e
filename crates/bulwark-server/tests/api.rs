mod common;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use bulwark_config::{
    Audit, Commands, Config, Enforcement, Homeserver, ProtectedRoomConfig, Server, Store,
    WatchedListConfig,
};
use bulwark_server::{router, verify_audit_chain, AppState};
use common::{FakeHomeserver, FakeNotifier, ADMIN, SPAM_LIST};
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn unique(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("bulwark-{tag}-{nanos}"))
        .to_string_lossy()
        .to_string()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        homeserver: Homeserver {
            url: "http://127.0.0.1:1".to_string(),
            user_id: "@bot:example.org".to_string(),
            access_token: "secret".to_string(),
            management_room: "!mgmt:example.org".to_string(),
        },
        commands: Commands::default(),
        enforcement: Enforcement::default(),
        admins: vec![ADMIN.to_string()],
        watched_lists: vec![WatchedListConfig {
            room_id: SPAM_LIST.to_string(),
            shortcode: "spam".to_string(),
            name: "Spam list".to_string(),
        }],
        protected_rooms: vec![ProtectedRoomConfig {
            room_id: "!lobby:example.org".to_string(),
            name: "Lobby".to_string(),
        }],
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        audit: Audit {
            jsonl_path: format!("{}.jsonl", unique("audit")),
            immutable_mirror_path: None,
        },
    }
}

struct TestApp {
    app: Router,
    homeserver: Arc<FakeHomeserver>,
    notifier: Arc<FakeNotifier>,
}

async fn test_app(cfg: Config) -> TestApp {
    let homeserver = Arc::new(FakeHomeserver::default());
    let notifier = Arc::new(FakeNotifier::default());
    let state = AppState::with_homeserver(cfg, homeserver.clone(), notifier.clone())
        .await
        .unwrap();
    TestApp {
        app: router(state),
        homeserver,
        notifier,
    }
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn command(body: &str) -> Value {
    json!({
        "event_id": "$cmd",
        "sender": ADMIN,
        "body": body,
        "was_encrypted": true,
        "trust_state": "cross_signed_verified"
    })
}

#[tokio::test]
async fn healthz_ok() {
    let t = test_app(test_config()).await;
    let response = t
        .app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn command_runs_before_response_and_is_audited() {
    let cfg = test_config();
    let audit_path = cfg.audit.jsonl_path.clone();
    let t = test_app(cfg).await;

    let (status, _) = post(&t.app, "/v1/commands", command("!ban spam @u:example.org spam")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(t.homeserver.published().len(), 1);
    assert_eq!(t.notifier.reactions(), vec!["$cmd"]);
    assert_eq!(
        verify_audit_chain(&audit_path).unwrap(),
        "audit chain verified: 1 records"
    );
}

#[tokio::test]
async fn unencrypted_command_is_accepted_but_dropped() {
    let t = test_app(test_config()).await;
    let mut body = command("!ban spam @u:example.org spam");
    body["was_encrypted"] = json!(false);
    let (status, _) = post(&t.app, "/v1/commands", body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(t.homeserver.published().is_empty());
}

#[tokio::test]
async fn command_without_sender_is_rejected() {
    let t = test_app(test_config()).await;
    let mut body = command("!ban spam @u:example.org spam");
    body["sender"] = json!("");
    let (status, value) = post(&t.app, "/v1/commands", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["errcode"], "M_INVALID_PARAM");
}

#[tokio::test]
async fn report_outcomes_map_to_statuses() {
    let t = test_app(test_config()).await;

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": "@rando:example.org", "target_user": "@u:example.org", "reason": "/ban spam x"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, json!({"outcome": "notice"}));

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": ADMIN, "target_user": "@u:example.org", "reason": "/ban nope x"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["errcode"], "M_NOT_FOUND");

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": ADMIN, "target_user": "@u:example.org", "reason": "/ban spam"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["errcode"], "M_INVALID_PARAM");

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": ADMIN, "target_user": "@u:example.org", "reason": "/ban spam flooding"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["outcome"], "policy");
    assert_eq!(value["list_room"], SPAM_LIST);
    assert_eq!(value["recommendation"], "m.ban");

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": ADMIN, "target_user": "@u:example.org", "reason": "/ban spam again"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(value["errcode"], "NET.BULWARK.ALREADY_BANNED");
}

#[tokio::test]
async fn ingested_unban_blocks_report_escalation() {
    let t = test_app(test_config()).await;
    let (status, _) = post(
        &t.app,
        "/v1/policies",
        json!({
            "list_room": SPAM_LIST,
            "entity_kind": "user",
            "state_key": "abc",
            "sender": "@mod:example.org",
            "timestamp_ms": 1,
            "content": {"entity": "@u:example.org", "reason": "appealed", "recommendation": "net.bulwark.unban"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, value) = post(
        &t.app,
        "/v1/reports",
        json!({"reporter": ADMIN, "target_user": "@u:example.org", "reason": "/ban spam x"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(value["errcode"], "NET.BULWARK.UNBAN_RECOMMENDED");
    assert!(t.homeserver.published().is_empty());
}

#[tokio::test]
async fn membership_updates_feed_kicks_and_pseudonyms() {
    let t = test_app(test_config()).await;
    let (status, _) = post(
        &t.app,
        "/v1/memberships",
        json!({"room_id": "!lobby:example.org", "joined": ["@spam1:example.org", "@spam2:example.org"]}),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    post(&t.app, "/v1/commands", command("!kick @spam*:example.org bye")).await;
    assert_eq!(t.homeserver.kicks().len(), 2);

    let digest = bulwark_kernel::sha256_base64("@spam1:example.org");
    post(&t.app, "/v1/commands", command(&format!("!match {digest}"))).await;
    assert!(t
        .notifier
        .any_notice_contains("Matched user `@spam1:example.org`"));
}

#[tokio::test]
async fn invalid_membership_room_is_rejected() {
    let t = test_app(test_config()).await;
    let (status, _) = post(
        &t.app,
        "/v1/memberships",
        json!({"room_id": "#alias:example.org", "joined": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sqlite_store_survives_restart() {
    let mut cfg = test_config();
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(format!("{}.db", unique("store")));

    let first = test_app(cfg.clone()).await;
    post(&first.app, "/v1/commands", command("!ban spam @u:example.org x")).await;
    let key = first.homeserver.published()[0].state_key.clone();
    drop(first);

    let second = test_app(cfg).await;
    post(&second.app, "/v1/commands", command("!remove-ban spam @u:example.org")).await;
    let published = second.homeserver.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].state_key, key);
    assert!(published[0].content.is_tombstone());
}
