use async_trait::async_trait;
use bulwark_config::Config;
use bulwark_contracts::{EntityKind, PolicyContent};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collaborators::{Homeserver, HomeserverError, Notifier};

const SUCCESS_REACTION: &str = "\u{2705}";

pub struct HomeserverClient {
    base: Url,
    access_token: String,
    management_room: String,
    client: Client,
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct SenderResponse {
    sender: String,
}

impl HomeserverClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let base = Url::parse(&cfg.homeserver.url)
            .map_err(|e| format!("invalid homeserver.url: {e}"))?;
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self {
            base,
            access_token: cfg.homeserver.access_token.clone(),
            management_room: cfg.homeserver.management_room.clone(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HomeserverError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HomeserverError::Transport("homeserver url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, HomeserverError> {
        let mut path = vec!["_matrix", "client"];
        path.extend_from_slice(segments);
        Ok(self
            .client
            .request(method, self.endpoint(&path)?)
            .bearer_auth(&self.access_token))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, HomeserverError> {
        let response = request
            .send()
            .await
            .map_err(|e| HomeserverError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(HomeserverError::Http {
                status: status.as_u16(),
                errcode: body
                    .get("errcode")
                    .and_then(Value::as_str)
                    .unwrap_or("M_UNKNOWN")
                    .to_string(),
                message: body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| HomeserverError::Decode(e.to_string()))
    }

    async fn send_message_event(&self, event_type: &str, content: Value) -> Result<String, HomeserverError> {
        let txn_id = uuid::Uuid::new_v4().as_simple().to_string();
        let request = self.request(
            Method::PUT,
            &["v3", "rooms", self.management_room.as_str(), "send", event_type, txn_id.as_str()],
        )?;
        let response: EventIdResponse = self.send_json(request.json(&content)).await?;
        Ok(response.event_id)
    }
}

#[async_trait]
impl Homeserver for HomeserverClient {
    async fn publish_policy(
        &self,
        list_room: &str,
        kind: EntityKind,
        state_key: &str,
        content: &PolicyContent,
    ) -> Result<String, HomeserverError> {
        let request = self.request(
            Method::PUT,
            &["v3", "rooms", list_room, "state", kind.event_type(), state_key],
        )?;
        let response: EventIdResponse = self.send_json(request.json(content)).await?;
        Ok(response.event_id)
    }

    async fn kick_user(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), HomeserverError> {
        let request = self.request(Method::POST, &["v3", "rooms", room_id, "kick"])?;
        let _: Value = self
            .send_json(request.json(&json!({"user_id": user_id, "reason": reason})))
            .await?;
        Ok(())
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, HomeserverError> {
        let request = self.request(Method::POST, &["v3", "join", room_id_or_alias])?;
        let response: RoomIdResponse = self.send_json(request.json(&json!({}))).await?;
        Ok(response.room_id)
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), HomeserverError> {
        let request = self.request(Method::POST, &["v3", "rooms", room_id, "leave"])?;
        let _: Value = self.send_json(request.json(&json!({}))).await?;
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<String, HomeserverError> {
        let request = self.request(Method::GET, &["v3", "directory", "room", alias])?;
        let response: RoomIdResponse = self.send_json(request).await?;
        Ok(response.room_id)
    }

    async fn redact_user_events(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), HomeserverError> {
        let request = self.request(
            Method::POST,
            &["unstable", "org.matrix.msc4194", "rooms", room_id, "redact", "user", user_id],
        )?;
        let _: Value = self
            .send_json(request.json(&json!({"reason": reason})))
            .await?;
        Ok(())
    }

    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String, HomeserverError> {
        let request = self.request(Method::GET, &["v3", "rooms", room_id, "event", event_id])?;
        let response: SenderResponse = self.send_json(request).await?;
        Ok(response.sender)
    }
}

#[async_trait]
impl Notifier for HomeserverClient {
    async fn notice(&self, message: &str) {
        let content = json!({"msgtype": "m.notice", "body": message});
        if let Err(err) = self.send_message_event("m.room.message", content).await {
            tracing::warn!(error = %err, "failed to send notice");
        }
    }

    async fn react_success(&self, event_id: &str) {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event_id,
                "key": SUCCESS_REACTION,
            }
        });
        if let Err(err) = self.send_message_event("m.reaction", content).await {
            tracing::warn!(error = %err, event_id, "failed to send success reaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_config::{Audit, Commands, Enforcement, Homeserver as HomeserverCfg, Server, Store};

    fn client(url: &str) -> HomeserverClient {
        let cfg = Config {
            server: Server {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            homeserver: HomeserverCfg {
                url: url.to_string(),
                user_id: "@bot:example.org".to_string(),
                access_token: "token".to_string(),
                management_room: "!mgmt:example.org".to_string(),
            },
            commands: Commands::default(),
            enforcement: Enforcement::default(),
            admins: vec![],
            watched_lists: vec![],
            protected_rooms: vec![],
            store: Store {
                kind: "memory".to_string(),
                sqlite_path: None,
            },
            audit: Audit {
                jsonl_path: "unused".to_string(),
                immutable_mirror_path: None,
            },
        };
        HomeserverClient::new(&cfg).unwrap()
    }

    #[test]
    fn endpoint_percent_encodes_identifiers() {
        let hs = client("https://matrix.example.org/");
        let url = hs
            .endpoint(&["_matrix", "client", "v3", "rooms", "!a:x.org", "state", "m.policy.rule.user", "ab/c+="])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!a:x.org/state/m.policy.rule.user/ab%2Fc+="
        );
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let hs = client("https://example.org/matrix");
        let url = hs.endpoint(&["_matrix", "client", "v3", "join", "#room:x"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.org/matrix/_matrix/client/v3/join/%23room:x"
        );
    }
}
