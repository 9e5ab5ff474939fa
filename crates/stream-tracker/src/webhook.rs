//! Tracker — Webhook Variant (C6): an HTTP server that accepts platform hub
//! callbacks and maintains subscriptions (§4.6, §6 HTTP webhook surface).
//!
//! An axum `Router` bound with `TcpListener::bind`, with graceful shutdown
//! via a `CancellationToken`; the subscription renewal loop is a periodic
//! background task that re-issues a lease before it expires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracker_core::error::Error;
use tracker_core::events::{
    Event, EventBus, EventPayload, StreamChangedEvent, StreamOfflineEvent, StreamOnlineEvent,
};
use twitch_api::TwitchApi;

use crate::suppression::{LastEventTracker, Transition};

/// Default webhook subscription lease, in seconds (§4.6, §10.4).
pub const DEFAULT_LEASE_SECONDS: u64 = 86_400;

/// Bounded history of notification ids used to deduplicate POSTs (§4.6).
const NOTIFICATION_ID_HISTORY: usize = 100;

/// Bounded retry budget for the initial subscribe attempt (§4.6).
const SUBSCRIBE_MAX_ATTEMPTS: u32 = 10;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unknown,
    Subscribed,
    Unsubscribed,
}

struct ChannelState {
    id: String,
    secret: String,
    state: SubscriptionState,
}

struct Shared {
    api: Arc<dyn TwitchApi>,
    bus: EventBus,
    channels: RwLock<HashMap<String, ChannelState>>,
    last_event: Mutex<LastEventTracker>,
    seen_notification_ids: Mutex<VecDeque<String>>,
    callback_base_url: String,
}

/// The webhook tracker: an HTTP server plus the subscription lifecycle that
/// keeps it registered with the upstream hub.
pub struct WebhookTracker {
    shared: Arc<Shared>,
    channels: Vec<String>,
    bind_addr: String,
    lease_seconds: u64,
    shutdown: CancellationToken,
}

impl WebhookTracker {
    pub fn new(
        channels: Vec<String>,
        api: Arc<dyn TwitchApi>,
        bus: EventBus,
        bind_addr: impl Into<String>,
        callback_base_url: impl Into<String>,
        lease_seconds: u64,
    ) -> Self {
        let shared = Arc::new(Shared {
            api,
            bus,
            channels: RwLock::new(HashMap::new()),
            last_event: Mutex::new(LastEventTracker::new()),
            seen_notification_ids: Mutex::new(VecDeque::with_capacity(NOTIFICATION_ID_HISTORY)),
            callback_base_url: callback_base_url.into(),
        });
        Self {
            shared,
            channels,
            bind_addr: bind_addr.into(),
            lease_seconds,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves channel ids, subscribes every channel with the hub, starts
    /// the renewal background task, and serves the HTTP callback surface
    /// until `stop()` is called.
    pub async fn run(&self) -> Result<(), Error> {
        self.resolve_and_register_channels().await;
        self.subscribe_all().await;

        let renewer_shared = self.shared.clone();
        let renewer_channels: Vec<String> = self.channels.clone();
        let lease_seconds = self.lease_seconds;
        let renewer_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = renewer_shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(lease_seconds)) => {}
                }
                for channel in &renewer_channels {
                    subscribe_one(&renewer_shared, channel, "subscribe", lease_seconds).await;
                }
            }
        });

        let app = build_router(self.shared.clone());
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "webhook tracker listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await?;

        self.unsubscribe_all().await;
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn resolve_and_register_channels(&self) {
        let users = match self.shared.api.get_users(&self.channels, &[]).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "failed to resolve channel ids for webhook subscriptions");
                return;
            }
        };
        let mut map = self.shared.channels.write();
        for user in users {
            map.insert(
                user.login,
                ChannelState {
                    id: user.id,
                    secret: random_secret(),
                    state: SubscriptionState::Unknown,
                },
            );
        }
    }

    async fn subscribe_all(&self) {
        for channel in &self.channels {
            subscribe_one(&self.shared, channel, "subscribe", self.lease_seconds).await;
        }
    }

    async fn unsubscribe_all(&self) {
        let subscribed: Vec<String> = {
            let map = self.shared.channels.read();
            map.iter()
                .filter(|(_, s)| s.state == SubscriptionState::Subscribed)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in subscribed {
            subscribe_one(&self.shared, &channel, "unsubscribe", self.lease_seconds).await;
        }
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::rng(), &mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// POSTs a subscribe/unsubscribe request to the hub with bounded retry
/// (§4.6: max ~10 attempts, 10s waits).
async fn subscribe_one(shared: &Arc<Shared>, channel: &str, mode: &str, lease_seconds: u64) {
    let (channel_id, secret) = {
        let map = shared.channels.read();
        match map.get(channel) {
            Some(state) => (state.id.clone(), state.secret.clone()),
            None => {
                warn!(channel, "no resolved id for channel, skipping subscribe");
                return;
            }
        }
    };
    let topic = twitch_api::stream_topic(&channel_id);
    let callback = twitch_api::callback_url(&shared.callback_base_url, channel);

    for attempt in 1..=SUBSCRIBE_MAX_ATTEMPTS {
        match shared
            .api
            .post_webhook(&callback, mode, &topic, &secret, lease_seconds)
            .await
        {
            Ok(()) => return,
            Err(e) => {
                warn!(channel, mode, attempt, error = %e, "webhook subscribe attempt failed");
                if attempt < SUBSCRIBE_MAX_ATTEMPTS {
                    tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    shared: Arc<Shared>,
}

fn build_router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route(
            "/webhook/streams/{channel}",
            get(handle_verification).post(handle_notification),
        )
        .with_state(AppState { shared })
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[derive(serde::Deserialize)]
struct HubQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Verification handshake (§4.6 GET).
async fn handle_verification(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<HubQuery>,
) -> (StatusCode, String) {
    if !state.shared.channels.read().contains_key(&channel) {
        return (StatusCode::BAD_REQUEST, String::new());
    }

    match query.mode.as_deref() {
        Some("subscribe") | Some("unsubscribe") => {
            let new_state = if query.mode.as_deref() == Some("subscribe") {
                SubscriptionState::Subscribed
            } else {
                SubscriptionState::Unsubscribed
            };
            if let Some(entry) = state.shared.channels.write().get_mut(&channel) {
                entry.state = new_state;
            }
            (StatusCode::OK, query.challenge.unwrap_or_default())
        }
        Some("denied") => {
            if let Some(entry) = state.shared.channels.write().get_mut(&channel) {
                entry.state = SubscriptionState::Unsubscribed;
            }
            (StatusCode::OK, String::new())
        }
        _ => (StatusCode::BAD_REQUEST, String::new()),
    }
}

/// Notification handler (§4.6 POST): validates the HMAC signature,
/// deduplicates on `Twitch-Notification-Id`, and converts the payload into
/// a `StreamChanged`/`StreamOffline` event using the shared suppression
/// logic.
async fn handle_notification(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> StatusCode {
    let secret = {
        let map = state.shared.channels.read();
        match map.get(&channel) {
            Some(entry) => entry.secret.clone(),
            None => return StatusCode::BAD_REQUEST,
        }
    };

    let Some(notification_id) = headers
        .get("Twitch-Notification-Id")
        .and_then(|v| v.to_str().ok())
    else {
        return StatusCode::NOT_FOUND;
    };

    let Some(signature_header) = headers
        .get("X-Hub-Signature")
        .and_then(|v| v.to_str().ok())
    else {
        return StatusCode::FORBIDDEN;
    };
    if !verify_signature(&secret, &body, signature_header) {
        return StatusCode::FORBIDDEN;
    }

    {
        let mut seen = state.shared.seen_notification_ids.lock();
        if seen.contains(&notification_id.to_string()) {
            return StatusCode::OK;
        }
        if seen.len() >= NOTIFICATION_ID_HISTORY {
            seen.pop_front();
        }
        seen.push_back(notification_id.to_string());
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::OK,
    };
    let data = payload["data"].as_array().cloned().unwrap_or_default();
    let sample = data.first().map(|entry| tracker_core::model::StreamInfo {
        channel_name: channel.clone(),
        channel_id: entry["user_id"].as_str().unwrap_or_default().to_string(),
        game_name: entry["game_name"].as_str().unwrap_or_default().to_string(),
        title: entry["title"].as_str().unwrap_or_default().to_string(),
        started_at: entry["started_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now),
        raw: entry.clone(),
    });

    let channel_id = {
        let map = state.shared.channels.read();
        map.get(&channel).map(|c| c.id.clone()).unwrap_or_default()
    };

    let transition = state.shared.last_event.lock().observe(&channel, sample);
    match transition {
        Some(Transition::Online(info)) => {
            state.shared.bus.publish(Event::new(EventPayload::StreamOnline(
                StreamOnlineEvent {
                    channel,
                    channel_id,
                    stream: info,
                },
            )));
        }
        Some(Transition::Changed(info)) => {
            state.shared.bus.publish(Event::new(EventPayload::StreamChanged(
                StreamChangedEvent {
                    channel,
                    channel_id,
                    stream: info,
                },
            )));
        }
        Some(Transition::Offline) => {
            state.shared.bus.publish(Event::new(EventPayload::StreamOffline(
                StreamOfflineEvent { channel, channel_id },
            )));
        }
        None => {}
    }

    StatusCode::OK
}

fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tracker_core::model::{VideoInfo, VideoType};
    use twitch_api::User;

    struct NoopApi;
    #[async_trait]
    impl TwitchApi for NoopApi {
        async fn get_streams(
            &self,
            _channels: &[String],
        ) -> Result<Vec<tracker_core::model::StreamInfo>, Error> {
            Ok(vec![])
        }
        async fn get_video(&self, _id: &str) -> Result<VideoInfo, Error> {
            unimplemented!()
        }
        async fn get_videos(
            &self,
            _c: &str,
            _k: VideoType,
            _l: usize,
        ) -> Result<Vec<VideoInfo>, Error> {
            unimplemented!()
        }
        async fn get_variant_playlist(&self, _id: &str) -> Result<String, Error> {
            unimplemented!()
        }
        async fn get_live_variant_playlist(&self, _c: &str) -> Result<String, Error> {
            unimplemented!()
        }
        async fn get_users(&self, logins: &[String], _ids: &[String]) -> Result<Vec<User>, Error> {
            Ok(logins
                .iter()
                .map(|l| User { id: "1".into(), login: l.clone() })
                .collect())
        }
        async fn post_webhook(
            &self,
            _url: &str,
            _mode: &str,
            _topic: &str,
            _secret: &str,
            _lease: u64,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn shared_with_channel(channel: &str, secret: &str) -> Arc<Shared> {
        let mut channels = HashMap::new();
        channels.insert(
            channel.to_string(),
            ChannelState {
                id: "1".into(),
                secret: secret.into(),
                state: SubscriptionState::Subscribed,
            },
        );
        Arc::new(Shared {
            api: Arc::new(NoopApi),
            bus: EventBus::new(),
            channels: RwLock::new(channels),
            last_event: Mutex::new(LastEventTracker::new()),
            seen_notification_ids: Mutex::new(VecDeque::new()),
            callback_base_url: "http://localhost:8080".into(),
        })
    }

    #[test]
    fn signature_matches_hmac_sha256_of_body() {
        let body = b"hello world";
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature("secret", body, &format!("sha256={sig}")));
    }

    #[test]
    fn tampered_body_rejects_signature() {
        let body = b"hello world";
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!verify_signature("secret", b"hello WORLD", &format!("sha256={sig}")));
    }

    #[tokio::test]
    async fn duplicate_notification_ids_handled_once() {
        let shared = shared_with_channel("foo", "secret");
        let app = build_router(shared.clone());

        let body = serde_json::json!({"data": [{"user_id": "1", "game_name": "g", "title": "t"}]})
            .to_string();
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());

        for _ in 0..2 {
            let req = axum::http::Request::builder()
                .method("POST")
                .uri("/webhook/streams/foo")
                .header("X-Hub-Signature", format!("sha256={sig}"))
                .header("Twitch-Notification-Id", "abc123")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.clone()))
                .unwrap();
            let resp = tower::ServiceExt::oneshot(app.clone(), req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        assert_eq!(shared.seen_notification_ids.lock().len(), 1);
    }
}
