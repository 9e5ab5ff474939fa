//! Concrete adapter for the upstream platform's HTTP API.
//!
//! §6 treats this as a thin, swappable collaborator; this crate supplies
//! that contract (the `TwitchApi` trait) plus one concrete implementation
//! (`HelixApi`) so the rest of the workspace has something real to drive.
//! Request construction uses typed headers over a shared `reqwest::Client`,
//! and rate limiting reads the platform's own `Ratelimit-Remaining`/
//! `Ratelimit-Reset` headers and backs off on 429 (§5/§10.3).

pub mod duration;
pub mod rate_limit;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use rate_limit::{Backoff429, RateLimiter, RateLimiterConfig};
use tracker_core::error::Error;
use tracker_core::model::{StreamInfo, VariantPlaylist, VideoInfo, VideoType};

/// A user the upstream returned for a login or id lookup.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub login: String,
}

/// The contract the tracker core, download manager and webhook subscription
/// lifecycle all consume (§6). Object-safe via `async-trait` so it can be
/// held behind an `Arc<dyn TwitchApi>`.
#[async_trait]
pub trait TwitchApi: Send + Sync {
    /// Batched stream-status lookup, bounded to `MAX_IDS` (100) per call.
    async fn get_streams(&self, channels: &[String]) -> Result<Vec<StreamInfo>, Error>;

    async fn get_video(&self, video_id: &str) -> Result<VideoInfo, Error>;

    async fn get_videos(
        &self,
        channel: &str,
        kind: VideoType,
        limit: usize,
    ) -> Result<Vec<VideoInfo>, Error>;

    async fn get_variant_playlist(&self, video_id: &str) -> Result<String, Error>;

    async fn get_live_variant_playlist(&self, channel: &str) -> Result<String, Error>;

    /// Resolves logins or ids to users; exactly one of `logins`/`ids`
    /// should be non-empty.
    async fn get_users(&self, logins: &[String], ids: &[String]) -> Result<Vec<User>, Error>;

    async fn post_webhook(
        &self,
        callback_url: &str,
        mode: &str,
        topic: &str,
        secret: &str,
        lease_seconds: u64,
    ) -> Result<(), Error>;
}

const MAX_IDS_PER_CALL: usize = 100;

/// Splits `ids` into chunks of at most `MAX_IDS_PER_CALL` for batched
/// lookups against endpoints that cap how many ids a single request
/// may carry (§10.3).
pub fn chunk_ids(ids: &[String]) -> impl Iterator<Item = &[String]> {
    ids.chunks(MAX_IDS_PER_CALL)
}

struct CachedToken {
    token: String,
    // The app-access-token lifetime the upstream grants is close to 21h in
    // practice (notionally 24h minus safety margin); refreshed proactively
    // rather than waiting for a 401 (§9 "global mutable caches").
    expires_at: Instant,
}

/// `reqwest`-backed implementation of [`TwitchApi`] against the Helix API,
/// falling back to the legacy v5 GraphQL/kraken shape only where Helix has
/// no equivalent (playlist URLs are resolved via the public usher/GQL
/// surface).
pub struct HelixApi {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    callback_base_url: String,
    rate_limiter: RateLimiter,
    token: RwLock<Option<CachedToken>>,
    user_cache: RwLock<HashMap<String, User>>,
}

impl HelixApi {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        callback_base_url: impl Into<String>,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            callback_base_url: callback_base_url.into(),
            rate_limiter: RateLimiter::new(RateLimiterConfig::default()),
            token: RwLock::new(None),
            user_cache: RwLock::new(HashMap::new()),
        })
    }

    fn cached_token(&self) -> Option<String> {
        let guard = self.token.read();
        match guard.as_ref() {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.token.clone()),
            _ => None,
        }
    }

    #[instrument(skip(self))]
    async fn authorize(&self) -> Result<String, Error> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let resp = self
            .client
            .post("https://id.twitch.tv/oauth2/token")
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let body: TokenResponse = resp.json().await?;

        let ttl = Duration::from_secs(body.expires_in.min(21 * 3600));
        *self.token.write() = Some(CachedToken {
            token: body.access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(body.access_token)
    }

    /// One authorized, rate-limited, 429-retried request against Helix.
    /// Retries transient failures per §7, and re-authorizes exactly once on
    /// 401 before surfacing `AuthExpired` (§7 `AuthExpired`).
    async fn helix_request(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, Error> {
        let mut backoff = Backoff429::new();
        let mut reauthorized_once = false;

        loop {
            self.rate_limiter.acquire().await;
            let token = self.authorize().await?;

            let resp = self
                .client
                .get(format!("https://api.twitch.tv/helix/{path}"))
                .header("Client-Id", &self.client_id)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            let remaining: Option<u32> = resp
                .headers()
                .get("Ratelimit-Remaining")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let reset: Option<i64> = resp
                .headers()
                .get("Ratelimit-Reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            self.rate_limiter.observe_headers(remaining, reset).await;

            match resp.status().as_u16() {
                200..=299 => return resp.json().await.map_err(Error::from),
                401 if !reauthorized_once => {
                    warn!("helix token expired, re-authorizing once");
                    *self.token.write() = None;
                    reauthorized_once = true;
                    continue;
                }
                401 => return Err(Error::AuthExpired),
                429 => {
                    let wait = backoff.next().unwrap_or(Duration::from_secs(64));
                    debug!(?wait, "helix 429, backing off");
                    tokio::time::sleep(wait).await;
                }
                status if status >= 500 => {
                    return Err(Error::TransientNetwork(format!("helix {status} for {path}")));
                }
                status => return Err(Error::PermanentApi { status }),
            }
        }
    }
}

#[async_trait]
impl TwitchApi for HelixApi {
    #[instrument(skip(self))]
    async fn get_streams(&self, channels: &[String]) -> Result<Vec<StreamInfo>, Error> {
        let mut out = Vec::with_capacity(channels.len());
        for chunk in chunk_ids(channels) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|c| ("user_login", c.as_str())).collect();
            let body = self.helix_request("streams", &query).await?;
            let data = body["data"].as_array().cloned().unwrap_or_default();
            for entry in data {
                out.push(parse_stream_info(&entry)?);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn get_video(&self, video_id: &str) -> Result<VideoInfo, Error> {
        let body = self
            .helix_request("videos", &[("id", video_id)])
            .await?;
        let entry = body["data"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| Error::PermanentApi { status: 404 })?;
        parse_video_info(entry)
    }

    #[instrument(skip(self))]
    async fn get_videos(
        &self,
        channel: &str,
        kind: VideoType,
        limit: usize,
    ) -> Result<Vec<VideoInfo>, Error> {
        let kind_str = match kind {
            VideoType::Archive => "archive",
            VideoType::Highlight => "highlight",
            VideoType::Upload => "upload",
        };
        let limit_str = limit.to_string();
        let body = self
            .helix_request(
                "videos",
                &[
                    ("user_login", channel),
                    ("type", kind_str),
                    ("first", limit_str.as_str()),
                ],
            )
            .await?;
        let data = body["data"].as_array().cloned().unwrap_or_default();
        data.iter().map(parse_video_info).collect()
    }

    #[instrument(skip(self))]
    async fn get_variant_playlist(&self, video_id: &str) -> Result<String, Error> {
        // Helix has no playlist endpoint; VOD playback manifests are served
        // from the public `vod-secure` usher host instead.
        let url = format!("https://usher.ttvnw.net/vod/{video_id}.m3u8");
        let resp = self.client.get(url).send().await?;
        resp.text().await.map_err(Error::from)
    }

    #[instrument(skip(self))]
    async fn get_live_variant_playlist(&self, channel: &str) -> Result<String, Error> {
        let url = format!("https://usher.ttvnw.net/api/channel/hls/{channel}.m3u8");
        let resp = self.client.get(url).send().await?;
        resp.text().await.map_err(Error::from)
    }

    #[instrument(skip(self))]
    async fn get_users(&self, logins: &[String], ids: &[String]) -> Result<Vec<User>, Error> {
        let mut out = Vec::new();
        let mut missing_logins = Vec::new();
        {
            let cache = self.user_cache.read();
            for login in logins {
                match cache.get(login) {
                    Some(user) => out.push(user.clone()),
                    None => missing_logins.push(login.clone()),
                }
            }
        }
        if missing_logins.is_empty() && ids.is_empty() {
            return Ok(out);
        }

        for chunk in chunk_ids(&missing_logins) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|l| ("login", l.as_str())).collect();
            let body = self.helix_request("users", &query).await?;
            self.ingest_users(&body, &mut out)?;
        }
        for chunk in chunk_ids(ids) {
            let query: Vec<(&str, &str)> = chunk.iter().map(|i| ("id", i.as_str())).collect();
            let body = self.helix_request("users", &query).await?;
            self.ingest_users(&body, &mut out)?;
        }
        Ok(out)
    }

    #[instrument(skip(self, secret))]
    async fn post_webhook(
        &self,
        callback_url: &str,
        mode: &str,
        topic: &str,
        secret: &str,
        lease_seconds: u64,
    ) -> Result<(), Error> {
        let _ = &self.callback_base_url;
        let body = serde_json::json!({
            "hub.callback": callback_url,
            "hub.mode": mode,
            "hub.topic": topic,
            "hub.lease_seconds": lease_seconds,
            "hub.secret": secret,
        });
        self.rate_limiter.acquire().await;
        let token = self.authorize().await?;
        let resp = self
            .client
            .post("https://api.twitch.tv/helix/webhooks/hub")
            .header("Client-Id", &self.client_id)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        if resp.status().is_success() || resp.status().as_u16() == 202 {
            Ok(())
        } else {
            Err(Error::PermanentApi {
                status: resp.status().as_u16(),
            })
        }
    }
}

impl HelixApi {
    fn ingest_users(
        &self,
        body: &serde_json::Value,
        out: &mut Vec<User>,
    ) -> Result<(), Error> {
        let data = body["data"].as_array().cloned().unwrap_or_default();
        let mut cache = self.user_cache.write();
        for entry in data {
            let user = User {
                id: entry["id"].as_str().unwrap_or_default().to_string(),
                login: entry["login"].as_str().unwrap_or_default().to_string(),
            };
            cache.insert(user.login.clone(), user.clone());
            out.push(user);
        }
        Ok(())
    }
}

fn parse_stream_info(entry: &serde_json::Value) -> Result<StreamInfo, Error> {
    let started_at = entry["started_at"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(StreamInfo {
        channel_name: entry["user_login"].as_str().unwrap_or_default().to_string(),
        channel_id: entry["user_id"].as_str().unwrap_or_default().to_string(),
        game_name: entry["game_name"].as_str().unwrap_or_default().to_string(),
        title: entry["title"].as_str().unwrap_or_default().to_string(),
        started_at,
        raw: entry.clone(),
    })
}

fn parse_video_info(entry: &serde_json::Value) -> Result<VideoInfo, Error> {
    let created_at = entry["created_at"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let kind = match entry["type"].as_str().unwrap_or("archive") {
        "highlight" => VideoType::Highlight,
        "upload" => VideoType::Upload,
        _ => VideoType::Archive,
    };
    let duration_secs = duration::parse_duration(entry["duration"].as_str().unwrap_or("0s"))?;
    Ok(VideoInfo {
        id: entry["id"].as_str().unwrap_or_default().to_string(),
        title: entry["title"].as_str().unwrap_or_default().to_string(),
        kind,
        channel_name: entry["user_login"].as_str().unwrap_or_default().to_string(),
        created_at,
        duration_secs,
        raw: entry.clone(),
    })
}

/// Builds the `topic` string the hub expects for stream-change
/// subscriptions, given a channel's upstream user id.
pub fn stream_topic(channel_id: &str) -> String {
    format!("https://api.twitch.tv/helix/streams?user_id={channel_id}")
}

/// Builds this webhook tracker's per-channel callback URL.
pub fn callback_url(base: &str, channel: &str) -> String {
    format!("{}/webhook/streams/{channel}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_topic_embeds_user_id() {
        assert_eq!(
            stream_topic("123"),
            "https://api.twitch.tv/helix/streams?user_id=123"
        );
    }

    #[test]
    fn callback_url_trims_trailing_slash() {
        assert_eq!(
            callback_url("http://example.com/", "foo"),
            "http://example.com/webhook/streams/foo"
        );
    }

    #[test]
    fn parse_stream_info_pulls_expected_fields() {
        let entry = serde_json::json!({
            "user_login": "foo",
            "user_id": "1",
            "game_name": "Just Chatting",
            "title": "hello",
            "started_at": "2024-01-01T00:00:00Z",
        });
        let info = parse_stream_info(&entry).unwrap();
        assert_eq!(info.channel_name, "foo");
        assert_eq!(info.channel_id, "1");
    }

    #[test]
    fn parse_video_info_parses_duration_and_type() {
        let entry = serde_json::json!({
            "id": "1",
            "title": "t",
            "type": "highlight",
            "user_login": "foo",
            "created_at": "2024-01-01T00:00:00Z",
            "duration": "1h2m3s",
        });
        let info = parse_video_info(&entry).unwrap();
        assert_eq!(info.kind, VideoType::Highlight);
        assert_eq!(info.duration_secs, 3600 + 120 + 3);
    }
}
