//! Configuration loading (§10.4): a TOML file covering tracked channels,
//! tracker mode, and the numeric knobs named throughout §4.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracker_core::error::Error;

fn default_poll_period_secs() -> u64 {
    60
}
fn default_live_period_secs() -> u64 {
    2
}
fn default_quality() -> String {
    "chunked".to_string()
}
fn default_webhook_port() -> u16 {
    8080
}
fn default_webhook_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_lease_seconds() -> u64 {
    stream_tracker::webhook::DEFAULT_LEASE_SECONDS
}
fn default_concurrency() -> usize {
    10
}
fn default_per_segment_retries() -> u32 {
    3
}
fn default_chunk_budget_secs() -> u64 {
    10 * default_concurrency() as u64
}
fn default_temp_dir() -> String {
    "/tmp/twitch-capture".to_string()
}
fn default_output_dir() -> String {
    "./captures".to_string()
}
fn default_stream_type() -> String {
    "live".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub channels: Vec<String>,

    pub tracker_mode: TrackerMode,

    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,

    #[serde(default = "default_live_period_secs")]
    pub live_period_secs: u64,

    #[serde(default = "default_webhook_bind")]
    pub webhook_bind: String,

    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    pub webhook_callback_base_url: Option<String>,

    #[serde(default = "default_lease_seconds")]
    pub webhook_lease_seconds: u64,

    #[serde(default = "default_quality")]
    pub quality: String,

    #[serde(default = "default_stream_type")]
    pub stream_type: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_per_segment_retries")]
    pub per_segment_retries: u32,

    #[serde(default = "default_chunk_budget_secs")]
    pub chunk_budget_secs: u64,

    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    pub twitch_client_id: String,
    pub twitch_client_secret: String,
}

/// CLI-sourced overrides for the most commonly tuned knobs (§10.5); any
/// field left `None` leaves the file-loaded value untouched.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub channels: Option<Vec<String>>,
    pub quality: Option<String>,
    pub output_dir: Option<String>,
}

impl Config {
    /// Loads and validates a config file, without applying any overrides.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    fn load_unvalidated(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(Error::from)?;
        toml::from_str(&text).map_err(|e| Error::ConfigError { reason: e.to_string() })
    }

    /// Loads a config file, applies CLI overrides on top, then validates the
    /// merged result (§10.5).
    pub fn load_with_overrides(path: &Path, overrides: &Overrides) -> Result<Self, Error> {
        let mut config = Self::load_unvalidated(path)?;
        if let Some(channels) = &overrides.channels {
            config.channels = channels.clone();
        }
        if let Some(quality) = &overrides.quality {
            config.quality = quality.clone();
        }
        if let Some(output_dir) = &overrides.output_dir {
            config.output_dir = output_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.channels.is_empty() {
            return Err(Error::config_missing("channels"));
        }
        if self.twitch_client_id.trim().is_empty() {
            return Err(Error::config_missing("twitch_client_id"));
        }
        if self.twitch_client_secret.trim().is_empty() {
            return Err(Error::config_missing("twitch_client_secret"));
        }
        if self.tracker_mode == TrackerMode::Webhook && self.webhook_callback_base_url.is_none() {
            return Err(Error::config_missing("webhook_callback_base_url"));
        }
        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn live_period(&self) -> Duration {
        Duration::from_secs(self.live_period_secs)
    }

    pub fn fetch_options(&self) -> tracker_core::fetcher::FetchOptions {
        tracker_core::fetcher::FetchOptions {
            concurrency: self.concurrency,
            per_segment_retries: self.per_segment_retries,
            chunk_budget: Duration::from_secs(self.chunk_budget_secs),
            retry_base_delay: Duration::from_millis(500),
        }
    }

    pub fn stream_type(&self) -> Result<stream_tracker::facade::StreamType, Error> {
        match self.stream_type.as_str() {
            "live" => Ok(stream_tracker::facade::StreamType::Live),
            "vod" => Ok(stream_tracker::facade::StreamType::Vod),
            other => Err(Error::ConfigError {
                reason: format!("unknown stream_type {other:?}, expected \"live\" or \"vod\""),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_channels_is_a_config_error() {
        let toml_text = r#"
            tracker_mode = "polling"
            twitch_client_id = "id"
            twitch_client_secret = "secret"
            channels = []
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigError { .. })));
    }

    #[test]
    fn webhook_mode_requires_callback_base_url() {
        let toml_text = r#"
            tracker_mode = "webhook"
            twitch_client_id = "id"
            twitch_client_secret = "secret"
            channels = ["foo"]
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_documented_constants() {
        let toml_text = r#"
            tracker_mode = "polling"
            twitch_client_id = "id"
            twitch_client_secret = "secret"
            channels = ["foo"]
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.poll_period_secs, 60);
        assert_eq!(config.live_period_secs, 2);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.chunk_budget_secs, 100);
        assert_eq!(config.webhook_lease_seconds, 86_400);
        assert_eq!(config.output_dir, "./captures");
    }

    #[test]
    fn cli_overrides_replace_only_the_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
                tracker_mode = "polling"
                twitch_client_id = "id"
                twitch_client_secret = "secret"
                channels = ["foo"]
                quality = "chunked"
            "#,
        )
        .unwrap();

        let overrides = Overrides {
            channels: Some(vec!["bar".into(), "baz".into()]),
            quality: None,
            output_dir: Some("/data/captures".into()),
        };
        let config = Config::load_with_overrides(&path, &overrides).unwrap();
        assert_eq!(config.channels, vec!["bar".to_string(), "baz".to_string()]);
        assert_eq!(config.quality, "chunked");
        assert_eq!(config.output_dir, "/data/captures");
    }
}
