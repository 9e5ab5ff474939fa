//! Tracker — Polling Variant (C5): periodically queries channel statuses
//! and emits `StreamOnline`/`StreamOffline`/`StreamChanged` deltas.
//!
//! A "batch-query then diff against previous state" loop over a flat
//! channel list, with a `last_event[channel]` suppression contract (§4.5)
//! and no filter/session/repository machinery, which belongs to the
//! out-of-scope storage layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use tracker_core::error::Error;
use tracker_core::events::{
    Event, EventBus, EventPayload, StreamChangedEvent, StreamOfflineEvent, StreamOnlineEvent,
};
use tracker_core::model::StreamInfo;
use twitch_api::TwitchApi;

use crate::backoff::ReconnectBackoff;
use crate::suppression::{LastEventTracker, Transition};

/// Default interval between polling ticks (§4.5).
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(60);

/// Upstream's batch cap for `get_streams` (§6, §10.3).
const MAX_IDS: usize = 100;

pub struct PollingTracker {
    channels: Vec<String>,
    channel_ids: HashMap<String, String>,
    api: Arc<dyn TwitchApi>,
    bus: EventBus,
    poll_period: Duration,
    last_event: LastEventTracker,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    reconnect_backoff: ReconnectBackoff,
}

impl PollingTracker {
    pub fn new(
        channels: Vec<String>,
        api: Arc<dyn TwitchApi>,
        bus: EventBus,
        poll_period: Duration,
    ) -> Self {
        Self {
            channels,
            channel_ids: HashMap::new(),
            api,
            bus,
            poll_period,
            last_event: LastEventTracker::new(),
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
            reconnect_backoff: ReconnectBackoff::default(),
        }
    }

    /// Requests graceful termination; observed at the top of the next tick.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// The long-running poll loop. Returns only after `stop()` is called.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.resolve_channel_ids().await;

        loop {
            if self.is_stopped() {
                return Ok(());
            }

            let sleep_for = match self.tick().await {
                Ok(()) => {
                    self.reconnect_backoff.reset();
                    self.poll_period
                }
                Err(e) => {
                    // Tracker-level exceptions are caught, logged and
                    // retried after a bounded reconnection backoff (not the
                    // regular poll period, which would hammer an unreachable
                    // API at the same cadence as healthy polling); the loop
                    // never exits except via stop() (§7 propagation rule).
                    let delay = self.reconnect_backoff.next_delay();
                    warn!(error = %e, ?delay, "polling tracker tick failed, backing off before retry");
                    self.bus.publish(Event::new(EventPayload::Exception(
                        tracker_core::events::ExceptionEvent {
                            message: e.to_string(),
                        },
                    )));
                    delay
                }
            };

            tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn resolve_channel_ids(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        match self.api.get_users(&self.channels, &[]).await {
            Ok(users) => {
                for user in users {
                    self.channel_ids.insert(user.login, user.id);
                }
            }
            Err(e) => warn!(error = %e, "failed to resolve channel name to id mapping"),
        }
    }

    async fn tick(&mut self) -> Result<(), Error> {
        let mut online: HashMap<String, StreamInfo> = HashMap::new();
        for chunk in self.channels.chunks(MAX_IDS) {
            let infos = self.api.get_streams(chunk).await?;
            for info in infos {
                online.insert(info.channel_name.clone(), info);
            }
        }

        for channel in self.channels.clone() {
            let sample = online.get(&channel).cloned();
            let transition = self.last_event.observe(&channel, sample);
            let channel_id = self
                .channel_ids
                .get(&channel)
                .cloned()
                .unwrap_or_default();

            match transition {
                Some(Transition::Online(info)) => {
                    info!(channel, "stream online");
                    self.bus.publish(Event::new(EventPayload::StreamOnline(
                        StreamOnlineEvent {
                            channel: channel.clone(),
                            channel_id,
                            stream: info,
                        },
                    )));
                }
                Some(Transition::Offline) => {
                    info!(channel, "stream offline");
                    self.bus.publish(Event::new(EventPayload::StreamOffline(
                        StreamOfflineEvent {
                            channel: channel.clone(),
                            channel_id,
                        },
                    )));
                }
                Some(Transition::Changed(info)) => {
                    self.bus.publish(Event::new(EventPayload::StreamChanged(
                        StreamChangedEvent {
                            channel: channel.clone(),
                            channel_id,
                            stream: info,
                        },
                    )));
                }
                None => {}
            }
        }

        Ok(())
    }
}
