//! Stream Downloader Facade (C7): subscribes to `StreamOnline`, allocates a
//! temp file, drives the Download Manager, and hands the finished file to
//! the external storage finalizer (§4.7).
//!
//! Dedup-by-key (a map guarding against two concurrent downloads of the
//! same target) precedes mode dispatch (choose a mode, then drive it to
//! completion, then hand off), per this crate's two modes (VOD vs Live)
//! and its thin finalizer/error-sink collaborator contracts (§1, §9 open
//! question 3) rather than database-backed job/session bookkeeping.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::fs::File;
use tracing::{error, info};

use tracker_core::download_manager;
use tracker_core::error::Error;
use tracker_core::events::{Event, EventBus, EventKind, EventPayload, Subscriber};
use tracker_core::fetcher::FetchOptions;
use tracker_core::model::{DownloadCursor, VideoInfo, VideoType};
use tracker_core::playlist::PlaylistView;
use twitch_api::TwitchApi;

/// Default delay between VOD-appearance polls while waiting for a stream's
/// matching archive to show up in the channel's video list (§4.7).
pub const WAIT_VOD_DELAY: Duration = Duration::from_secs(10);

/// The two download modes a tracked channel can be configured for (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Live,
    Vod,
}

/// What gets handed to the storage finalizer on completion. VOD downloads
/// resolve a concrete `VideoInfo`; live downloads have no video resource to
/// report (the broadcast is still ongoing server-side), so they carry the
/// channel/start-time pair instead (§9 open question 3: persistence and the
/// broadcast-id index both live outside this contract).
#[derive(Debug, Clone)]
pub enum FinalizedBroadcast {
    Vod(VideoInfo),
    Live {
        channel: String,
        channel_id: String,
        started_at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait StorageFinalizer: Send + Sync {
    async fn finalize(&self, broadcast: FinalizedBroadcast, temp_path: PathBuf);
}

#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record_failure(&self, temp_path: PathBuf, error: Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadState {
    Idle,
    WaitingForVod,
    Downloading,
    Finalizing,
    Done,
    Failed,
}

struct DedupKey {
    channel_id: String,
    started_at: DateTime<Utc>,
}

impl PartialEq for DedupKey {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id && self.started_at == other.started_at
    }
}
impl Eq for DedupKey {}
impl std::hash::Hash for DedupKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.channel_id.hash(state);
        self.started_at.timestamp().hash(state);
    }
}

/// Builds a media-playlist fetcher closure that GETs the given URL through
/// a shared client, for use with `PlaylistView::new_vod`/`new_live`.
fn media_fetcher(
    client: reqwest::Client,
) -> Arc<
    dyn Fn(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, Error>> + Send>>
        + Send
        + Sync,
> {
    Arc::new(move |url: String| {
        let client = client.clone();
        Box::pin(async move {
            let resp = client.get(&url).send().await?;
            resp.text().await.map_err(Error::from)
        })
    })
}

pub struct StreamDownloaderFacade {
    api: Arc<dyn TwitchApi>,
    bus: EventBus,
    finalizer: Arc<dyn StorageFinalizer>,
    error_sink: Arc<dyn ErrorSink>,
    temp_dir: PathBuf,
    quality: String,
    stream_type: StreamType,
    fetch_options: FetchOptions,
    live_period: Duration,
    in_flight: Mutex<HashSet<DedupKey>>,
}

impl StreamDownloaderFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn TwitchApi>,
        bus: EventBus,
        finalizer: Arc<dyn StorageFinalizer>,
        error_sink: Arc<dyn ErrorSink>,
        temp_dir: PathBuf,
        quality: impl Into<String>,
        stream_type: StreamType,
        fetch_options: FetchOptions,
        live_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            bus,
            finalizer,
            error_sink,
            temp_dir,
            quality: quality.into(),
            stream_type,
            fetch_options,
            live_period,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Registers this facade with the bus for `StreamOnline` events.
    pub fn subscribe(self: &Arc<Self>) {
        let subscriber: Arc<dyn Subscriber> = Arc::new(self.clone());
        self.bus
            .subscribe("stream-downloader-facade", subscriber, &[EventKind::StreamOnline]);
    }

    async fn run_for_stream(
        self: Arc<Self>,
        channel: String,
        channel_id: String,
        started_at: DateTime<Utc>,
    ) {
        let mut state = DownloadState::Idle;
        let temp_path = self.temp_dir.join(format!(
            "{}-{}.ts",
            channel,
            started_at.timestamp()
        ));

        let result = self
            .run_state_machine(&mut state, &channel, &channel_id, started_at, &temp_path)
            .await;

        match result {
            Ok(broadcast) => {
                state = DownloadState::Finalizing;
                self.finalizer.finalize(broadcast, temp_path).await;
                state = DownloadState::Done;
            }
            Err(e) => {
                state = DownloadState::Failed;
                error!(channel, error = %e, "download failed, file left for inspection");
                self.bus.publish(Event::new(EventPayload::Exception(
                    tracker_core::events::ExceptionEvent {
                        message: e.to_string(),
                    },
                )));
                self.error_sink.record_failure(temp_path, e).await;
            }
        }
        let _ = state;

        self.in_flight.lock().remove(&DedupKey {
            channel_id,
            started_at,
        });
    }

    async fn run_state_machine(
        &self,
        state: &mut DownloadState,
        channel: &str,
        channel_id: &str,
        started_at: DateTime<Utc>,
        temp_path: &PathBuf,
    ) -> Result<FinalizedBroadcast, Error> {
        match self.stream_type {
            StreamType::Vod => {
                *state = DownloadState::WaitingForVod;
                let video = self.await_matching_vod(channel, started_at).await?;

                *state = DownloadState::Downloading;
                let sink = File::create(temp_path).await?;
                let api = self.api.clone();
                let video_id = video.id.clone();
                let client = reqwest::Client::new();
                let view = PlaylistView::new_vod(
                    self.quality.clone(),
                    Arc::new({
                        let api = api.clone();
                        let video_id = video_id.clone();
                        move || {
                            let api = api.clone();
                            let video_id = video_id.clone();
                            Box::pin(async move { api.get_variant_playlist(&video_id).await })
                        }
                    }),
                    media_fetcher(client.clone()),
                );
                let fetcher = Arc::new({
                    let api = api.clone();
                    let video_id = video_id.clone();
                    move || {
                        let api = api.clone();
                        let video_id = video_id.clone();
                        Box::pin(async move { api.get_video(&video_id).await })
                    }
                });
                download_manager::run_archive(
                    video_id,
                    view,
                    fetcher,
                    sink,
                    &client,
                    &self.fetch_options,
                    &self.bus,
                    DownloadCursor::default(),
                    tokio_util::sync::CancellationToken::new(),
                )
                .await?;
                Ok(FinalizedBroadcast::Vod(video))
            }
            StreamType::Live => {
                *state = DownloadState::Downloading;
                let sink = File::create(temp_path).await?;
                let api = self.api.clone();
                let channel_owned = channel.to_string();
                let client = reqwest::Client::new();
                let view = PlaylistView::new_live(
                    self.quality.clone(),
                    Arc::new({
                        let api = api.clone();
                        let channel_owned = channel_owned.clone();
                        move || {
                            let api = api.clone();
                            let channel_owned = channel_owned.clone();
                            Box::pin(async move { api.get_live_variant_playlist(&channel_owned).await })
                        }
                    }),
                    media_fetcher(client.clone()),
                );
                download_manager::run_live(
                    channel.to_string(),
                    view,
                    sink,
                    &client,
                    &self.fetch_options,
                    &self.bus,
                    tokio_util::sync::CancellationToken::new(),
                    self.live_period,
                )
                .await?;
                Ok(FinalizedBroadcast::Live {
                    channel: channel.to_string(),
                    channel_id: channel_id.to_string(),
                    started_at,
                })
            }
        }
    }

    /// Polls the channel's archive list every `WAIT_VOD_DELAY` until a video
    /// whose `created_at` is within one minute of `started_at` appears
    /// (§4.7).
    async fn await_matching_vod(
        &self,
        channel: &str,
        started_at: DateTime<Utc>,
    ) -> Result<VideoInfo, Error> {
        loop {
            let videos = self.api.get_videos(channel, VideoType::Archive, 5).await?;
            if let Some(video) = videos
                .into_iter()
                .find(|v| (v.created_at - started_at).num_seconds().abs() <= 60)
            {
                return Ok(video);
            }
            self.bus.publish(Event::new(EventPayload::AwaitingStream(
                tracker_core::events::AwaitingStreamEvent {
                    channel: channel.to_string(),
                    sleep_time_secs: WAIT_VOD_DELAY.as_secs(),
                },
            )));
            tokio::time::sleep(WAIT_VOD_DELAY).await;
        }
    }
}

#[async_trait]
impl Subscriber for Arc<StreamDownloaderFacade> {
    async fn handle(&self, event: Event) {
        let EventPayload::StreamOnline(online) = event.payload else {
            return;
        };
        let key = DedupKey {
            channel_id: online.channel_id.clone(),
            started_at: online.stream.started_at,
        };
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains(&key) {
                info!(channel = %online.channel, "already downloading this broadcast, ignoring duplicate StreamOnline");
                return;
            }
            in_flight.insert(key);
        }

        // Each broadcast downloads on its own spawned task so a slow or
        // long-running download never blocks delivery of later events to
        // this subscriber (the bus only guarantees FIFO up to the point a
        // handler hands work off).
        let facade = self.clone();
        tokio::spawn(async move {
            facade
                .run_for_stream(online.channel, online.channel_id, online.stream.started_at)
                .await;
        });
    }
}
