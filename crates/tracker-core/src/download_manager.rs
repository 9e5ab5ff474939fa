//! Download Manager (C4): orchestrates the Playlist View and Segment
//! Fetcher for one broadcast, decides end-of-stream, and emits progress
//! events onto the bus.
//!
//! Archive (VOD) and Live are two distinct loops per §4.4, sharing the
//! fetcher/playlist-view machinery but differing in their termination
//! condition: VOD tolerates the upstream's unreliable `is_recording` flag
//! by also requiring a rolling window of empty refreshes (§4.4.1 step 6);
//! Live terminates on `endlist` and tolerates window slips as permanent,
//! non-fatal gaps (§4.4.2 step 6).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::Error;
use crate::events::{
    BeginDownloadingEvent, BeginDownloadingLiveEvent, DownloadedChunkEvent, Event,
    EndDownloadingEvent, EndDownloadingLiveEvent, EventBus, EventPayload, PlaylistUpdatedEvent,
    SegmentGapEvent,
};
use crate::fetcher::{self, FetchOptions};
use crate::model::{DownloadCursor, Marker, Segment};
use crate::playlist::PlaylistView;

/// How many consecutive empty refreshes are tolerated before an archive
/// download that still reports `is_recording = true` is declared finished
/// anyway (§4.4.1 step 6, §9 open question 2: termination takes the AND of
/// both heuristics).
pub const PLAYLIST_UPDATES_TO_FINISH: usize = 10;

/// Default interval between playlist refreshes while an archive download is
/// still recording and has nothing new to fetch.
pub const PLAYLIST_UPDATE_PERIOD: Duration = Duration::from_secs(60);

/// Default interval between playlist refreshes for a live download.
pub const LIVE_UPDATE_PERIOD: Duration = Duration::from_secs(2);

pub type VideoInfoFetcher =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<crate::model::VideoInfo, Error>> + Send>> + Send + Sync>;

/// Rolling boolean window tracking whether each refresh found new segments.
struct EmptyRefreshWindow {
    window: VecDeque<bool>,
    capacity: usize,
}

impl EmptyRefreshWindow {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, had_segments: bool) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(had_segments);
    }

    /// True once the window is full and every entry in it was empty.
    fn all_empty(&self) -> bool {
        self.window.len() >= self.capacity && self.window.iter().all(|&had| !had)
    }
}

/// Runs the archive (VOD) download loop for one video, appending its
/// segments to `sink` in order. Returns the total number of bytes written.
pub async fn run_archive(
    video_id: String,
    mut view: PlaylistView,
    video_info_fetcher: VideoInfoFetcher,
    mut sink: impl AsyncWrite + Unpin,
    client: &reqwest::Client,
    fetch_options: &FetchOptions,
    bus: &EventBus,
    mut resume_cursor: DownloadCursor,
    stop: tokio_util::sync::CancellationToken,
) -> Result<u64, Error> {
    bus.publish(Event::new(EventPayload::BeginDownloading(
        BeginDownloadingEvent {
            video_id: video_id.clone(),
        },
    )));

    let mut total_bytes = 0u64;
    let mut empty_window = EmptyRefreshWindow::new(PLAYLIST_UPDATES_TO_FINISH);
    let mut use_cached_url = true;

    loop {
        if stop.is_cancelled() {
            break;
        }

        let video = video_info_fetcher().await?;
        let is_recording = video.is_recording(Utc::now());

        view.refresh(use_cached_url).await?;
        use_cached_url = true;

        let marker = resume_cursor
            .last_written
            .map(Marker::Sequence)
            .unwrap_or(Marker::None);
        let to_load = view.segments_after(marker);
        let had_segments = !to_load.is_empty();

        bus.publish(Event::new(EventPayload::PlaylistUpdated(
            PlaylistUpdatedEvent {
                total: resume_cursor.last_written.map(|n| n as usize + 1).unwrap_or(0)
                    + to_load.len(),
                to_load: to_load.len(),
            },
        )));

        if had_segments {
            let first_segment = to_load.first().map(|s| s.media_sequence);
            let base_total = total_bytes;
            let last = fetcher::download(
                &to_load,
                &mut sink,
                view.base_uri(),
                client,
                fetch_options,
                |seg, bytes_written_so_far| {
                    bus.publish(Event::new(EventPayload::DownloadedChunk(
                        DownloadedChunkEvent {
                            first_segment,
                            last_segment: Some(seg.media_sequence),
                            data_size: base_total + bytes_written_so_far,
                            complete_segment: Some(seg.media_sequence),
                            write_segment: Some(seg.media_sequence),
                        },
                    )));
                },
            )
            .await;

            match last.last_marker {
                Some(seq) => {
                    total_bytes += last.bytes_written;
                    resume_cursor.advance_to(seq);
                }
                None => {
                    // The fetcher wrote nothing for a non-empty batch: the
                    // playlist URL may have expired. Force re-resolution of
                    // the variant playlist on the next refresh (§4.4.1 step 5).
                    warn!(video_id, "fetcher wrote nothing for a non-empty batch, forcing url re-resolution");
                    use_cached_url = false;
                }
            }
        }

        empty_window.push(had_segments);

        // A definitive `endlist` is a stronger signal than the rolling
        // empty-refresh window: when the upstream has actually closed the
        // playlist, there is no need to wait out ten more refreshes just to
        // confirm it. The window stays the fallback for the bug §4.4.1
        // documents — upstream never sets endlist and `is_recording` lies —
        // where `view.is_endlist()` will never become true on its own.
        if !is_recording && (view.is_endlist() || empty_window.all_empty()) {
            break;
        }

        if is_recording && !had_segments {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(PLAYLIST_UPDATE_PERIOD) => {}
            }
        }
    }

    bus.publish(Event::new(EventPayload::EndDownloading(
        EndDownloadingEvent {
            video_id,
            bytes_written: total_bytes,
        },
    )));

    sink.flush().await?;
    Ok(total_bytes)
}

/// Runs the live download loop for one channel, appending its segments to
/// `sink` in order. Returns the total number of bytes written.
pub async fn run_live(
    channel: String,
    mut view: PlaylistView,
    mut sink: impl AsyncWrite + Unpin,
    client: &reqwest::Client,
    fetch_options: &FetchOptions,
    bus: &EventBus,
    stop: tokio_util::sync::CancellationToken,
    live_period: Duration,
) -> Result<u64, Error> {
    bus.publish(Event::new(EventPayload::BeginDownloadingLive(
        BeginDownloadingLiveEvent {
            channel: channel.clone(),
        },
    )));

    let mut total_bytes = 0u64;
    let mut cursor = DownloadCursor::default();
    let mut use_cached_url = true;

    loop {
        if stop.is_cancelled() {
            break;
        }

        match view.refresh(use_cached_url).await {
            Ok(()) => {}
            Err(Error::SegmentGap { from, to }) => {
                bus.publish(Event::new(EventPayload::SegmentGap(SegmentGapEvent {
                    from,
                    to,
                })));
            }
            Err(e) => return Err(e),
        }
        use_cached_url = true;

        if view.is_endlist() {
            let marker = cursor.last_written.map(Marker::Sequence).unwrap_or(Marker::None);
            let remaining = view.segments_after(marker);
            if !remaining.is_empty() {
                let first_segment = remaining.first().map(|s| s.media_sequence);
                let base_total = total_bytes;
                let outcome = fetcher::download(
                    &remaining,
                    &mut sink,
                    view.base_uri(),
                    client,
                    fetch_options,
                    |seg, bytes_written_so_far| {
                        bus.publish(Event::new(EventPayload::DownloadedChunk(
                            DownloadedChunkEvent {
                                first_segment,
                                last_segment: Some(seg.media_sequence),
                                data_size: base_total + bytes_written_so_far,
                                complete_segment: Some(seg.media_sequence),
                                write_segment: Some(seg.media_sequence),
                            },
                        )));
                    },
                )
                .await;
                if let Some(seq) = outcome.last_marker {
                    total_bytes += outcome.bytes_written;
                    cursor.advance_to(seq);
                }
            }
            break;
        }

        let marker = cursor.last_written.map(Marker::Sequence).unwrap_or(Marker::None);
        let to_load = view.segments_after(marker);

        if to_load.is_empty() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(live_period) => {}
            }
            continue;
        }

        let first_segment = to_load.first().map(|s| s.media_sequence);
        let base_total = total_bytes;
        let outcome = fetcher::download(
            &to_load,
            &mut sink,
            view.base_uri(),
            client,
            fetch_options,
            |seg, bytes_written_so_far| {
                bus.publish(Event::new(EventPayload::DownloadedChunk(
                    DownloadedChunkEvent {
                        first_segment,
                        last_segment: Some(seg.media_sequence),
                        data_size: base_total + bytes_written_so_far,
                        complete_segment: Some(seg.media_sequence),
                        write_segment: Some(seg.media_sequence),
                    },
                )));
            },
        )
        .await;

        match outcome.last_marker {
            Some(seq) => {
                total_bytes += outcome.bytes_written;
                cursor.advance_to(seq);
            }
            None => {
                use_cached_url = false;
            }
        }
    }

    bus.publish(Event::new(EventPayload::EndDownloadingLive(
        EndDownloadingLiveEvent {
            channel,
            bytes_written: total_bytes,
        },
    )));

    sink.flush().await?;
    Ok(total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Subscriber};
    use crate::model::VideoInfo;
    use crate::playlist::PlaylistView;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::future::ready;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A minimal HTTP/1.1 server mapping fixed paths to canned responses,
    /// the same shape `fetcher`'s own tests use for segment bodies.
    async fn spawn_mock_server(routes: HashMap<&'static str, (u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let (status, body) = routes.get(path.as_str()).copied().unwrap_or((404, ""));
                    let reason = if status == 200 { "OK" } else { "ERR" };
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = tokio::io::AsyncWriteExt::write_all(&mut socket, response.as_bytes())
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    struct Recorder {
        kinds: std::sync::Mutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, event: Event) {
            self.kinds.lock().unwrap().push(event.kind());
        }
    }

    /// Scenario A (§8): a clean VOD capture whose playlist is already
    /// `endlist=true` and whose video is already finished recording.
    #[tokio::test]
    async fn scenario_a_clean_vod_capture() {
        let mut routes = HashMap::new();
        routes.insert(
            "/master.m3u8",
            (
                200,
                "#EXTM3U\n#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID=\"chunked\",NAME=\"source\"\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,VIDEO=\"chunked\"\nmedia.m3u8\n",
            ),
        );
        routes.insert(
            "/media.m3u8",
            (
                200,
                "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.0,\n0.ts\n#EXTINF:2.0,\n1.ts\n#EXTINF:2.0,\n2.ts\n#EXT-X-ENDLIST\n",
            ),
        );
        routes.insert("/0.ts", (200, "AAA"));
        routes.insert("/1.ts", (200, "BBB"));
        routes.insert("/2.ts", (200, "CCC"));
        let base = spawn_mock_server(routes).await;

        let variant_url = format!("{base}/master.m3u8");
        let variant_fetcher: crate::playlist::VariantFetcher = {
            let client = reqwest::Client::new();
            Arc::new(move || {
                let client = client.clone();
                let url = variant_url.clone();
                Box::pin(async move { Ok(client.get(url).send().await?.text().await?) })
            })
        };
        let media_fetcher: Arc<
            dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
                + Send
                + Sync,
        > = {
            let client = reqwest::Client::new();
            Arc::new(move |url: String| {
                let client = client.clone();
                Box::pin(async move { Ok(client.get(url).send().await?.text().await?) })
            })
        };
        let view = PlaylistView::new_vod("chunked", variant_fetcher, media_fetcher);

        let video_info_fetcher: VideoInfoFetcher = Arc::new(|| {
            Box::pin(ready(Ok(VideoInfo {
                id: "v1".into(),
                title: "t".into(),
                kind: crate::model::VideoType::Archive,
                channel_name: "foo".into(),
                created_at: Utc::now() - chrono::Duration::hours(2),
                duration_secs: 10,
                raw: serde_json::Value::Null,
            })))
        });

        let bus = EventBus::new();
        let recorder = Arc::new(Recorder {
            kinds: std::sync::Mutex::new(vec![]),
        });
        bus.subscribe(
            "rec",
            recorder.clone(),
            &[EventKind::DownloadEvent],
        );

        let client = reqwest::Client::new();
        let mut sink: Vec<u8> = Vec::new();
        let bytes_written = run_archive(
            "v1".into(),
            view,
            video_info_fetcher,
            &mut sink,
            &client,
            &FetchOptions::default(),
            &bus,
            DownloadCursor::default(),
            tokio_util::sync::CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(sink, b"AAABBBCCC");
        assert_eq!(bytes_written, 9);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let kinds = recorder.kinds.lock().unwrap().clone();
        assert_eq!(
            kinds,
            vec![
                EventKind::BeginDownloading,
                EventKind::PlaylistUpdated,
                EventKind::DownloadedChunk,
                EventKind::DownloadedChunk,
                EventKind::DownloadedChunk,
                EventKind::EndDownloading,
            ]
        );
    }

    #[test]
    fn empty_refresh_window_requires_full_capacity_of_false() {
        let mut w = EmptyRefreshWindow::new(3);
        assert!(!w.all_empty());
        w.push(false);
        w.push(false);
        assert!(!w.all_empty());
        w.push(false);
        assert!(w.all_empty());
        w.push(true);
        assert!(!w.all_empty());
    }

    #[test]
    fn empty_refresh_window_evicts_oldest_entries() {
        let mut w = EmptyRefreshWindow::new(2);
        w.push(true);
        w.push(false);
        w.push(false);
        assert!(w.all_empty());
    }
}
