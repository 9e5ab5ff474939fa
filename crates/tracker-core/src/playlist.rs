//! Playlist View (C2): wraps a variant + media playlist URL pair and yields
//! ordered new segments since a marker.
//!
//! `m3u8-rs` handles parsing; fetch/parse/refresh is instrumented with
//! `tracing`. Structured around a synchronous `segments_after(marker)`
//! contract rather than a scheduler-queue push model, since §4.2 requires a
//! pull API the Download Manager drives directly.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

use crate::error::Error;
use crate::model::{Marker, Rendition, Segment, VariantPlaylist};

/// Maximum number of live segments retained in the sliding-window buffer:
/// roughly 10 minutes of 2-second segments.
pub const MAX_LIVE_SEGMENTS: usize = 300;

/// Fetches the raw variant-playlist text for a download target (a video id
/// for VOD, a channel name for live). Supplied by the caller so the view
/// stays decoupled from the concrete API adapter.
pub type VariantFetcher =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>> + Send + Sync>;

fn parse_variant_playlist(text: &str) -> Result<(VariantPlaylist, String), Error> {
    match m3u8_rs::parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
            // Twitch's master playlist links each EXT-X-STREAM-INF entry to a
            // named quality (e.g. "chunked", "720p60") via its VIDEO
            // attribute, which is the GROUP-ID of the corresponding
            // EXT-X-MEDIA alternative; the stream-info line itself carries
            // no group_id field, so `video` is the one to match against.
            let renditions = master
                .variants
                .iter()
                .map(|v| Rendition {
                    group_id: v.video.clone().unwrap_or_else(|| v.uri.clone()),
                    uri: v.uri.clone(),
                })
                .collect();
            Ok((VariantPlaylist { renditions }, String::new()))
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(_)) => Err(Error::Playlist {
            reason: "expected a variant (master) playlist, got a media playlist".into(),
        }),
        Err(e) => Err(Error::Playlist {
            reason: format!("failed to parse variant playlist: {e}"),
        }),
    }
}

fn parse_media_playlist(text: &str) -> Result<(Vec<Segment>, bool, u64), Error> {
    match m3u8_rs::parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => {
            let segments = pl
                .segments
                .iter()
                .enumerate()
                .map(|(idx, s)| Segment {
                    name: s.uri.clone(),
                    media_sequence: pl.media_sequence + idx as u64,
                    duration_secs: s.duration as f64,
                })
                .collect();
            Ok((segments, pl.end_list, pl.media_sequence))
        }
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(Error::Playlist {
            reason: "expected a media playlist, got a variant (master) playlist".into(),
        }),
        Err(e) => Err(Error::Playlist {
            reason: format!("failed to parse media playlist: {e}"),
        }),
    }
}

enum Mode {
    Vod { segments: Vec<Segment> },
    Live { window: VecDeque<Segment> },
}

/// Wraps a variant + media playlist URL pair for one download target.
pub struct PlaylistView {
    quality: String,
    variant_fetcher: VariantFetcher,
    media_fetcher: Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>> + Send + Sync>,
    url: Option<String>,
    base_uri: Option<String>,
    live: bool,
    mode: Mode,
    end_list: bool,
}

impl PlaylistView {
    pub fn new_vod(
        quality: impl Into<String>,
        variant_fetcher: VariantFetcher,
        media_fetcher: Arc<
            dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
                + Send
                + Sync,
        >,
    ) -> Self {
        Self {
            quality: quality.into(),
            variant_fetcher,
            media_fetcher,
            url: None,
            base_uri: None,
            live: false,
            mode: Mode::Vod { segments: Vec::new() },
            end_list: false,
        }
    }

    pub fn new_live(
        quality: impl Into<String>,
        variant_fetcher: VariantFetcher,
        media_fetcher: Arc<
            dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
                + Send
                + Sync,
        >,
    ) -> Self {
        Self {
            quality: quality.into(),
            variant_fetcher,
            media_fetcher,
            url: None,
            base_uri: None,
            live: true,
            mode: Mode::Live {
                window: VecDeque::with_capacity(MAX_LIVE_SEGMENTS),
            },
            end_list: false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn base_uri(&self) -> Option<&str> {
        self.base_uri.as_deref()
    }

    pub fn is_endlist(&self) -> bool {
        self.end_list
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Resolves (or re-resolves when `use_cached_url` is false) the media
    /// playlist URL via the variant playlist, then fetches and folds in the
    /// current media playlist snapshot.
    ///
    /// Returns `Err(Error::SegmentGap { .. })` when, in live mode, the
    /// sliding window slipped past the last stored sequence; the caller
    /// should treat this as a permanent, non-fatal gap and keep going from
    /// the newly observed window.
    pub async fn refresh(&mut self, use_cached_url: bool) -> Result<(), Error> {
        if self.url.is_none() || !use_cached_url {
            let variant_text = (self.variant_fetcher)().await?;
            let (variant, _) = parse_variant_playlist(&variant_text)?;
            let rendition = variant.select(&self.quality)?;
            self.url = Some(rendition.uri.clone());
            self.base_uri = rendition.uri.rsplit_once('/').map(|(b, _)| format!("{b}/"));
        }

        let url = self.url.clone().ok_or_else(|| Error::Internal {
            reason: "playlist url not resolved".into(),
        })?;
        let media_text = (self.media_fetcher)(url).await?;
        let (fetched, end_list, _first_msn) = parse_media_playlist(&media_text)?;
        self.end_list = end_list;

        match &mut self.mode {
            Mode::Vod { segments } => {
                *segments = fetched;
                Ok(())
            }
            Mode::Live { window } => {
                if fetched.is_empty() {
                    return Ok(());
                }
                let last_stored = window.back().map(|s| s.media_sequence);
                let first_new = fetched.first().unwrap().media_sequence;

                let gap = match last_stored {
                    Some(last) if first_new > last + 1 => Some((last, first_new)),
                    _ => None,
                };

                for seg in fetched {
                    if last_stored.is_none_or(|last| seg.media_sequence > last) {
                        if window.len() >= MAX_LIVE_SEGMENTS {
                            window.pop_front();
                        }
                        window.push_back(seg);
                    }
                }

                if let Some((from, to)) = gap {
                    warn!(from, to, "live playlist window slipped");
                    return Err(Error::SegmentGap { from, to });
                }
                Ok(())
            }
        }
    }

    /// Returns entries strictly after `marker`, in increasing media-sequence
    /// order. `marker` may be a raw sequence number or a segment name, per
    /// §4.2; names are parsed via the `<n>[-muted].ts` convention.
    pub fn segments_after(&self, marker: Marker) -> Vec<Segment> {
        let after = marker.as_sequence();
        let all: &[Segment] = match &self.mode {
            Mode::Vod { segments } => segments,
            Mode::Live { window } => window.make_contiguous(),
        };
        match after {
            None => all.to_vec(),
            Some(n) => all
                .iter()
                .filter(|s| s.media_sequence > n)
                .cloned()
                .collect(),
        }
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;

    fn seg(n: u64) -> Segment {
        Segment {
            name: format!("{n}.ts"),
            media_sequence: n,
            duration_secs: 2.0,
        }
    }

    fn noop_variant_fetcher() -> VariantFetcher {
        Arc::new(|| Box::pin(ready(Ok("#EXTM3U\n".to_string()))))
    }

    #[test]
    fn segments_after_none_marker_returns_all() {
        let window: VecDeque<Segment> = vec![seg(1), seg(2), seg(3)].into();
        let view = PlaylistView {
            quality: "chunked".into(),
            variant_fetcher: noop_variant_fetcher(),
            media_fetcher: Arc::new(|_| Box::pin(ready(Ok(String::new())))),
            url: None,
            base_uri: None,
            live: true,
            mode: Mode::Live { window },
            end_list: false,
        };
        let got = view.segments_after(Marker::None);
        assert_eq!(got.iter().map(|s| s.media_sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn segments_after_marker_is_strictly_greater() {
        let window: VecDeque<Segment> = vec![seg(100), seg(101), seg(102)].into();
        let view = PlaylistView {
            quality: "chunked".into(),
            variant_fetcher: noop_variant_fetcher(),
            media_fetcher: Arc::new(|_| Box::pin(ready(Ok(String::new())))),
            url: None,
            base_uri: None,
            live: true,
            mode: Mode::Live { window },
            end_list: false,
        };
        let got = view.segments_after(Marker::Sequence(100));
        assert_eq!(got.iter().map(|s| s.media_sequence).collect::<Vec<_>>(), vec![101, 102]);
    }

    #[tokio::test]
    async fn live_refresh_detects_window_slip() {
        let media = Arc::new(std::sync::Mutex::new(0u32));
        let media_for_closure = media.clone();
        let media_fetcher: Arc<
            dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
                + Send
                + Sync,
        > = Arc::new(move |_url: String| {
            let mut n = media_for_closure.lock().unwrap();
            *n += 1;
            let text = if *n == 1 {
                "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:100\n#EXTINF:2.0,\n100.ts\n#EXTINF:2.0,\n101.ts\n"
            } else {
                "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:200\n#EXTINF:2.0,\n200.ts\n#EXTINF:2.0,\n201.ts\n"
            };
            Box::pin(ready(Ok(text.to_string())))
        });

        let mut view = PlaylistView {
            quality: "chunked".into(),
            variant_fetcher: noop_variant_fetcher(),
            media_fetcher,
            url: Some("https://example.com/media.m3u8".into()),
            base_uri: None,
            live: true,
            mode: Mode::Live {
                window: VecDeque::new(),
            },
            end_list: false,
        };

        view.refresh(true).await.unwrap();
        let first = view.segments_after(Marker::None);
        assert_eq!(first.iter().map(|s| s.media_sequence).collect::<Vec<_>>(), vec![100, 101]);

        let err = view.refresh(true).await.unwrap_err();
        match err {
            Error::SegmentGap { from, to } => {
                assert_eq!(from, 101);
                assert_eq!(to, 200);
            }
            other => panic!("expected SegmentGap, got {other:?}"),
        }

        let after_gap = view.segments_after(Marker::Sequence(101));
        assert_eq!(
            after_gap.iter().map(|s| s.media_sequence).collect::<Vec<_>>(),
            vec![200, 201]
        );
    }

    #[tokio::test]
    async fn endlist_playlist_returns_nothing_new_forever() {
        let media_fetcher: Arc<
            dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send>>
                + Send
                + Sync,
        > = Arc::new(|_url: String| {
            Box::pin(ready(Ok(
                "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.0,\n0.ts\n#EXT-X-ENDLIST\n".to_string(),
            )))
        });
        let mut view = PlaylistView {
            quality: "chunked".into(),
            variant_fetcher: noop_variant_fetcher(),
            media_fetcher,
            url: Some("https://example.com/media.m3u8".into()),
            base_uri: None,
            live: false,
            mode: Mode::Vod { segments: Vec::new() },
            end_list: false,
        };
        view.refresh(true).await.unwrap();
        assert!(view.is_endlist());
        let last = view.segments_after(Marker::Sequence(0));
        assert!(last.is_empty());
        view.refresh(true).await.unwrap();
        let last = view.segments_after(Marker::Sequence(0));
        assert!(last.is_empty());
    }

    #[test]
    fn marker_from_name_strips_muted_and_suffix() {
        let m = Marker::from_name("42-muted.ts").unwrap();
        assert_eq!(m.as_sequence(), Some(42));
    }
}
