//! Plain immutable value types for the data model in §3.
//!
//! Plain structs throughout; derived quantities (`is_recording`) are pure
//! functions over their fields rather than cached state.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A case-folded channel name paired with the upstream's opaque user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    pub id: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            id: id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A snapshot of one live broadcast.
///
/// Two values are equal iff every field below matches; the raw payload is
/// intentionally excluded from the comparison so that upstream noise in the
/// raw JSON (ad breaks, tag churn) doesn't defeat the tracker's suppression
/// logic.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub channel_name: String,
    pub channel_id: String,
    pub game_name: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub raw: Value,
}

impl PartialEq for StreamInfo {
    fn eq(&self, other: &Self) -> bool {
        self.channel_name == other.channel_name
            && self.channel_id == other.channel_id
            && self.game_name == other.game_name
            && self.title == other.title
            && self.started_at == other.started_at
    }
}
impl Eq for StreamInfo {}

/// The type of a recorded/recording broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoType {
    Archive,
    Highlight,
    Upload,
}

/// A recorded or recording broadcast.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub kind: VideoType,
    pub channel_name: String,
    pub created_at: DateTime<Utc>,
    /// Parsed duration in whole seconds.
    pub duration_secs: u64,
    pub raw: Value,
}

impl VideoInfo {
    /// Whether this broadcast is still recording, given the current time.
    ///
    /// True when less than 5 minutes have elapsed since the reported end
    /// (`created_at + duration`). The upstream's own `status` field is known
    /// to lie (stay "recording" long after the stream ends), so this is
    /// computed purely from timestamps, never trusted from the raw payload.
    pub fn is_recording(&self, now: DateTime<Utc>) -> bool {
        let ended_at = self.created_at + chrono::Duration::seconds(self.duration_secs as i64);
        now - ended_at < chrono::Duration::minutes(5)
    }
}

/// One rendition entry of a variant playlist.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub group_id: String,
    pub uri: String,
}

/// A variant playlist: a playlist of playlists, one entry per rendition.
#[derive(Debug, Clone, Default)]
pub struct VariantPlaylist {
    pub renditions: Vec<Rendition>,
}

impl VariantPlaylist {
    /// Selects the rendition whose `group_id` matches `quality` exactly.
    pub fn select(&self, quality: &str) -> Result<&Rendition, crate::error::Error> {
        self.renditions
            .iter()
            .find(|r| r.group_id == quality)
            .ok_or_else(|| {
                crate::error::Error::unknown_quality(
                    quality,
                    self.renditions.iter().map(|r| r.group_id.clone()).collect(),
                )
            })
    }
}

/// One entry of a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// URI relative to the playlist's base, e.g. `1234-muted.ts`.
    pub name: String,
    /// Monotone sequence number within the live window (or VOD index).
    pub media_sequence: u64,
    pub duration_secs: f64,
}

/// Recovers the numeric media-sequence prefix encoded in an HLS segment
/// name following the `<n>[-muted].ts` convention.
pub fn parse_segment_number(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".ts")?;
    let stem = stem.strip_suffix("-muted").unwrap_or(stem);
    stem.parse::<u64>().ok()
}

/// Either marker form accepted by `PlaylistView::segments_after`.
#[derive(Debug, Clone, Copy)]
pub enum Marker {
    Sequence(u64),
    None,
}

impl Marker {
    pub fn from_name(name: &str) -> Option<Self> {
        parse_segment_number(name).map(Marker::Sequence)
    }

    pub fn as_sequence(&self) -> Option<u64> {
        match self {
            Marker::Sequence(n) => Some(*n),
            Marker::None => None,
        }
    }
}

/// The download progress cursor for one session.
///
/// VOD: the last successfully written segment index. Live: the pair of
/// (first media sequence seen, last media sequence written).
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadCursor {
    pub first_seen: Option<u64>,
    pub last_written: Option<u64>,
}

impl DownloadCursor {
    pub fn advance_to(&mut self, seq: u64) {
        if self.first_seen.is_none() {
            self.first_seen = Some(seq);
        }
        self.last_written = Some(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_muted_segment_names() {
        assert_eq!(parse_segment_number("1234.ts"), Some(1234));
        assert_eq!(parse_segment_number("1234-muted.ts"), Some(1234));
        assert_eq!(parse_segment_number("not-a-number.ts"), None);
        assert_eq!(parse_segment_number("1234.mp4"), None);
    }

    #[test]
    fn stream_info_equality_ignores_raw_payload() {
        let base = StreamInfo {
            channel_name: "foo".into(),
            channel_id: "1".into(),
            game_name: "Just Chatting".into(),
            title: "hello".into(),
            started_at: Utc::now(),
            raw: serde_json::json!({"a": 1}),
        };
        let mut other = base.clone();
        other.raw = serde_json::json!({"a": 2});
        assert_eq!(base, other);
    }

    #[test]
    fn variant_playlist_unknown_quality_lists_observed() {
        let vp = VariantPlaylist {
            renditions: vec![
                Rendition { group_id: "720p60".into(), uri: "a".into() },
                Rendition { group_id: "480p30".into(), uri: "b".into() },
            ],
        };
        let err = vp.select("chunked").unwrap_err();
        match err {
            crate::error::Error::UnknownQuality { expected, observed } => {
                assert_eq!(expected, "chunked");
                assert_eq!(observed, vec!["720p60".to_string(), "480p30".to_string()]);
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn is_recording_true_within_five_minutes_of_reported_end() {
        let now = Utc::now();
        let video = VideoInfo {
            id: "1".into(),
            title: "t".into(),
            kind: VideoType::Archive,
            channel_name: "foo".into(),
            created_at: now - chrono::Duration::minutes(10),
            duration_secs: 9 * 60,
            raw: Value::Null,
        };
        assert!(video.is_recording(now));
        let video2 = VideoInfo {
            duration_secs: 4 * 60,
            ..video
        };
        assert!(!video2.is_recording(now));
    }
}
