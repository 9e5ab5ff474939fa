//! A concrete `StorageFinalizer`/`ErrorSink` pair (§4.7, §9 open question 3):
//! moves the completed temp file into an output directory named after the
//! channel, and leaves failed downloads in place for manual inspection.
//!
//! The facade's contract only names what it hands off, not how storage is
//! organized; this is one reasonable binding of that contract for a
//! standalone binary: a thin path-based sink, no database bookkeeping.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{error, info, warn};

use stream_tracker::facade::{ErrorSink, FinalizedBroadcast, StorageFinalizer};
use tracker_core::error::Error;

pub struct FileStorageFinalizer {
    output_dir: PathBuf,
}

impl FileStorageFinalizer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn destination(&self, channel: &str, started_at_unix: i64) -> PathBuf {
        self.output_dir
            .join(channel)
            .join(format!("{channel}-{started_at_unix}.ts"))
    }
}

#[async_trait]
impl StorageFinalizer for FileStorageFinalizer {
    async fn finalize(&self, broadcast: FinalizedBroadcast, temp_path: PathBuf) {
        let (channel, started_at_unix) = match &broadcast {
            FinalizedBroadcast::Vod(video) => (video.channel_name.clone(), video.created_at.timestamp()),
            FinalizedBroadcast::Live {
                channel,
                started_at,
                ..
            } => (channel.clone(), started_at.timestamp()),
        };

        let dest = self.destination(&channel, started_at_unix);
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(channel, error = %e, "failed to create output directory, leaving capture in place");
                return;
            }
        }

        match tokio::fs::rename(&temp_path, &dest).await {
            Ok(()) => info!(channel, path = %dest.display(), "capture finalized"),
            Err(e) => {
                warn!(channel, error = %e, "rename across filesystems failed, falling back to copy");
                if let Err(e) = tokio::fs::copy(&temp_path, &dest).await {
                    error!(channel, error = %e, "failed to finalize capture");
                } else {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }
            }
        }
    }
}

pub struct LoggingErrorSink;

#[async_trait]
impl ErrorSink for LoggingErrorSink {
    async fn record_failure(&self, temp_path: PathBuf, error: Error) {
        error!(
            path = %temp_path.display(),
            error = %error,
            retryable = error.is_retryable(),
            "download failed, file left on disk for inspection"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_nests_under_channel_directory() {
        let finalizer = FileStorageFinalizer::new("/tmp/out");
        let dest = finalizer.destination("someone", 1_700_000_000);
        assert_eq!(
            dest,
            PathBuf::from("/tmp/out/someone/someone-1700000000.ts")
        );
    }
}
