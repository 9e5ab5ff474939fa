//! Segment Fetcher (C3): a concurrency-bounded downloader of ordered
//! segment URIs into a single append-only sink.
//!
//! Each segment retries at a fixed per-attempt delay per §4.3 (not
//! exponential backoff, which is reserved for rate-limit handling and
//! webhook subscribe retries elsewhere), with attempt counting driven by a
//! `CancellationToken` and transient-vs-permanent error classification;
//! scoped to one chunk at a time so a permanently failed segment can
//! cancel its still-retrying siblings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::Segment;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub per_segment_retries: u32,
    pub chunk_budget: Duration,
    pub retry_base_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        let concurrency = 10;
        Self {
            concurrency,
            per_segment_retries: 3,
            // Default chunk budget is 10x concurrency seconds.
            chunk_budget: Duration::from_secs(10 * concurrency as u64),
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Resolves a segment's `name` against the playlist's `base_uri`, using
/// `url::Url::join` rather than naive string concatenation, which
/// mishandles segments that are themselves absolute.
fn resolve_segment_url(base_uri: Option<&str>, name: &str) -> String {
    if name.starts_with("http") {
        return name.to_string();
    }
    match base_uri.and_then(|base| url::Url::parse(base).ok()) {
        Some(base) => base
            .join(name)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| name.to_string()),
        None => name.to_string(),
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    options: &FetchOptions,
    token: &CancellationToken,
) -> Result<Bytes, Error> {
    for attempt in 0..=options.per_segment_retries {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let attempt_result = client
            .get(url)
            .timeout(Duration::from_secs(60))
            .send()
            .await;
        match attempt_result {
            Ok(resp) if resp.status().is_success() => {
                return resp.bytes().await.map_err(Error::from);
            }
            Ok(resp) if resp.status().is_server_error() => {
                warn!(url, status = %resp.status(), attempt, "transient server error fetching segment");
            }
            Ok(resp) => {
                return Err(Error::PermanentApi {
                    status: resp.status().as_u16(),
                });
            }
            Err(e) if e.is_connect() || e.is_timeout() || e.is_body() || e.is_decode() => {
                warn!(url, attempt, error = %e, "transient network error fetching segment");
            }
            Err(e) => return Err(Error::from(e)),
        }

        if attempt >= options.per_segment_retries {
            return Err(Error::TransientNetwork(format!(
                "exhausted {} retries fetching {url}",
                options.per_segment_retries
            )));
        }
        // Fixed backoff, not exponential: the contract (§4.3) retries each
        // segment at a constant delay, leaving exponential/jittered backoff
        // to the places that actually call for it (rate-limit handling,
        // webhook subscribe retries).
        let delay = options.retry_base_delay;
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Err(Error::Cancelled)
}

/// Outcome of one `download` call: the media-sequence marker of the last
/// segment both downloaded and written (`None` if nothing was written yet),
/// and the exact number of bytes appended to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub last_marker: Option<u64>,
    pub bytes_written: u64,
}

/// Downloads `segments` into `sink` in order.
///
/// `base_uri` is joined onto each segment's relative name when present.
/// `on_written` is called once per segment successfully appended to `sink`,
/// with that segment and the cumulative bytes written so far within this
/// call — the hook the Download Manager uses to publish one `DownloadedChunk`
/// progress event per segment (§4.4 `progress_callback(ProgressData)`)
/// rather than one per `concurrency`-sized fetch batch.
pub async fn download<S>(
    segments: &[Segment],
    sink: &mut S,
    base_uri: Option<&str>,
    client: &reqwest::Client,
    options: &FetchOptions,
    mut on_written: impl FnMut(&Segment, u64),
) -> DownloadOutcome
where
    S: AsyncWrite + Unpin,
{
    let mut last_marker: Option<u64> = None;
    let mut bytes_written: u64 = 0;
    let concurrency = options.concurrency.max(1);

    for chunk in segments.chunks(concurrency) {
        let start = Instant::now();
        let token = CancellationToken::new();

        let urls: Vec<String> = chunk.iter().map(|s| resolve_segment_url(base_uri, &s.name)).collect();

        let mut handles = Vec::with_capacity(chunk.len());
        for url in urls {
            let client = client.clone();
            let options = options.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                fetch_one(&client, &url, &options, &token).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut saw_failure = false;
        for handle in handles {
            match handle.await {
                Ok(Ok(bytes)) => results.push(Some(bytes)),
                Ok(Err(e)) => {
                    if !saw_failure {
                        saw_failure = true;
                        token.cancel();
                    }
                    debug!(error = %e, "segment fetch failed");
                    results.push(None);
                }
                Err(join_err) => {
                    saw_failure = true;
                    token.cancel();
                    debug!(error = %join_err, "segment fetch task panicked or was aborted");
                    results.push(None);
                }
            }
        }

        if saw_failure {
            // Write whatever prefix of this chunk succeeded before the first
            // failure, in order, then stop: later segments in the chunk (even
            // if they happen to have downloaded successfully) are discarded
            // so the on-disk file never skips a media-sequence number.
            for (seg, result) in chunk.iter().zip(results.into_iter()) {
                match result {
                    Some(bytes) => {
                        if sink.write_all(&bytes).await.is_err() {
                            return DownloadOutcome { last_marker, bytes_written };
                        }
                        bytes_written += bytes.len() as u64;
                        last_marker = Some(seg.media_sequence);
                        on_written(seg, bytes_written);
                    }
                    None => break,
                }
            }
            return DownloadOutcome { last_marker, bytes_written };
        }

        for (seg, bytes) in chunk.iter().zip(results.into_iter()) {
            let bytes = bytes.expect("all results are Some when saw_failure is false");
            if sink.write_all(&bytes).await.is_err() {
                return DownloadOutcome { last_marker, bytes_written };
            }
            bytes_written += bytes.len() as u64;
            last_marker = Some(seg.media_sequence);
            on_written(seg, bytes_written);
        }

        if start.elapsed() >= options.chunk_budget {
            return DownloadOutcome { last_marker, bytes_written };
        }
    }

    DownloadOutcome { last_marker, bytes_written }
}
