//! The in-process event bus (C1): a typed publish/subscribe fabric that
//! routes events to subscribers by event class hierarchy, with ordered
//! per-subscriber delivery and isolated subscriber failure.
//!
//! A generic subscribe-by-type registry keyed by a flat `EventKind` enum
//! that encodes the (bounded, depth <= 2) ancestor walk directly, rather
//! than walking a real type tree at runtime.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Routing key. Concrete variants are leaves; the `*Event` variants are the
/// non-root category ancestors every leaf routes through (tree depth <= 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StreamOnline,
    StreamOffline,
    StreamChanged,
    BeginDownloading,
    EndDownloading,
    BeginDownloadingLive,
    EndDownloadingLive,
    PlaylistUpdated,
    DownloadedChunk,
    SegmentGap,
    AwaitingStream,
    Exception,
    // categories
    StreamEvent,
    DownloadEvent,
    SystemEvent,
}

impl EventKind {
    /// Ancestors of this concrete kind, most-specific first, root excluded.
    fn ancestors_of(concrete: EventKind) -> &'static [EventKind] {
        use EventKind::*;
        match concrete {
            StreamOnline => &[StreamOnline, StreamEvent],
            StreamOffline => &[StreamOffline, StreamEvent],
            StreamChanged => &[StreamChanged, StreamEvent],
            BeginDownloading => &[BeginDownloading, DownloadEvent],
            EndDownloading => &[EndDownloading, DownloadEvent],
            BeginDownloadingLive => &[BeginDownloadingLive, DownloadEvent],
            EndDownloadingLive => &[EndDownloadingLive, DownloadEvent],
            PlaylistUpdated => &[PlaylistUpdated, DownloadEvent],
            DownloadedChunk => &[DownloadedChunk, DownloadEvent],
            SegmentGap => &[SegmentGap, DownloadEvent],
            AwaitingStream => &[AwaitingStream, SystemEvent],
            Exception => &[Exception, SystemEvent],
            // categories have no further ancestor beyond the implicit root
            StreamEvent => &[StreamEvent],
            DownloadEvent => &[DownloadEvent],
            SystemEvent => &[SystemEvent],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOnlineEvent {
    pub channel: String,
    pub channel_id: String,
    pub stream: crate::model::StreamInfo,
}

#[derive(Debug, Clone)]
pub struct StreamOfflineEvent {
    pub channel: String,
    pub channel_id: String,
}

#[derive(Debug, Clone)]
pub struct StreamChangedEvent {
    pub channel: String,
    pub channel_id: String,
    pub stream: crate::model::StreamInfo,
}

#[derive(Debug, Clone)]
pub struct BeginDownloadingEvent {
    pub video_id: String,
}

#[derive(Debug, Clone)]
pub struct EndDownloadingEvent {
    pub video_id: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct BeginDownloadingLiveEvent {
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct EndDownloadingLiveEvent {
    pub channel: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct PlaylistUpdatedEvent {
    pub total: usize,
    pub to_load: usize,
}

#[derive(Debug, Clone)]
pub struct DownloadedChunkEvent {
    pub first_segment: Option<u64>,
    pub last_segment: Option<u64>,
    pub data_size: u64,
    pub complete_segment: Option<u64>,
    pub write_segment: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SegmentGapEvent {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone)]
pub struct AwaitingStreamEvent {
    pub channel: String,
    pub sleep_time_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub message: String,
}

/// An immutable record with a timestamp fixed at construction.
#[derive(Debug, Clone)]
pub struct Event {
    pub emitted_at: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    StreamOnline(StreamOnlineEvent),
    StreamOffline(StreamOfflineEvent),
    StreamChanged(StreamChangedEvent),
    BeginDownloading(BeginDownloadingEvent),
    EndDownloading(EndDownloadingEvent),
    BeginDownloadingLive(BeginDownloadingLiveEvent),
    EndDownloadingLive(EndDownloadingLiveEvent),
    PlaylistUpdated(PlaylistUpdatedEvent),
    DownloadedChunk(DownloadedChunkEvent),
    SegmentGap(SegmentGapEvent),
    AwaitingStream(AwaitingStreamEvent),
    Exception(ExceptionEvent),
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            emitted_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::StreamOnline(_) => EventKind::StreamOnline,
            EventPayload::StreamOffline(_) => EventKind::StreamOffline,
            EventPayload::StreamChanged(_) => EventKind::StreamChanged,
            EventPayload::BeginDownloading(_) => EventKind::BeginDownloading,
            EventPayload::EndDownloading(_) => EventKind::EndDownloading,
            EventPayload::BeginDownloadingLive(_) => EventKind::BeginDownloadingLive,
            EventPayload::EndDownloadingLive(_) => EventKind::EndDownloadingLive,
            EventPayload::PlaylistUpdated(_) => EventKind::PlaylistUpdated,
            EventPayload::DownloadedChunk(_) => EventKind::DownloadedChunk,
            EventPayload::SegmentGap(_) => EventKind::SegmentGap,
            EventPayload::AwaitingStream(_) => EventKind::AwaitingStream,
            EventPayload::Exception(_) => EventKind::Exception,
        }
    }

    fn ancestor_kinds(&self) -> &'static [EventKind] {
        EventKind::ancestors_of(self.kind())
    }
}

/// Implemented by anything that wants to receive events from the bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, event: Event);
}

struct SubscriberSlot {
    id: String,
    tx: mpsc::UnboundedSender<Event>,
}

/// The bus itself. Cheaply cloneable; all instances share the same
/// subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<HashMap<EventKind, Vec<SubscriberSlot>>>>,
    // Keeps the per-subscriber consumer task's sender alive across multiple
    // `subscribe` calls with different kinds for the same subscriber id, so
    // all of a subscriber's deliveries flow through one ordered queue.
    queues: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscriber` under `id` for each of `kinds`. Calling this
    /// again with the same `id` for additional kinds adds more routing
    /// entries without starting a second consumer loop; if `id` is
    /// registered under two ancestors of one concrete event, that event is
    /// delivered twice, per the routing rule in §4.1.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        kinds: &[EventKind],
    ) {
        let id = id.into();
        let tx = {
            let mut queues = self.queues.write();
            queues
                .entry(id.clone())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    spawn_consumer(id.clone(), subscriber, rx);
                    tx
                })
                .clone()
        };

        let mut inner = self.inner.write();
        for &kind in kinds {
            inner.entry(kind).or_default().push(SubscriberSlot {
                id: id.clone(),
                tx: tx.clone(),
            });
        }
    }

    /// Removes `id`'s registration for each of `kinds`. An `id` with no
    /// remaining registrations still has its consumer task drained and
    /// dropped once its channel closes.
    pub fn unsubscribe(&self, id: &str, kinds: &[EventKind]) {
        let mut inner = self.inner.write();
        for kind in kinds {
            if let Some(slots) = inner.get_mut(kind) {
                slots.retain(|s| s.id != id);
            }
        }
    }

    /// Schedules delivery of `event` to every subscriber registered for any
    /// ancestor kind of `event`, in registration order, and returns once
    /// scheduling (not delivery) is complete. Per-subscriber delivery is
    /// FIFO; there is no ordering guarantee across distinct subscribers.
    pub fn publish(&self, event: Event) {
        let kinds = event.ancestor_kinds();
        let inner = self.inner.read();
        for kind in kinds {
            if let Some(slots) = inner.get(kind) {
                for slot in slots {
                    if slot.tx.send(event.clone()).is_err() {
                        warn!(subscriber = %slot.id, "subscriber queue closed, dropping event");
                    }
                }
            }
        }
    }
}

fn spawn_consumer(
    id: String,
    subscriber: Arc<dyn Subscriber>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let kind = event.kind();
            let subscriber = Arc::clone(&subscriber);
            // Each delivery runs as its own task so a panicking handler
            // can't wedge this consumer loop; awaiting it before pulling the
            // next event preserves FIFO order for this subscriber.
            let outcome = AssertUnwindSafe(async move { subscriber.handle(event).await })
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(subscriber = %id, event = ?kind, "subscriber panicked while handling event");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, event: Event) {
            self.seen.lock().await.push(event.kind());
        }
    }

    struct Panicky;

    #[async_trait]
    impl Subscriber for Panicky {
        async fn handle(&self, _event: Event) {
            panic!("boom");
        }
    }

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Subscriber for Counter {
        async fn handle(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn delivers_to_subscriber_registered_on_concrete_kind() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(vec![]) });
        bus.subscribe("r1", recorder.clone(), &[EventKind::StreamOnline]);
        bus.publish(Event::new(EventPayload::StreamOnline(StreamOnlineEvent {
            channel: "foo".into(),
            channel_id: "1".into(),
            stream: dummy_stream(),
        })));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*recorder.seen.lock().await, vec![EventKind::StreamOnline]);
    }

    #[tokio::test]
    async fn double_registration_on_ancestor_delivers_twice() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe("c1", counter.clone(), &[EventKind::StreamOnline]);
        bus.subscribe("c1", counter.clone(), &[EventKind::StreamEvent]);
        bus.publish(Event::new(EventPayload::StreamOnline(StreamOnlineEvent {
            channel: "foo".into(),
            channel_id: "1".into(),
            stream: dummy_stream(),
        })));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_then_publish_delivers_nothing() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe("c1", counter.clone(), &[EventKind::StreamOnline]);
        bus.unsubscribe("c1", &[EventKind::StreamOnline]);
        bus.publish(Event::new(EventPayload::StreamOnline(StreamOnlineEvent {
            channel: "foo".into(),
            channel_id: "1".into(),
            stream: dummy_stream(),
        })));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_panicking_subscriber_does_not_block_later_events_to_it() {
        let bus = EventBus::new();
        bus.subscribe("p1", Arc::new(Panicky), &[EventKind::Exception]);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe("c1", counter.clone(), &[EventKind::Exception]);
        for _ in 0..3 {
            bus.publish(Event::new(EventPayload::Exception(ExceptionEvent {
                message: "x".into(),
            })));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fifo_per_subscriber_preserves_publish_order() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(vec![]) });
        bus.subscribe(
            "r1",
            recorder.clone(),
            &[EventKind::BeginDownloading, EventKind::EndDownloading],
        );
        bus.publish(Event::new(EventPayload::BeginDownloading(BeginDownloadingEvent {
            video_id: "1".into(),
        })));
        bus.publish(Event::new(EventPayload::EndDownloading(EndDownloadingEvent {
            video_id: "1".into(),
            bytes_written: 10,
        })));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(
            *recorder.seen.lock().await,
            vec![EventKind::BeginDownloading, EventKind::EndDownloading]
        );
    }

    fn dummy_stream() -> crate::model::StreamInfo {
        crate::model::StreamInfo {
            channel_name: "foo".into(),
            channel_id: "1".into(),
            game_name: "g".into(),
            title: "t".into(),
            started_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }
}
