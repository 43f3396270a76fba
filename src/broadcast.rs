use crate::frame::Frame;
use crate::subscribers::{StreamVariant, SubscriberRegistry};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Boundary string shared by all multipart streams served by the hub
pub const STREAM_BOUNDARY: &str = "camcastframe";

/// Pushes frames to every subscriber of a stream variant.
///
/// Each frame is wrapped in the multipart framing before delivery:
/// `--<boundary>\r\ncontent-type: ...\r\ncontent-length: <n>\r\n\r\n<bytes>\r\n`.
/// A subscriber whose channel has gone away is removed from the registry on
/// the spot, so one broken consumer never blocks or crashes delivery to the
/// others.
pub struct FrameBroadcaster {
    registry: Arc<SubscriberRegistry>,
    stats: BroadcastStats,
}

/// Counters for broadcast monitoring
#[derive(Debug, Default)]
pub struct BroadcastStats {
    /// Frames handed to the broadcaster
    pub frames_broadcast: AtomicU64,
    /// Bytes written across all subscribers
    pub bytes_broadcast: AtomicU64,
    /// Sends that failed because the subscriber was gone
    pub send_failures: AtomicU64,
    /// Subscribers removed after a failed send
    pub subscribers_dropped: AtomicU64,
}

/// Point-in-time copy of the broadcast counters
#[derive(Debug, Clone)]
pub struct BroadcastStatsSnapshot {
    pub frames_broadcast: u64,
    pub bytes_broadcast: u64,
    pub send_failures: u64,
    pub subscribers_dropped: u64,
}

impl BroadcastStats {
    pub fn snapshot(&self) -> BroadcastStatsSnapshot {
        BroadcastStatsSnapshot {
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            bytes_broadcast: self.bytes_broadcast.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
        }
    }
}

impl FrameBroadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            registry,
            stats: BroadcastStats::default(),
        }
    }

    /// Register a new subscriber and hand back its receiving end. The
    /// channel is bounded; a consumer that stops reading is dropped once
    /// its queue fills and a send fails.
    pub fn subscribe(
        &self,
        variant: StreamVariant,
        queue_size: usize,
    ) -> (Uuid, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let id = Uuid::new_v4();
        self.registry.add(variant, id, tx);
        (id, rx)
    }

    /// Explicit unsubscribe; also happens implicitly when a send fails
    pub fn unsubscribe(&self, variant: StreamVariant, id: Uuid) {
        self.registry.remove(variant, id);
    }

    /// The one-time response header set sent when a subscriber first joins
    /// a multipart stream. Applied by the HTTP layer; CORS headers are
    /// added there as well.
    pub fn stream_headers() -> [(&'static str, String); 3] {
        [
            (
                "content-type",
                format!("multipart/x-mixed-replace; boundary={}", STREAM_BOUNDARY),
            ),
            ("cache-control", "no-cache".to_string()),
            ("connection", "close".to_string()),
        ]
    }

    /// Wrap a frame in its multipart part framing
    pub fn frame_part(frame: &Frame) -> Bytes {
        let header = format!(
            "--{}\r\ncontent-type: {}\r\ncontent-length: {}\r\n\r\n",
            STREAM_BOUNDARY,
            frame.content_type,
            frame.len()
        );
        let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
        part.put_slice(header.as_bytes());
        part.put_slice(&frame.data);
        part.put_slice(b"\r\n");
        part.freeze()
    }

    /// Deliver one frame to every subscriber of the variant, in publish
    /// order. Subscribers whose connection has failed are removed; the
    /// remaining subscribers are unaffected.
    pub fn broadcast_frame(&self, variant: StreamVariant, frame: &Frame) {
        if self.registry.is_empty(variant) {
            return;
        }
        let part = Self::frame_part(frame);
        let mut dead = Vec::new();

        self.registry.for_each(variant, |id, sender| {
            match sender.try_send(part.clone()) {
                Ok(()) => {
                    self.stats
                        .bytes_broadcast
                        .fetch_add(part.len() as u64, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Consumer is not keeping up; drop it rather than let it
                    // stall delivery to everyone else
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Subscriber {} on {} stream cannot keep up, dropping it",
                        id,
                        variant.as_str()
                    );
                    dead.push(id);
                }
            }
        });

        for id in dead {
            self.registry.remove(variant, id);
            self.stats.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Broadcast {} byte frame to {} stream",
            frame.len(),
            variant.as_str()
        );
    }

    /// Queue a single frame to one subscriber, used to prime snapshot
    /// streams with the current frame at join time
    pub fn prime_subscriber(&self, variant: StreamVariant, id: Uuid, frame: &Frame) {
        if frame.is_empty() {
            debug!("No snapshot available yet, not priming subscriber {}", id);
            return;
        }
        let part = Self::frame_part(frame);
        self.registry.for_each(variant, |sub_id, sender| {
            if sub_id == id {
                let _ = sender.try_send(part.clone());
            }
        });
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BroadcastStatsSnapshot {
        self.stats.snapshot()
    }
}
