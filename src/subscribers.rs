use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// The stream variants a consumer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamVariant {
    /// Live MJPEG passed straight through from the camera stream
    Raw,
    /// Snapshots re-framed as MJPEG at the snapshot poll cadence
    SnapshotPoll,
    /// Snapshot stream that runs at full rate only while motion is active
    AutoFps,
}

impl StreamVariant {
    pub const ALL: [StreamVariant; 3] = [
        StreamVariant::Raw,
        StreamVariant::SnapshotPoll,
        StreamVariant::AutoFps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamVariant::Raw => "raw",
            StreamVariant::SnapshotPoll => "snapshot_poll",
            StreamVariant::AutoFps => "auto_fps",
        }
    }
}

/// Tracks the set of open consumer connections per stream variant.
///
/// All operations are safe to call concurrently from the polling tasks and
/// from connection-accept tasks; the registry carries its own lock. Note
/// the registry only tracks membership — when the last subscriber of a
/// variant is removed, the poll loop observes `is_empty` on its next tick
/// and halts the associated activity itself.
pub struct SubscriberRegistry {
    inner: RwLock<HashMap<StreamVariant, HashMap<Uuid, mpsc::Sender<Bytes>>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber's outbound channel under the given variant
    pub fn add(&self, variant: StreamVariant, id: Uuid, sender: mpsc::Sender<Bytes>) {
        let mut inner = self.inner.write();
        inner.entry(variant).or_default().insert(id, sender);
        debug!("Subscriber {} joined {} stream", id, variant.as_str());
    }

    /// Remove a subscriber. Removing an unknown handle is a no-op.
    pub fn remove(&self, variant: StreamVariant, id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(subs) = inner.get_mut(&variant) {
            if subs.remove(&id).is_some() {
                debug!("Subscriber {} left {} stream", id, variant.as_str());
            }
        }
    }

    /// True when no consumer is subscribed to the variant
    pub fn is_empty(&self, variant: StreamVariant) -> bool {
        self.inner
            .read()
            .get(&variant)
            .map(|subs| subs.is_empty())
            .unwrap_or(true)
    }

    /// Number of subscribers on one variant
    pub fn count(&self, variant: StreamVariant) -> usize {
        self.inner
            .read()
            .get(&variant)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Total subscribers across all variants
    pub fn total(&self) -> usize {
        self.inner.read().values().map(|subs| subs.len()).sum()
    }

    /// Visit every subscriber of a variant. The callback must not block;
    /// sends through the registered channels are non-blocking `try_send`s.
    pub fn for_each<F>(&self, variant: StreamVariant, mut visit: F)
    where
        F: FnMut(Uuid, &mpsc::Sender<Bytes>),
    {
        let inner = self.inner.read();
        if let Some(subs) = inner.get(&variant) {
            trace!("Visiting {} subscribers of {}", subs.len(), variant.as_str());
            for (id, sender) in subs {
                visit(*id, sender);
            }
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
