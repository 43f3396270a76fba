use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of tracked connections above which the sweeper starts warning
const OPEN_CONNECTION_WARN_THRESHOLD: usize = 10;

/// Handle to one upstream connection. Cloneable; closing any clone closes
/// them all. Liveness is signalled through a cancellation token so the
/// owning task can observe the close without polling.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    /// Token for tasks that want to await the close
    pub fn closed_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct TrackedConnection {
    handle: ConnectionHandle,
    /// Cached body of the last small non-binary reply on this URL
    reply: String,
}

/// Maps outstanding upstream request URLs to their connections.
///
/// Upstream sources keep many short-lived and a few long-lived (alarm)
/// connections open at once; abandoned entries are the main resource leak
/// risk, so `sweep` runs periodically and drops anything that is closed
/// and holds no cached reply still waiting to be read.
pub struct ConnectionTracker {
    inner: Mutex<HashMap<String, TrackedConnection>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Track a connection under its request URL. At most one entry exists
    /// per URL: re-tracking a URL whose entry still holds a cached reply
    /// keeps the reply and swaps in the new connection.
    pub fn track(&self, url: impl Into<String>, handle: ConnectionHandle) {
        let url = url.into();
        let mut inner = self.inner.lock();
        match inner.get_mut(&url) {
            Some(existing) if !existing.reply.is_empty() => {
                existing.handle = handle;
            }
            _ => {
                inner.insert(
                    url,
                    TrackedConnection {
                        handle,
                        reply: String::new(),
                    },
                );
            }
        }
    }

    /// The connection currently tracked for a URL, if any
    pub fn lookup(&self, url: &str) -> Option<ConnectionHandle> {
        self.inner.lock().get(url).map(|conn| conn.handle.clone())
    }

    /// Cache a small reply body against the URL so it survives until read
    pub fn store_reply(&self, url: &str, body: impl Into<String>) {
        if let Some(conn) = self.inner.lock().get_mut(url) {
            conn.reply = body.into();
        }
    }

    /// Take the cached reply for a URL, clearing it
    pub fn take_reply(&self, url: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.get_mut(url).and_then(|conn| {
            if conn.reply.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut conn.reply))
            }
        })
    }

    /// Explicit disconnect: close the connection and forget the entry now
    pub fn close(&self, url: &str) {
        if let Some(conn) = self.inner.lock().remove(url) {
            conn.handle.close();
            debug!("Closed tracked connection for {}", url);
        }
    }

    /// Drop every entry whose transport is closed and whose cached reply is
    /// empty. Entries with a pending reply are kept so data still being
    /// read is not discarded. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|url, conn| {
            let keep = conn.handle.is_open() || !conn.reply.is_empty();
            if !keep {
                debug!("Sweeping stale connection for {}", url);
            }
            keep
        });
        let removed = before - inner.len();
        if inner.len() > OPEN_CONNECTION_WARN_THRESHOLD {
            warn!("There are {} open connections being tracked", inner.len());
        }
        removed
    }

    /// Close every tracked connection and clear the map
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        for conn in inner.values() {
            conn.handle.close();
        }
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
