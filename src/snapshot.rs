use crate::frame::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

/// Latest-frame holder plus a bounded FIFO ring of prior frames.
///
/// The ring keeps `capacity` frames (preroll seconds + record seconds at one
/// frame per second) so a retroactive clip can include the moments before a
/// trigger. A capacity of 0 disables the ring; only the current frame is
/// kept. All access goes through a single mutex, so a reader always
/// observes a complete frame, never a half-written one.
pub struct SnapshotStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    current: Frame,
    ring: VecDeque<Frame>,
}

impl SnapshotStore {
    /// Create a store with the given ring capacity (0 disables the ring)
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: Frame::empty(),
                ring: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Replace the current frame and, if the ring is enabled, append it,
    /// evicting the oldest entry once capacity is exceeded.
    pub fn publish(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        if self.capacity > 0 {
            inner.ring.push_back(frame.clone());
            if inner.ring.len() > self.capacity {
                inner.ring.pop_front();
            }
        }
        inner.current = frame;
        trace!("Published snapshot, ring holds {} frames", inner.ring.len());
    }

    /// The most recently published frame. Before the first publish this is
    /// the zero-length placeholder, never an error.
    pub fn current(&self) -> Frame {
        self.inner.lock().current.clone()
    }

    /// Ordered copy of the ring, oldest first. Does not clear the ring.
    pub fn drain_ring(&self) -> Vec<Frame> {
        self.inner.lock().ring.iter().cloned().collect()
    }

    /// Number of frames currently held in the ring
    pub fn ring_len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Configured ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True until the first frame has been published
    pub fn is_unpublished(&self) -> bool {
        self.inner.lock().current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(tag: u8) -> Frame {
        Frame::jpeg(vec![tag; 8])
    }

    #[test]
    fn test_current_before_publish_is_placeholder() {
        let store = SnapshotStore::new(5);
        let current = store.current();
        assert!(current.is_empty());
        assert_eq!(current.len(), 0);
    }

    #[test]
    fn test_publish_replaces_current() {
        let store = SnapshotStore::new(0);
        store.publish(frame(1));
        store.publish(frame(2));
        assert_eq!(store.current().data[0], 2);
        // Ring disabled at capacity 0
        assert!(store.drain_ring().is_empty());
    }

    #[test]
    fn test_ring_bounded_fifo() {
        let store = SnapshotStore::new(3);
        for tag in 1..=5u8 {
            store.publish(frame(tag));
        }
        let ring = store.drain_ring();
        // At most capacity frames, most recent, in publish order
        assert_eq!(ring.len(), 3);
        assert_eq!(ring[0].data[0], 3);
        assert_eq!(ring[1].data[0], 4);
        assert_eq!(ring[2].data[0], 5);
    }

    #[test]
    fn test_drain_does_not_clear() {
        let store = SnapshotStore::new(4);
        store.publish(frame(1));
        store.publish(frame(2));
        assert_eq!(store.drain_ring().len(), 2);
        assert_eq!(store.drain_ring().len(), 2);
        assert_eq!(store.ring_len(), 2);
    }

    #[test]
    fn test_concurrent_publish_and_read() {
        let store = Arc::new(SnapshotStore::new(16));
        let mut handles = Vec::new();

        for writer in 0..4u8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u8 {
                    store.publish(frame(writer.wrapping_mul(50).wrapping_add(i)));
                }
            }));
        }
        for _ in 0..2 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let current = store.current();
                    // A reader never sees a torn frame: either placeholder
                    // or a complete 8 byte payload
                    assert!(current.is_empty() || current.len() == 8);
                    let _ = store.drain_ring();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.ring_len() <= 16);
        assert!(!store.is_unpublished());
    }
}
