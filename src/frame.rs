use bytes::Bytes;
use std::time::{Duration, SystemTime};

/// A single camera frame: raw payload bytes plus the content type reported
/// by the source. Payloads are shared (`Bytes`) so fan-out to many
/// subscribers never copies the image data.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data (shared ownership for efficiency)
    pub data: Bytes,
    /// MIME content type, e.g. "image/jpeg"
    pub content_type: String,
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
}

impl Frame {
    /// Create a new frame with the given payload and content type
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Create a JPEG frame
    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, "image/jpeg")
    }

    /// The defined placeholder returned before any frame has been published:
    /// zero-length, never an error.
    pub fn empty() -> Self {
        Self::new(Bytes::new(), "image/jpeg")
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the frame carries no payload (the pre-publish placeholder)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check if frame is older than specified duration
    pub fn is_older_than(&self, duration: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.timestamp)
            .map(|age| age > duration)
            .unwrap_or(false)
    }
}
