use crate::error::SourceError;
use crate::frame::Frame;
use crate::snapshot::SnapshotStore;
use async_trait::async_trait;
use chrono::Local;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// The capability surface one camera source must provide, implemented once
/// per vendor protocol and selected by configuration. The hub core only
/// ever talks to this trait; vendor dialects, auth handshakes and PTZ live
/// behind it.
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Configured name of this source
    fn name(&self) -> &str;

    /// Whether the source currently responds at all
    async fn is_reachable(&self) -> bool;

    /// Whether the source is reporting a motion/priority event
    async fn motion_active(&self) -> bool;

    /// Latest snapshot frame, or unavailable
    async fn fetch_frame(&self) -> Result<Frame, SourceError>;

    /// Raw text of the source's segment manifest, or unavailable
    async fn fetch_manifest(&self) -> Result<String, SourceError>;
}

/// Externally settable motion flag shared between a source and whatever
/// detects events for it (alarm stream, detector process)
#[derive(Debug, Clone, Default)]
pub struct MotionFlag {
    active: Arc<AtomicBool>,
}

impl MotionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Camera source backed by the external encoder's output directory.
///
/// The encoder is a black box that periodically rewrites a snapshot JPEG
/// and a segment manifest inside the media directory; this source just
/// reads whatever is there. A missing file is the transient-unavailable
/// case, reported as such and retried next tick.
pub struct FileSource {
    name: String,
    media_dir: PathBuf,
    snapshot_path: PathBuf,
    manifest_path: PathBuf,
    motion: MotionFlag,
}

/// File names the encoder writes into each source's media directory
const SNAPSHOT_FILE: &str = "snapshot.jpg";
const MANIFEST_FILE: &str = "playlist.m3u8";

impl FileSource {
    pub fn new(name: impl Into<String>, media_dir: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let media_dir = media_dir.into();
        Self {
            snapshot_path: media_dir.join(SNAPSHOT_FILE),
            manifest_path: media_dir.join(MANIFEST_FILE),
            name,
            media_dir,
            motion: MotionFlag::new(),
        }
    }

    /// Handle for whatever raises and clears motion events on this source
    pub fn motion_flag(&self) -> MotionFlag {
        self.motion.clone()
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    fn map_read_error(&self, what: &str, err: std::io::Error) -> SourceError {
        if err.kind() == ErrorKind::NotFound {
            SourceError::Unavailable {
                name: self.name.clone(),
                reason: format!("{} not written yet", what),
            }
        } else {
            SourceError::Io(err)
        }
    }

    /// Dump the snapshot store's preroll ring as numbered JPEG files into a
    /// timestamped clip directory, for retroactive clip generation. Returns
    /// the directory written, or None when the ring is empty.
    pub async fn store_clip_frames(
        &self,
        store: &SnapshotStore,
    ) -> Result<Option<PathBuf>, SourceError> {
        let frames = store.drain_ring();
        if frames.is_empty() {
            debug!("Preroll ring for {} is empty, nothing to store", self.name);
            return Ok(None);
        }

        let clip_dir = self
            .media_dir
            .join(format!("clip-{}", Local::now().format("%Y%m%d-%H%M%S")));
        fs::create_dir_all(&clip_dir).await?;
        for (index, frame) in frames.iter().enumerate() {
            let path = clip_dir.join(format!("frame{:04}.jpg", index));
            fs::write(&path, &frame.data).await?;
        }
        info!(
            "Stored {} preroll frames for {} in {}",
            frames.len(),
            self.name,
            clip_dir.display()
        );
        Ok(Some(clip_dir))
    }
}

#[async_trait]
impl CameraSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_reachable(&self) -> bool {
        fs::try_exists(&self.snapshot_path).await.unwrap_or(false)
            || fs::try_exists(&self.manifest_path).await.unwrap_or(false)
    }

    async fn motion_active(&self) -> bool {
        self.motion.is_active()
    }

    async fn fetch_frame(&self) -> Result<Frame, SourceError> {
        let data = fs::read(&self.snapshot_path)
            .await
            .map_err(|e| self.map_read_error("snapshot", e))?;
        Ok(Frame::jpeg(data))
    }

    async fn fetch_manifest(&self) -> Result<String, SourceError> {
        fs::read_to_string(&self.manifest_path)
            .await
            .map_err(|e| self.map_read_error("manifest", e))
    }
}

/// In-memory source with externally scripted state, for tests and demos
pub struct MockSource {
    name: String,
    reachable: AtomicBool,
    motion: MotionFlag,
    frame: parking_lot::Mutex<Option<Frame>>,
    manifest: parking_lot::Mutex<Option<String>>,
}

impl MockSource {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            reachable: AtomicBool::new(true),
            motion: MotionFlag::new(),
            frame: parking_lot::Mutex::new(None),
            manifest: parking_lot::Mutex::new(None),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn motion_flag(&self) -> MotionFlag {
        self.motion.clone()
    }

    pub fn set_frame(&self, frame: Option<Frame>) {
        *self.frame.lock() = frame;
    }

    pub fn set_manifest(&self, manifest: Option<&str>) {
        *self.manifest.lock() = manifest.map(String::from);
    }
}

#[async_trait]
impl CameraSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    async fn motion_active(&self) -> bool {
        self.motion.is_active()
    }

    async fn fetch_frame(&self) -> Result<Frame, SourceError> {
        self.frame
            .lock()
            .clone()
            .ok_or_else(|| SourceError::unavailable(self.name.as_str(), "no frame scripted"))
    }

    async fn fetch_manifest(&self) -> Result<String, SourceError> {
        self.manifest
            .lock()
            .clone()
            .ok_or_else(|| SourceError::unavailable(self.name.as_str(), "no manifest scripted"))
    }
}
