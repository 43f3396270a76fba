use crate::broadcast::FrameBroadcaster;
use crate::config::SourceConfig;
use crate::connections::ConnectionTracker;
use crate::error::Result;
use crate::group::GroupStitcher;
use crate::playlist::PlaylistWindow;
use crate::snapshot::SnapshotStore;
use crate::source::CameraSource;
use crate::subscribers::{StreamVariant, SubscriberRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// One source's live state plus the fixed-interval tasks that feed it.
///
/// Two tasks run per source: a snapshot poll (fetch frame, publish to the
/// store, fan out to subscribers) and a manifest poll (refresh the playlist
/// window). Neither holds a lock across a network call, and neither blocks
/// its timer longer than the poll interval: fetches are bounded by the
/// source and errors simply mean "retry next tick".
pub struct SourceRuntime {
    name: String,
    source: Arc<dyn CameraSource>,
    store: Arc<SnapshotStore>,
    window: Arc<Mutex<PlaylistWindow>>,
    broadcaster: Arc<FrameBroadcaster>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SourceRuntime {
    /// Build the runtime for one configured source and start its poll
    /// tasks. The cancellation token is a child of the hub's token, so hub
    /// shutdown disposes every source.
    pub fn spawn(
        config: &SourceConfig,
        source: Arc<dyn CameraSource>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let store = Arc::new(SnapshotStore::new(config.ring_capacity()));
        let window = Arc::new(Mutex::new(PlaylistWindow::new(
            config.target_duration_seconds,
        )?));
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Arc::new(FrameBroadcaster::new(registry));
        let cancel = parent.child_token();

        let snapshot_task = tokio::spawn(snapshot_poll_loop(
            Arc::clone(&source),
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.poll_interval_ms,
            config.autofps_idle_divisor,
            cancel.clone(),
        ));
        let manifest_task = tokio::spawn(manifest_poll_loop(
            Arc::clone(&source),
            Arc::clone(&window),
            config.target_duration_seconds,
            cancel.clone(),
        ));

        info!("Started poll tasks for source {}", config.name);
        Ok(Self {
            name: config.name.clone(),
            source,
            store,
            window,
            broadcaster,
            cancel,
            tasks: Mutex::new(vec![snapshot_task, manifest_task]),
        })
    }

    /// Stop this source's timers. Idempotent; in-flight fetches that
    /// complete after disposal are discarded rather than applied. Removal
    /// from group rings is the hub's responsibility.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            info!("Disposing source {}", self.name);
        }
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dispose and wait for the poll tasks to wind down
    pub async fn shutdown(&self) {
        self.dispose();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(handles).await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn CameraSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn window(&self) -> &Arc<Mutex<PlaylistWindow>> {
        &self.window
    }

    pub fn broadcaster(&self) -> &Arc<FrameBroadcaster> {
        &self.broadcaster
    }
}

async fn snapshot_poll_loop(
    source: Arc<dyn CameraSource>,
    store: Arc<SnapshotStore>,
    broadcaster: Arc<FrameBroadcaster>,
    poll_interval_ms: u64,
    autofps_idle_divisor: u32,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_millis(poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut publishes: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // With nobody watching and no preroll ring to fill, polling halts
        // until a subscriber shows up again
        let registry = broadcaster.registry();
        let wanted = StreamVariant::ALL
            .iter()
            .any(|variant| !registry.is_empty(*variant));
        if !wanted && store.capacity() == 0 {
            trace!("No subscribers for {}, skipping snapshot poll", source.name());
            continue;
        }

        let frame = match source.fetch_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Snapshot fetch from {} failed, retrying next tick: {}", source.name(), e);
                continue;
            }
        };
        if cancel.is_cancelled() {
            // Completed after disposal; discard
            break;
        }

        store.publish(frame.clone());
        publishes = publishes.wrapping_add(1);

        broadcaster.broadcast_frame(StreamVariant::Raw, &frame);
        broadcaster.broadcast_frame(StreamVariant::SnapshotPoll, &frame);
        if source.motion_active().await || publishes % autofps_idle_divisor == 0 {
            broadcaster.broadcast_frame(StreamVariant::AutoFps, &frame);
        }
    }
    debug!("Snapshot poll loop for {} stopped", source.name());
}

async fn manifest_poll_loop(
    source: Arc<dyn CameraSource>,
    window: Arc<Mutex<PlaylistWindow>>,
    target_duration_seconds: f64,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs_f64(target_duration_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let manifest = match source.fetch_manifest().await {
            Ok(text) => text,
            Err(e) => {
                debug!("Manifest fetch from {} failed, retrying next tick: {}", source.name(), e);
                continue;
            }
        };
        if cancel.is_cancelled() {
            break;
        }

        match window.lock().apply_manifest(&manifest) {
            Ok(appended) => trace!("Appended {} segments for {}", appended, source.name()),
            Err(e) => debug!("Manifest from {} rejected, state retained: {}", source.name(), e),
        }
    }
    debug!("Manifest poll loop for {} stopped", source.name());
}

/// A group stitcher plus its scheduling task
pub struct GroupRuntime {
    name: String,
    stitcher: Arc<tokio::sync::Mutex<GroupStitcher>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupRuntime {
    pub fn spawn(
        stitcher: GroupStitcher,
        poll_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let name = stitcher.name().to_string();
        let stitcher = Arc::new(tokio::sync::Mutex::new(stitcher));
        let cancel = parent.child_token();

        let task = tokio::spawn(group_tick_loop(
            Arc::clone(&stitcher),
            poll_interval,
            cancel.clone(),
        ));

        info!("Started stitching task for group {}", name);
        Self {
            name,
            stitcher,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stitcher(&self) -> &Arc<tokio::sync::Mutex<GroupStitcher>> {
        &self.stitcher
    }

    /// Drop a disposed source from this group's rotation ring
    pub async fn remove_member(&self, source_name: &str) -> bool {
        self.stitcher.lock().await.remove_member(source_name)
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn group_tick_loop(
    stitcher: Arc<tokio::sync::Mutex<GroupStitcher>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut stitcher = stitcher.lock().await;
        let name = stitcher.name().to_string();
        match stitcher.tick().await {
            Ok(outcome) => trace!("Group {} tick: {:?}", name, outcome),
            Err(e) => debug!("Group {} tick aborted, state retained: {}", name, e),
        }
    }
}

/// Periodically sweep stale entries out of the connection tracker
pub fn spawn_sweeper(
    tracker: Arc<ConnectionTracker>,
    every: Duration,
    parent: &CancellationToken,
) -> JoinHandle<()> {
    let cancel = parent.child_token();
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let removed = tracker.sweep();
            if removed > 0 {
                debug!("Swept {} stale connections", removed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionHandle;
    use crate::frame::Frame;
    use crate::source::MockSource;
    use tokio::time::sleep;

    fn test_config(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            media_dir: "/tmp/unused".to_string(),
            poll_interval_ms: 10,
            preroll_seconds: 2,
            record_seconds: 2,
            target_duration_seconds: 0.05,
            autofps_idle_divisor: 8,
        }
    }

    #[tokio::test]
    async fn test_snapshot_poll_publishes_and_broadcasts() {
        let source = MockSource::new("porch");
        source.set_frame(Some(Frame::jpeg(vec![0xAB; 4])));
        source.set_manifest(Some("#EXTM3U\n#EXTINF:2,\na.ts\n"));

        let cancel = CancellationToken::new();
        let runtime =
            SourceRuntime::spawn(&test_config("porch"), source, &cancel).unwrap();
        let (_id, mut rx) = runtime.broadcaster().subscribe(StreamVariant::Raw, 64);

        sleep(Duration::from_millis(100)).await;

        assert!(!runtime.store().current().is_empty());
        assert!(runtime.store().ring_len() > 0);
        assert!(rx.try_recv().is_ok());
        assert!(runtime.window().lock().retained() > 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_polling_halts_without_subscribers_or_ring() {
        let source = MockSource::new("idle");
        source.set_frame(Some(Frame::jpeg(vec![1])));

        let mut config = test_config("idle");
        config.preroll_seconds = 0;
        config.record_seconds = 0;

        let cancel = CancellationToken::new();
        let runtime = SourceRuntime::spawn(&config, source, &cancel).unwrap();

        sleep(Duration::from_millis(60)).await;
        // Nobody subscribed and no ring to fill: nothing was fetched
        assert!(runtime.store().current().is_empty());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_source_retries_without_state_change() {
        let source = MockSource::new("flaky");
        // No frame and no manifest scripted: every fetch is unavailable

        let cancel = CancellationToken::new();
        let runtime =
            SourceRuntime::spawn(
                &test_config("flaky"),
                Arc::clone(&source) as Arc<dyn CameraSource>,
                &cancel,
            )
            .unwrap();
        let (_id, _rx) = runtime.broadcaster().subscribe(StreamVariant::Raw, 8);

        sleep(Duration::from_millis(60)).await;
        assert!(runtime.store().current().is_empty());

        // Once the source comes back, the next tick picks it up
        source.set_frame(Some(Frame::jpeg(vec![7])));
        sleep(Duration::from_millis(60)).await;
        assert!(!runtime.store().current().is_empty());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_stops_polling() {
        let source = MockSource::new("gone");
        source.set_frame(Some(Frame::jpeg(vec![1])));

        let cancel = CancellationToken::new();
        let runtime =
            SourceRuntime::spawn(&test_config("gone"), source, &cancel).unwrap();
        let (_id, _rx) = runtime.broadcaster().subscribe(StreamVariant::Raw, 64);

        sleep(Duration::from_millis(40)).await;
        runtime.dispose();
        runtime.dispose();
        assert!(runtime.is_disposed());

        sleep(Duration::from_millis(30)).await;
        let frames_after_dispose = runtime.broadcaster().stats().frames_broadcast;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            runtime.broadcaster().stats().frames_broadcast,
            frames_after_dispose
        );

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_runtime_ticks() {
        let source = MockSource::new("solo");
        source.set_manifest(Some("#EXTM3U\n#EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n"));

        let stitcher =
            GroupStitcher::new("yard", 2.0, vec![source as Arc<dyn CameraSource>]).unwrap();
        let cancel = CancellationToken::new();
        let runtime = GroupRuntime::spawn(stitcher, Duration::from_millis(20), &cancel);

        sleep(Duration::from_millis(90)).await;
        let stitcher = runtime.stitcher().lock().await;
        assert!(stitcher.discontinuity_sequence() >= 2);
        assert!(stitcher.manifest().contains("0/b.ts"));
        drop(stitcher);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_task() {
        let tracker = Arc::new(ConnectionTracker::new());
        let stale = ConnectionHandle::new();
        stale.close();
        tracker.track("/stale", stale);
        tracker.track("/live", ConnectionHandle::new());

        let cancel = CancellationToken::new();
        let task = spawn_sweeper(Arc::clone(&tracker), Duration::from_millis(10), &cancel);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.len(), 1);
        assert!(tracker.lookup("/live").is_some());

        cancel.cancel();
        let _ = task.await;
    }
}
