use crate::config::CamcastConfig;
use crate::connections::ConnectionTracker;
use crate::error::Result;
use crate::group::GroupStitcher;
use crate::poller::{spawn_sweeper, GroupRuntime, SourceRuntime};
use crate::source::{CameraSource, FileSource};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns every running source, group and background task.
///
/// Construction wires the configuration into live runtimes; everything
/// hangs off one root cancellation token so `shutdown` winds the whole hub
/// down. A setup failure on one source or group logs once and leaves that
/// component inactive; it never takes the process down with it.
pub struct CamcastHub {
    config: CamcastConfig,
    sources: RwLock<HashMap<String, Arc<SourceRuntime>>>,
    files: RwLock<HashMap<String, Arc<FileSource>>>,
    groups: RwLock<HashMap<String, Arc<GroupRuntime>>>,
    tracker: Arc<ConnectionTracker>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Local>,
}

impl CamcastHub {
    /// Build and start the hub from a validated configuration
    pub fn start(config: CamcastConfig) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let tracker = Arc::new(ConnectionTracker::new());

        let mut sources: HashMap<String, Arc<SourceRuntime>> = HashMap::new();
        let mut files: HashMap<String, Arc<FileSource>> = HashMap::new();
        for source_config in &config.sources {
            let file = Arc::new(FileSource::new(
                source_config.name.clone(),
                source_config.media_dir.clone(),
            ));
            let source = Arc::clone(&file) as Arc<dyn CameraSource>;
            match SourceRuntime::spawn(source_config, source, &cancel) {
                Ok(runtime) => {
                    sources.insert(source_config.name.clone(), Arc::new(runtime));
                    files.insert(source_config.name.clone(), file);
                }
                Err(e) => {
                    // Setup error: this source stays inactive, the rest of
                    // the hub keeps going
                    warn!("Source {} left inactive: {}", source_config.name, e);
                }
            }
        }

        let mut groups: HashMap<String, Arc<GroupRuntime>> = HashMap::new();
        for group_config in &config.groups {
            let members: Vec<Arc<dyn CameraSource>> = group_config
                .members
                .iter()
                .filter_map(|name| sources.get(name))
                .map(|runtime| Arc::clone(runtime.source()))
                .collect();

            let stitcher = match GroupStitcher::new(
                group_config.name.clone(),
                group_config.poll_interval_seconds as f64,
                members,
            ) {
                Ok(stitcher) => stitcher,
                Err(e) => {
                    warn!("Group {} left inactive: {}", group_config.name, e);
                    continue;
                }
            };
            let runtime = GroupRuntime::spawn(
                stitcher,
                Duration::from_secs(group_config.poll_interval_seconds),
                &cancel,
            );
            groups.insert(group_config.name.clone(), Arc::new(runtime));
        }

        let sweeper = spawn_sweeper(
            Arc::clone(&tracker),
            Duration::from_secs(config.system.sweep_interval_seconds),
            &cancel,
        );

        info!(
            "Hub started with {} sources and {} groups",
            sources.len(),
            groups.len()
        );
        Ok(Self {
            config,
            sources: RwLock::new(sources),
            files: RwLock::new(files),
            groups: RwLock::new(groups),
            tracker,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
            started_at: Local::now(),
        })
    }

    pub fn source(&self, name: &str) -> Option<Arc<SourceRuntime>> {
        self.sources.read().get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Arc<GroupRuntime>> {
        self.groups.read().get(name).cloned()
    }

    /// The file-backed side of a source, for motion events and clip dumps
    pub fn file_source(&self, name: &str) -> Option<Arc<FileSource>> {
        self.files.read().get(name).cloned()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    /// Dispose one source: stop its timers, drop its state and pull it out
    /// of every group ring. Idempotent; disposing an unknown name is a
    /// no-op returning false.
    pub async fn dispose_source(&self, name: &str) -> bool {
        let Some(runtime) = self.sources.write().remove(name) else {
            return false;
        };
        self.files.write().remove(name);
        runtime.dispose();

        let groups: Vec<Arc<GroupRuntime>> = self.groups.read().values().cloned().collect();
        for group in groups {
            if group.remove_member(name).await {
                info!("Removed {} from group {}", name, group.name());
            }
        }

        runtime.shutdown().await;
        true
    }

    /// Wind everything down: cancel the root token, close tracked viewer
    /// connections, and wait for every task to finish
    pub async fn shutdown(&self) {
        info!("Shutting down hub");
        self.cancel.cancel();
        self.tracker.close_all();

        let sources: Vec<Arc<SourceRuntime>> = self.sources.write().drain().map(|(_, v)| v).collect();
        for runtime in sources {
            runtime.shutdown().await;
        }
        let groups: Vec<Arc<GroupRuntime>> = self.groups.write().drain().map(|(_, v)| v).collect();
        for runtime in groups {
            runtime.shutdown().await;
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        info!("Hub shutdown complete");
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &CamcastConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Seconds since the hub came up
    pub fn uptime_seconds(&self) -> i64 {
        (Local::now() - self.started_at).num_seconds()
    }
}
