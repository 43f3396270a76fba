pub mod broadcast;
pub mod config;
pub mod connections;
pub mod error;
pub mod frame;
pub mod group;
pub mod hub;
pub mod playlist;
pub mod poller;
pub mod snapshot;
pub mod source;
pub mod streaming;
pub mod subscribers;

pub use broadcast::{BroadcastStatsSnapshot, FrameBroadcaster, STREAM_BOUNDARY};
pub use config::{CamcastConfig, GroupConfig, ServerConfig, SourceConfig, SystemConfig};
pub use connections::{ConnectionHandle, ConnectionTracker};
pub use error::{CamcastError, PlaylistError, Result, SourceError, StreamError};
pub use frame::Frame;
pub use group::{GroupStitcher, TickOutcome};
pub use hub::CamcastHub;
pub use playlist::{parse_manifest, render_manifest, window_size, PlaylistWindow, SegmentEntry};
pub use poller::{spawn_sweeper, GroupRuntime, SourceRuntime};
pub use snapshot::SnapshotStore;
pub use source::{CameraSource, FileSource, MockSource, MotionFlag};
pub use streaming::StreamServer;
pub use subscribers::{StreamVariant, SubscriberRegistry};
