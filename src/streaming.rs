use crate::broadcast::FrameBroadcaster;
use crate::config::ServerConfig;
use crate::connections::ConnectionHandle;
use crate::error::{Result, StreamError};
use crate::hub::CamcastHub;
use crate::poller::SourceRuntime;
use crate::subscribers::StreamVariant;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// HTTP server exposing each source's streams, snapshot and playlist, plus
/// the stitched group playlists
pub struct StreamServer {
    config: ServerConfig,
    hub: Arc<CamcastHub>,
}

/// Shared state for the Axum server
#[derive(Clone)]
struct ServerState {
    hub: Arc<CamcastHub>,
}

impl StreamServer {
    pub fn new(config: ServerConfig, hub: Arc<CamcastHub>) -> Self {
        Self { config, hub }
    }

    /// Start the HTTP server; runs until the hub's cancel token fires
    pub async fn start(&self) -> Result<()> {
        let state = ServerState {
            hub: Arc::clone(&self.hub),
        };

        let app = Router::new()
            .route("/cam/:name/stream.mjpeg", get(raw_stream_handler))
            .route("/cam/:name/snapshots.mjpeg", get(snapshot_stream_handler))
            .route("/cam/:name/autofps.mjpeg", get(autofps_stream_handler))
            .route("/cam/:name/snapshot.jpg", get(snapshot_handler))
            .route("/cam/:name/playlist.m3u8", get(playlist_handler))
            .route("/cam/:name/motion", post(motion_handler))
            .route("/cam/:name/clip", post(clip_handler))
            .route("/group/:name/playlist.m3u8", get(group_playlist_handler))
            .route("/health", get(health_handler))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let addr = format!("{}:{}", self.config.ip, self.config.port);
        info!("Starting stream server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| StreamError::BindFailed {
                address: addr.clone(),
                source: e,
            })?;

        info!("Stream server listening on {}", addr);

        let cancel = self.hub.cancel_token();
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| StreamError::StartupFailed {
                details: format!("Server error: {}", e),
            })?;

        Ok(())
    }
}

/// Unsubscribes and closes the tracked connection when the response stream
/// is dropped, however the client went away
struct StreamGuard {
    broadcaster: Arc<FrameBroadcaster>,
    variant: StreamVariant,
    id: Uuid,
    handle: ConnectionHandle,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.variant, self.id);
        self.handle.close();
        debug!("Stream subscriber {} disconnected", self.id);
    }
}

async fn raw_stream_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    multipart_stream(&state, &name, StreamVariant::Raw)
}

async fn snapshot_stream_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    multipart_stream(&state, &name, StreamVariant::SnapshotPoll)
}

async fn autofps_stream_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    multipart_stream(&state, &name, StreamVariant::AutoFps)
}

/// Open one multipart stream: register the subscriber, prime snapshot
/// variants with the current frame, and track the connection so the
/// sweeper can garbage collect it after disconnect
fn multipart_stream(state: &ServerState, name: &str, variant: StreamVariant) -> Response {
    let Some(runtime) = state.hub.source(name) else {
        return not_found(name);
    };

    let queue_size = state.hub.config().system.subscriber_queue_size;
    let broadcaster = Arc::clone(runtime.broadcaster());
    let (id, mut rx) = broadcaster.subscribe(variant, queue_size);

    if matches!(variant, StreamVariant::SnapshotPoll | StreamVariant::AutoFps) {
        broadcaster.prime_subscriber(variant, id, &runtime.store().current());
    }

    let handle = ConnectionHandle::new();
    state.hub.tracker().track(
        format!("/cam/{}/{}#{}", name, variant.as_str(), id),
        handle.clone(),
    );

    info!("New {} stream client for {}", variant.as_str(), name);

    let guard = StreamGuard {
        broadcaster,
        variant,
        id,
        handle: handle.clone(),
    };

    let closed = handle.closed_token();
    let stream = async_stream::stream! {
        // Moved into the stream so disconnect cleanup runs on drop
        let _guard = guard;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => None,
                chunk = rx.recv() => chunk,
            };
            match next {
                Some(chunk) => yield Ok::<Bytes, axum::Error>(chunk),
                None => break,
            }
        }
    };

    let mut response = Response::builder().status(StatusCode::OK);
    for (key, value) in FrameBroadcaster::stream_headers() {
        response = response.header(key, value);
    }
    response
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Plain byte response with the current snapshot; zero-length before the
/// first publish
async fn snapshot_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let Some(runtime) = state.hub.source(&name) else {
        return not_found(&name);
    };
    let frame = runtime.store().current();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, frame.content_type.clone()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        frame.data,
    )
        .into_response()
}

async fn playlist_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let Some(runtime) = state.hub.source(&name) else {
        return not_found(&name);
    };
    let manifest = runtime.window().lock().render();
    manifest_response(manifest)
}

async fn group_playlist_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let Some(group) = state.hub.group(&name) else {
        return not_found(&name);
    };
    let manifest = group.stitcher().lock().await.manifest().to_string();
    manifest_response(manifest)
}

#[derive(serde::Deserialize)]
struct MotionParams {
    active: bool,
}

/// Raise or clear a source's motion flag; called by whatever detects
/// events for the camera (alarm stream bridge, detector process)
async fn motion_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Query(params): Query<MotionParams>,
) -> Response {
    let Some(file) = state.hub.file_source(&name) else {
        return not_found(&name);
    };
    file.motion_flag().set(params.active);
    info!("Motion flag for {} set to {}", name, params.active);
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "name": name, "motion": params.active })),
    )
        .into_response()
}

/// Dump the preroll ring as numbered JPEG files for retroactive clip
/// assembly
async fn clip_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let (Some(file), Some(runtime)) = (state.hub.file_source(&name), state.hub.source(&name))
    else {
        return not_found(&name);
    };
    match file.store_clip_frames(runtime.store()).await {
        Ok(Some(dir)) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "name": name,
                "frames": runtime.store().ring_len(),
                "clip_dir": dir.display().to_string(),
            })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "name": name, "frames": 0 })),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("clip dump failed: {}", e))
            .into_response(),
    }
}

fn manifest_response(manifest: String) -> Response {
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.apple.mpegurl".to_string(),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        manifest,
    )
        .into_response()
}

fn not_found(name: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("unknown source: {}", name)).into_response()
}

/// Handler for health check endpoint
async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let hub = &state.hub;

    let sources: Vec<serde_json::Value> = hub
        .source_names()
        .into_iter()
        .filter_map(|name| hub.source(&name).map(|runtime| (name, runtime)))
        .map(|(name, runtime)| source_health(&name, runtime.as_ref()))
        .collect();

    let mut groups = Vec::new();
    for name in hub.group_names() {
        if let Some(group) = hub.group(&name) {
            let stitcher = group.stitcher().lock().await;
            groups.push(serde_json::json!({
                "name": name,
                "members": stitcher.member_count(),
                "media_sequence": stitcher.media_sequence(),
                "discontinuity_sequence": stitcher.discontinuity_sequence(),
                "segments_retained": stitcher.retained(),
            }));
        }
    }

    let health_info = serde_json::json!({
        "status": "healthy",
        "started_at": hub.started_at().to_rfc3339(),
        "uptime_seconds": hub.uptime_seconds(),
        "tracked_connections": hub.tracker().len(),
        "sources": sources,
        "groups": groups,
    });

    (StatusCode::OK, axum::Json(health_info))
}

fn source_health(name: &str, runtime: &SourceRuntime) -> serde_json::Value {
    let stats = runtime.broadcaster().stats();
    let current = runtime.store().current();
    let snapshot_age_ms = (!current.is_empty()).then(|| current.age_ms());
    serde_json::json!({
        "name": name,
        "snapshot_available": !current.is_empty(),
        "snapshot_age_ms": snapshot_age_ms,
        "ring_frames": runtime.store().ring_len(),
        "media_sequence": runtime.window().lock().media_sequence(),
        "segments_retained": runtime.window().lock().retained(),
        "subscribers": {
            "raw": runtime.broadcaster().registry().count(StreamVariant::Raw),
            "snapshot_poll": runtime.broadcaster().registry().count(StreamVariant::SnapshotPoll),
            "auto_fps": runtime.broadcaster().registry().count(StreamVariant::AutoFps),
        },
        "broadcast": {
            "frames": stats.frames_broadcast,
            "bytes": stats.bytes_broadcast,
            "send_failures": stats.send_failures,
            "subscribers_dropped": stats.subscribers_dropped,
        },
    })
}
