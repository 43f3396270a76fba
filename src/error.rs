use thiserror::Error;

#[derive(Error, Debug)]
pub enum CamcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CamcastError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while parsing or windowing segment manifests.
///
/// A malformed manifest aborts that tick's update only; the previous
/// playlist state is retained and served unchanged.
#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("Segment duration is not a number: {value}")]
    BadDuration { value: String },

    #[error("Segment tag without a following URI line")]
    MissingUri,

    #[error("Target duration must be greater than 0, got {0}")]
    InvalidTarget(f64),

    #[error("Group has no member sources")]
    EmptyGroup,
}

/// Errors from the vendor-protocol seam. `Unavailable` is transient: the
/// poll loop logs it and retries on the next tick.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source {name} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("IO error reading from source: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn unavailable<S: Into<String>>(name: S, reason: S) -> Self {
        Self::Unavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the HTTP streaming server.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Stream server startup failed: {details}")]
    StartupFailed { details: String },
}

pub type Result<T> = std::result::Result<T, CamcastError>;
