use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamcastConfig {
    pub server: ServerConfig,
    pub system: SystemConfig,
    /// Camera sources served by this hub
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Multi-camera groups stitched from the sources above
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Seconds between stale-connection sweeps
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Per-subscriber outbound frame queue depth
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Unique source name, used in URLs
    pub name: String,

    /// Directory the external encoder writes this source's snapshot and
    /// segment manifest into
    pub media_dir: String,

    /// Snapshot poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds of frames kept before a trigger
    #[serde(default = "default_preroll_seconds")]
    pub preroll_seconds: u32,

    /// Seconds of frames kept after a trigger
    #[serde(default = "default_record_seconds")]
    pub record_seconds: u32,

    /// Trailing window of segments to keep per manifest refresh, seconds
    #[serde(default = "default_target_duration_seconds")]
    pub target_duration_seconds: f64,

    /// Idle auto-fps streams get one frame per this many publishes
    #[serde(default = "default_autofps_idle_divisor")]
    pub autofps_idle_divisor: u32,
}

impl SourceConfig {
    /// Ring capacity at one published frame per second
    pub fn ring_capacity(&self) -> usize {
        (self.preroll_seconds + self.record_seconds) as usize
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GroupConfig {
    /// Unique group name, used in URLs
    pub name: String,

    /// Names of member sources forming the rotation ring
    pub members: Vec<String>,

    /// Seconds between stitching ticks; also the fragment target duration
    #[serde(default = "default_group_poll_seconds")]
    pub poll_interval_seconds: u64,
}

impl CamcastConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camcast.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port() as i64)?
            .set_default(
                "system.sweep_interval_seconds",
                default_sweep_interval_seconds() as i64,
            )?
            .set_default(
                "system.subscriber_queue_size",
                default_subscriber_queue_size() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with CAMCAST_ prefix
            .add_source(Environment::with_prefix("CAMCAST").separator("_"))
            .build()?;

        let config: CamcastConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values. Failures here surface once at setup;
    /// the offending component is left inactive instead of crashing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if self.system.sweep_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        if self.system.subscriber_queue_size == 0 {
            return Err(ConfigError::Message(
                "Subscriber queue size must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ConfigError::Message("Source name must not be empty".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
            if source.media_dir.is_empty() {
                return Err(ConfigError::Message(format!(
                    "Source {} has no media_dir",
                    source.name
                )));
            }
            if source.poll_interval_ms == 0 {
                return Err(ConfigError::Message(format!(
                    "Source {} poll interval must be greater than 0",
                    source.name
                )));
            }
            if source.target_duration_seconds <= 0.0 {
                return Err(ConfigError::Message(format!(
                    "Source {} target duration must be greater than 0",
                    source.name
                )));
            }
            if source.autofps_idle_divisor == 0 {
                return Err(ConfigError::Message(format!(
                    "Source {} autofps idle divisor must be greater than 0",
                    source.name
                )));
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Duplicate group name: {}",
                    group.name
                )));
            }
            if group.members.is_empty() {
                return Err(ConfigError::Message(format!(
                    "Group {} has no members",
                    group.name
                )));
            }
            if group.poll_interval_seconds == 0 {
                return Err(ConfigError::Message(format!(
                    "Group {} poll interval must be greater than 0",
                    group.name
                )));
            }
            for member in &group.members {
                if !names.contains(member.as_str()) {
                    return Err(ConfigError::Message(format!(
                        "Group {} references unknown source: {}",
                        group.name, member
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for CamcastConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
            },
            system: SystemConfig {
                sweep_interval_seconds: default_sweep_interval_seconds(),
                subscriber_queue_size: default_subscriber_queue_size(),
            },
            sources: Vec::new(),
            groups: Vec::new(),
        }
    }
}

// Default value functions
fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8080
}

fn default_sweep_interval_seconds() -> u64 {
    8
}
fn default_subscriber_queue_size() -> usize {
    64
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_preroll_seconds() -> u32 {
    5
}
fn default_record_seconds() -> u32 {
    5
}
fn default_target_duration_seconds() -> f64 {
    6.0
}
fn default_autofps_idle_divisor() -> u32 {
    8
}

fn default_group_poll_seconds() -> u64 {
    6
}
