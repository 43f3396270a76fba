use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use camcast::{CamcastConfig, CamcastHub, StreamServer};

#[derive(Parser, Debug)]
#[command(name = "camcast")]
#[command(about = "Rust-based camera streaming hub with MJPEG fan-out and playlist stitching")]
#[command(version)]
#[command(long_about = "Distributes live camera imagery to many simultaneous viewers and \
assembles rolling segmented playlists, including multi-camera group playlists stitched from \
rotating sources. Cameras are fed by an external encoder writing snapshots and segment \
manifests into per-source media directories.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "camcast.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the hub")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting Camcast hub v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match CamcastConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let server_config = config.server.clone();
    let hub = Arc::new(CamcastHub::start(config).map_err(|e| {
        error!("Failed to start hub: {}", e);
        e
    })?);

    let server = StreamServer::new(server_config, Arc::clone(&hub));
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("Stream server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT signal (Ctrl+C)");

    hub.shutdown().await;
    let _ = server_task.await;

    info!("Camcast hub shutdown complete");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camcast={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print the default configuration in TOML format
fn print_default_config() -> Result<()> {
    let mut config = CamcastConfig::default();
    // Include one example source and group so the output shows every table
    config.sources.push(camcast::SourceConfig {
        name: "porch".to_string(),
        media_dir: "/var/lib/camcast/porch".to_string(),
        poll_interval_ms: 1000,
        preroll_seconds: 5,
        record_seconds: 5,
        target_duration_seconds: 6.0,
        autofps_idle_divisor: 8,
    });
    config.groups.push(camcast::GroupConfig {
        name: "outside".to_string(),
        members: vec!["porch".to_string()],
        poll_interval_seconds: 6,
    });

    println!("# Camcast configuration file");
    println!("# Default values with one example source and group");
    println!();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
