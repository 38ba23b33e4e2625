//! Shutter - Command-line demos for camera sessions
//!
//! Brings up the simulated SDK, opens the manager session, plugs in a camera
//! and runs one demo against it.

mod config;
mod demos;
mod state;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shutter_session::ImageDelivery;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "shutter")]
#[command(about = "Capability-driven camera session demos")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "shutter.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for the camera and for each device notification
    #[arg(short, long, default_value_t = 10)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capabilities of the manager and the camera
    Capabilities {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Take a single picture
    Capture {
        /// Also save the normal preview
        #[arg(long)]
        preview: bool,
        /// Also save the low resolution preview
        #[arg(long)]
        low_res_preview: bool,
        /// Also save the RGB thumbnail
        #[arg(long)]
        thumbnail: bool,
    },
    /// Shoot a continuous burst
    Burst {
        #[arg(short = 'n', long, default_value_t = 3)]
        count: u32,
    },
    /// Drive manual focus to the closest point and step back
    Focus {
        #[arg(short = 'n', long, default_value_t = 5)]
        steps: u32,
    },
    /// Record and download a movie clip
    Video {
        #[arg(short, long, default_value_t = 3)]
        seconds: u64,
    },
    /// Run the live-view loop and report frames
    Liveview {
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
    /// Write the default configuration file and exit
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Shutter v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig = args.command {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Default configuration written");
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    info!(
        interval_ms = config.live_view.interval_ms,
        video_dir = %config.output.video_dir,
        "Configuration loaded"
    );

    let mut state = state::AppState::new(config, Duration::from_secs(args.wait_secs));

    let result = match args.command {
        Command::Capabilities { json } => demos::capabilities(&mut state, json).await,
        Command::Capture {
            preview,
            low_res_preview,
            thumbnail,
        } => {
            let extras: Vec<ImageDelivery> = [
                (preview, ImageDelivery::Preview),
                (low_res_preview, ImageDelivery::LowResPreview),
                (thumbnail, ImageDelivery::Thumbnail),
            ]
            .into_iter()
            .filter_map(|(wanted, kind)| wanted.then_some(kind))
            .collect();
            demos::capture(&mut state, &extras).await
        }
        Command::Burst { count } => demos::burst(&mut state, count).await,
        Command::Focus { steps } => demos::focus(&mut state, steps).await,
        Command::Video { seconds } => demos::video(&mut state, seconds).await,
        Command::Liveview { seconds } => demos::liveview(&mut state, seconds).await,
        Command::InitConfig => Ok(()),
    };

    state.shutdown();
    info!("Shutdown complete");
    result
}
