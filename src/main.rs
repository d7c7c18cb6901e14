//! FaceFilter Live - Main Entry Point
//!
//! Runs the face filter pipeline headless until Ctrl-C (or a frame limit),
//! then shuts every stage down gracefully.

use anyhow::Context;
use clap::{Parser, Subcommand};
use facefilter_live::backend::FrameId;
use facefilter_live::stages::models::FrameSink;
use facefilter_live::types::FrameImage;
use facefilter_live::{AppConfig, LiveApp, StageModels, UserDataPaths};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "facefilter-live")]
#[command(about = "Real-time face filter pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        /// Userdata directory (default: platform data dir)
        #[arg(long)]
        userdata_dir: Option<PathBuf>,

        /// Keep model inference on the CPU
        #[arg(long)]
        no_cuda: bool,

        /// Stop after this many frames reached the output
        #[arg(long)]
        frames: Option<u64>,

        /// Discard persisted stage settings before starting
        #[arg(long)]
        reset_settings: bool,
    },
}

/// Counts presented frames.
struct CountingSink {
    presented: Arc<AtomicU64>,
}

impl FrameSink for CountingSink {
    fn present(&mut self, frame_id: FrameId, image: &FrameImage) {
        let n = self.presented.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!("Frame {} presented ({}x{}), total {}", frame_id, image.width(), image.height(), n);
    }
}

fn init_logging(paths: &UserDataPaths) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(paths.logs_dir()).context("Failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "facefilter-live.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,facefilter_live=debug")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

fn run(userdata_dir: Option<PathBuf>, no_cuda: bool, frames: Option<u64>, reset_settings: bool) -> anyhow::Result<()> {
    let root = match userdata_dir {
        Some(dir) => dir,
        None => UserDataPaths::default_root().context("No platform data directory, pass --userdata-dir")?,
    };
    let paths = UserDataPaths::new(root);
    let _log_guard = init_logging(&paths)?;

    tracing::info!(
        "Starting FaceFilter Live at {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    tracing::info!("Userdata directory: {:?}", paths.root());
    if no_cuda {
        tracing::info!("GPU inference disabled");
    }

    let config = AppConfig::load_or_default(paths.config_file());
    if !paths.config_file().exists() {
        if let Err(e) = config.save(paths.config_file()) {
            tracing::warn!("Could not write default config: {}", e);
        }
    }

    let presented = Arc::new(AtomicU64::new(0));
    let counter = presented.clone();
    let models = StageModels::builtin().with_sink(move || CountingSink {
        presented: counter.clone(),
    });

    let mut app = LiveApp::new(config, paths, models).context("Failed to build pipeline")?;
    if reset_settings {
        app.clear_backend_db();
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).context("Failed to install Ctrl-C handler")?;

    app.initialize().context("Failed to start stages")?;

    let tick = app.config().tick_interval();
    while running.load(Ordering::SeqCst) {
        app.process_messages();
        if frames.is_some_and(|limit| presented.load(Ordering::Relaxed) >= limit) {
            tracing::info!("Frame limit reached");
            break;
        }
        std::thread::sleep(tick);
    }

    tracing::info!("Shutting down...");
    app.finalize().context("Failed to save stage state")?;
    tracing::info!("{} frame(s) presented", presented.load(Ordering::Relaxed));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            userdata_dir,
            no_cuda,
            frames,
            reset_settings,
        } => run(userdata_dir, no_cuda, frames, reset_settings),
    }
}
