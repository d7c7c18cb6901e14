//! # FaceFilter Live: real-time face filtering pipeline
//!
//! A chain of heavy processing stages (capture, detection, landmarking,
//! alignment, modification, output) where every stage runs on its own
//! worker thread, isolated from the others, and exposes its tunable
//! parameters through a control sheet that can be changed while frames are
//! flowing.
//!
//! ## Architecture
//!
//! - **Backend**: frame heap, packet connections, state database and the
//!   worker/host runtime that supervises each stage
//! - **Control**: typed control sheets mirrored between a stage and its host
//! - **Stages**: the six concrete stages and the model traits they run
//! - **App**: wiring of the stages and the supervising loop
//!
//! ## Configuration
//!
//! Settings and per-stage state live under the userdata directory
//! (default: the platform data directory under `dev.facefilter.live`):
//!
//! - `settings/config.toml` - runtime tuning ([`AppConfig`])
//! - `settings/states.json` - persisted control values and on/off state
//! - `output_sequence/` - saved output frames
//! - `logs/` - daily log files
//!
//! ## Example
//!
//! ```ignore
//! use facefilter_live::{AppConfig, LiveApp, StageModels, UserDataPaths};
//!
//! let paths = UserDataPaths::new("/tmp/facefilter");
//! let config = AppConfig::load_or_default(paths.config_file());
//! let mut app = LiveApp::new(config, paths, StageModels::builtin())?;
//! app.initialize()?;
//! for _ in 0..1000 {
//!     app.process_messages();
//!     std::thread::sleep(app.config().tick_interval());
//! }
//! app.finalize()?;
//! ```

pub mod app;
pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod stages;
pub mod types;

// Re-export commonly used types
pub use app::{LiveApp, StageModels};
pub use backend::{BackendDb, Connection, ConnectionPacket, ReemitSignal, StageHost, StageStatus, WeakHeap};
pub use config::{AppConfig, UserDataPaths};
pub use error::{LiveError, Result};
