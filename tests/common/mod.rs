//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use facefilter_live::config::AppConfig;
use facefilter_live::{LiveApp, StageHost};
use std::time::{Duration, Instant};

/// Upper bound for anything that waits on worker threads
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Small heap and fast flushing so tests stay quick
pub fn test_config() -> AppConfig {
    AppConfig {
        heap_size_mb: 64,
        read_timeout_ms: 1,
        db_flush_interval_ms: 10,
        ..AppConfig::default()
    }
}

/// Drive `app` until `done` holds or the timeout expires.
pub fn pump_until(app: &mut LiveApp, mut done: impl FnMut(&LiveApp) -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        app.process_messages();
        if done(app) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Drive a single host until `done` holds or the timeout expires.
pub fn pump_host_until(host: &mut StageHost, mut done: impl FnMut(&StageHost) -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        host.process_messages();
        if done(host) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
