//! Wall clock abstraction and interval formatting.
//!
//! Every component that needs "now" takes an `Arc<dyn TimeSource>` so that
//! tests can drive time explicitly instead of sleeping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of epoch-microsecond timestamps.
pub trait TimeSource: Send + Sync {
    fn now_us(&self) -> u64;
}

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

pub fn wall_clock() -> Arc<dyn TimeSource> {
    Arc::new(WallClock)
}

/// Formats a microsecond interval as a compact human-readable string,
/// keeping the two most significant units: `"2d 4h"`, `"3m 10s"`, `"45s"`.
pub fn format_interval_us(us: u64) -> String {
    let total_seconds = us / 1_000_000;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
