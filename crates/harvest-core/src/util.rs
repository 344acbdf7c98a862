//! Small shared helpers: clock-seeded pseudo-randomness and atomic JSON
//! writes.
//!
//! The xorshift avoids pulling in the `rand` crate; seeded from the current
//! time it is good enough for jitter and pool rotation, not crypto.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::HarvestError;

fn xorshift() -> u64 {
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Uniform index into a slice of the given length. Returns 0 for length 0.
pub fn pick_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    (xorshift() % len as u64) as usize
}

/// Uniform duration in `[min, max]`. Degenerate ranges collapse to `min`.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span_ms = (max - min).as_millis() as u64;
    min + Duration::from_millis(xorshift() % (span_ms + 1))
}

/// Write via a temp file and rename so a crash mid-write cannot truncate
/// state that must survive restarts.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), HarvestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
