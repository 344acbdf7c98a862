//! Global run counters.
//!
//! Thread-safe via atomics; the snapshot struct is the single source of
//! truth for the progress file and the end-of-run summary.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::outcome::TransportKind;

#[derive(Debug, Default)]
pub struct StatsStore {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub fail: AtomicU64,
    pub blocked: AtomicU64,
    pub exception: AtomicU64,
    pub timeout: AtomicU64,
    pub retries: AtomicU64,
    pub skipped: AtomicU64,
    pub rate_limited_429: AtomicU64,
    pub rate_limited_403: AtomicU64,
    pub connect_errors: AtomicU64,
    pub tls_errors: AtomicU64,
    pub reset_errors: AtomicU64,
}

/// Point-in-time copy of the counters, serialized into the progress file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub blocked: u64,
    pub exception: u64,
    pub timeout: u64,
    pub retries: u64,
    pub skipped: u64,
    pub rate_limited_429: u64,
    pub rate_limited_403: u64,
    pub connect_errors: u64,
    pub tls_errors: u64,
    pub reset_errors: u64,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn incr_total(&self) {
        Self::bump(&self.total);
    }

    pub fn incr_success(&self) {
        Self::bump(&self.success);
    }

    pub fn incr_fail(&self) {
        Self::bump(&self.fail);
    }

    pub fn incr_blocked(&self) {
        Self::bump(&self.blocked);
    }

    pub fn incr_exception(&self) {
        Self::bump(&self.exception);
    }

    pub fn incr_timeout(&self) {
        Self::bump(&self.timeout);
    }

    pub fn incr_retries(&self) {
        Self::bump(&self.retries);
    }

    pub fn incr_skipped(&self) {
        Self::bump(&self.skipped);
    }

    pub fn incr_rate_limited(&self, status: u16) {
        if status == 403 {
            Self::bump(&self.rate_limited_403);
        } else {
            Self::bump(&self.rate_limited_429);
        }
    }

    pub fn incr_transport(&self, kind: TransportKind) {
        match kind {
            TransportKind::Connect => Self::bump(&self.connect_errors),
            TransportKind::Tls => Self::bump(&self.tls_errors),
            TransportKind::Reset => Self::bump(&self.reset_errors),
            TransportKind::Other => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::SeqCst),
            success: self.success.load(Ordering::SeqCst),
            fail: self.fail.load(Ordering::SeqCst),
            blocked: self.blocked.load(Ordering::SeqCst),
            exception: self.exception.load(Ordering::SeqCst),
            timeout: self.timeout.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            rate_limited_429: self.rate_limited_429.load(Ordering::SeqCst),
            rate_limited_403: self.rate_limited_403.load(Ordering::SeqCst),
            connect_errors: self.connect_errors.load(Ordering::SeqCst),
            tls_errors: self.tls_errors.load(Ordering::SeqCst),
            reset_errors: self.reset_errors.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StatsStore::new();
        stats.incr_total();
        stats.incr_total();
        stats.incr_success();
        stats.incr_rate_limited(429);
        stats.incr_rate_limited(403);
        stats.incr_transport(TransportKind::Connect);
        stats.incr_transport(TransportKind::Other);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.rate_limited_429, 1);
        assert_eq!(snap.rate_limited_403, 1);
        assert_eq!(snap.connect_errors, 1);
        assert_eq!(snap.tls_errors, 0);
    }

    #[test]
    fn snapshot_serializes_counter_names() {
        let stats = StatsStore::new();
        stats.incr_skipped();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["skipped"], 1);
        assert_eq!(json["retries"], 0);
    }
}
