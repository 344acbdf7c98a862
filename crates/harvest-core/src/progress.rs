//! Periodic progress snapshots for live observability.
//!
//! A background task flushes one JSON document every ten seconds (and once
//! at shutdown) with the global counters, both health maps, and the
//! rate-limit state. The snapshot is diagnostic only; crash recovery relies
//! on the ledger files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HarvestError;
use crate::ledger::LedgerSet;
use crate::registry::{FingerprintHealth, HealthRegistry, ProxyHealthSnapshot, RateLimitSnapshot};
use crate::stats::{StatsSnapshot, StatsStore};
use crate::util;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub stats: StatsSnapshot,
    pub tls_stats: BTreeMap<String, FingerprintHealth>,
    pub proxy_stats: BTreeMap<String, ProxyHealthSnapshot>,
    pub rate_limit_state: RateLimitSnapshot,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(
        &self,
        stats: &StatsStore,
        registry: &HealthRegistry,
    ) -> Result<(), HarvestError> {
        let snapshot = ProgressSnapshot {
            stats: stats.snapshot(),
            tls_stats: registry.fingerprint_snapshot(),
            proxy_stats: registry.proxy_snapshot(),
            rate_limit_state: registry.rate_limit_snapshot(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        util::write_json_atomic(&self.path, &snapshot)
    }

    /// Start the background flusher. Cancelling the token stops the loop
    /// after one final write; awaiting the handle guarantees the last
    /// snapshot and ledger JSON variants are on disk.
    pub fn spawn(
        self,
        stats: Arc<StatsStore>,
        registry: Arc<HealthRegistry>,
        ledgers: Arc<LedgerSet>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        self.flush_once(&stats, &registry, &ledgers);
                    }
                }
            }
            self.flush_once(&stats, &registry, &ledgers);
        })
    }

    fn flush_once(&self, stats: &StatsStore, registry: &HealthRegistry, ledgers: &LedgerSet) {
        if let Err(e) = self.write(stats, registry) {
            tracing::warn!(error = %e, path = %self.path.display(), "Progress snapshot failed");
        }
        if let Err(e) = ledgers.flush_json() {
            tracing::warn!(error = %e, "Ledger JSON flush failed");
        }
        registry.flush(false);
    }
}
