//! Joint health registry for TLS fingerprints, proxies, and the proxyless
//! rate-limit flag.
//!
//! All mutable health state lives behind one mutex, held only for the
//! duration of a counter update, never across I/O. Persistence serializes a
//! snapshot under the lock and writes it after the lock is released.

mod fingerprint;
mod proxy;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::outcome::Outcome;

pub use fingerprint::{FingerprintHealth, PoolAction};
pub use proxy::{ProxyHealth, ProxyHealthSnapshot};

use fingerprint::FingerprintPool;
use proxy::ProxyPool;

/// Successive flushes of the health file are spaced at least this far apart;
/// blacklist events flush unconditionally.
const FLUSH_MIN_INTERVAL: Duration = Duration::from_secs(15);

/// On-disk shape of the never-success file.
#[derive(Debug, Serialize, Deserialize)]
struct BlacklistFile {
    never_success_tls: Vec<String>,
    timestamp: String,
}

/// On-disk shape of the health file.
#[derive(Debug, Serialize, Deserialize)]
struct HealthFile {
    health: BTreeMap<String, FingerprintHealth>,
    timestamp: String,
}

/// Where fingerprint state is persisted across runs.
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    pub blacklist: PathBuf,
    pub health: PathBuf,
}

/// Whether a proxyless attempt is currently allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxylessGate {
    /// No rate limit recorded; direct attempts are fine.
    Open,
    /// Rate limited and inside the recheck window; use a proxy.
    Limited,
    /// Recheck interval elapsed; issue one proxyless probe.
    Probe,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub proxyless_rate_limited: bool,
    pub seconds_until_recheck: Option<u64>,
}

struct RateLimitState {
    proxyless_rate_limited: bool,
    next_recheck: Option<Instant>,
    recheck_interval: Duration,
}

struct RegistryInner {
    fingerprints: FingerprintPool,
    proxies: ProxyPool,
    rate_limit: RateLimitState,
    last_flush: Option<Instant>,
    dirty: bool,
}

pub struct HealthRegistry {
    inner: Mutex<RegistryInner>,
    paths: Option<RegistryPaths>,
}

impl HealthRegistry {
    /// Build a registry from the given label pool and proxy list, loading the
    /// persisted blacklist and health counters when paths are supplied.
    pub fn new(
        labels: Vec<String>,
        proxies: Vec<String>,
        paths: Option<RegistryPaths>,
    ) -> Result<Self, HarvestError> {
        let (never_success, health) = match &paths {
            Some(p) => (load_blacklist(&p.blacklist), load_health(&p.health)),
            None => (BTreeSet::new(), BTreeMap::new()),
        };

        let dropped = never_success.len();
        if dropped > 0 {
            tracing::info!(
                blacklisted = dropped,
                "Excluding persistently blacklisted fingerprints from the pool"
            );
        }

        Ok(Self {
            inner: Mutex::new(RegistryInner {
                fingerprints: FingerprintPool::new(labels, never_success, health),
                proxies: ProxyPool::new(proxies),
                rate_limit: RateLimitState {
                    proxyless_rate_limited: false,
                    next_recheck: None,
                    recheck_interval: Duration::from_secs(60),
                },
                last_flush: None,
                dirty: false,
            }),
            paths,
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry mutex");
            poisoned.into_inner()
        })
    }

    /// Uniform pick over the active fingerprint pool.
    pub fn pick_fingerprint(&self) -> Result<String, HarvestError> {
        self.lock_inner().fingerprints.pick().ok_or_else(|| {
            HarvestError::PoolExhausted(
                "no valid TLS fingerprints remaining; delete the never-success file to retry them"
                    .into(),
            )
        })
    }

    pub fn pick_proxy(&self) -> Option<String> {
        self.lock_inner().proxies.pick(Instant::now())
    }

    pub fn has_proxies(&self) -> bool {
        !self.lock_inner().proxies.is_empty()
    }

    pub fn active_fingerprint_count(&self) -> usize {
        self.lock_inner().fingerprints.active_len()
    }

    /// Record an attempt outcome against the fingerprint that produced it.
    /// Blacklist and demotion decisions happen here; the blacklist is
    /// persisted immediately.
    pub fn report_fingerprint(&self, label: &str, outcome: &Outcome) {
        let action = {
            let mut inner = self.lock_inner();
            if outcome.is_success() {
                inner.fingerprints.record_success(label);
                inner.dirty = true;
                PoolAction::None
            } else {
                let action = inner.fingerprints.record_failure(label, outcome);
                inner.dirty = true;
                action
            }
        };

        match action {
            PoolAction::Blacklisted => {
                tracing::warn!(fingerprint = %label, "Fingerprint blacklisted");
                self.flush(true);
            }
            PoolAction::Demoted => {
                tracing::warn!(fingerprint = %label, "Fingerprint demoted for this run");
                self.flush(false);
            }
            PoolAction::None => self.flush(false),
        }
    }

    /// Record an attempt outcome against the proxy that carried it.
    pub fn report_proxy(&self, url: &str, outcome: &Outcome) {
        let mut inner = self.lock_inner();
        if outcome.is_success() {
            inner.proxies.record_success(url);
        } else {
            inner.proxies.record_failure(url, outcome, Instant::now());
            if inner.proxies.is_blacklisted(url) {
                tracing::warn!(proxy = %url, reason = outcome.reason(), "Proxy blacklisted");
            }
        }
    }

    pub fn proxy_is_blacklisted(&self, url: &str) -> bool {
        self.lock_inner().proxies.is_blacklisted(url)
    }

    /// Gate for proxyless attempts under the shared rate-limit flag.
    pub fn proxyless_gate(&self) -> ProxylessGate {
        let mut inner = self.lock_inner();
        if !inner.rate_limit.proxyless_rate_limited {
            return ProxylessGate::Open;
        }
        let now = Instant::now();
        match inner.rate_limit.next_recheck {
            Some(at) if now < at => ProxylessGate::Limited,
            _ => {
                // One probe per recheck interval; push the window forward so
                // concurrent workers don't all probe at once.
                let interval = inner.rate_limit.recheck_interval;
                inner.rate_limit.next_recheck = Some(now + interval);
                ProxylessGate::Probe
            }
        }
    }

    pub fn set_proxyless_rate_limited(&self, recheck_after: Duration) {
        let mut inner = self.lock_inner();
        inner.rate_limit.proxyless_rate_limited = true;
        inner.rate_limit.next_recheck = Some(Instant::now() + recheck_after);
        inner.rate_limit.recheck_interval = recheck_after.max(Duration::from_secs(1));
        tracing::warn!(
            recheck_secs = recheck_after.as_secs(),
            "Proxyless requests rate limited; escalating to proxies"
        );
    }

    pub fn clear_proxyless_rate_limited(&self) {
        let mut inner = self.lock_inner();
        if inner.rate_limit.proxyless_rate_limited {
            inner.rate_limit.proxyless_rate_limited = false;
            inner.rate_limit.next_recheck = None;
            tracing::info!("Proxyless rate limit lifted");
        }
    }

    pub fn fingerprint_snapshot(&self) -> BTreeMap<String, FingerprintHealth> {
        self.lock_inner().fingerprints.health().clone()
    }

    pub fn blacklisted_fingerprints(&self) -> Vec<String> {
        self.lock_inner()
            .fingerprints
            .never_success()
            .iter()
            .cloned()
            .collect()
    }

    pub fn proxy_snapshot(&self) -> BTreeMap<String, ProxyHealthSnapshot> {
        self.lock_inner().proxies.snapshot()
    }

    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        let inner = self.lock_inner();
        let now = Instant::now();
        RateLimitSnapshot {
            proxyless_rate_limited: inner.rate_limit.proxyless_rate_limited,
            seconds_until_recheck: inner
                .rate_limit
                .next_recheck
                .map(|at| at.saturating_duration_since(now).as_secs()),
        }
    }

    /// Persist the blacklist and health counters. Serialization happens under
    /// the lock; file writes happen after it is released. Throttled unless
    /// `force` (blacklist events force).
    pub fn flush(&self, force: bool) {
        let Some(paths) = &self.paths else {
            return;
        };

        let payload = {
            let mut inner = self.lock_inner();
            if !inner.dirty {
                return;
            }
            let now = Instant::now();
            if !force
                && let Some(last) = inner.last_flush
                && now.duration_since(last) < FLUSH_MIN_INTERVAL
            {
                return;
            }
            inner.last_flush = Some(now);
            inner.dirty = false;

            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let blacklist = BlacklistFile {
                never_success_tls: inner.fingerprints.never_success().iter().cloned().collect(),
                timestamp: timestamp.clone(),
            };
            let health = HealthFile {
                health: inner.fingerprints.health().clone(),
                timestamp,
            };
            (blacklist, health)
        };

        if let Err(e) = crate::util::write_json_atomic(&paths.blacklist, &payload.0) {
            tracing::warn!(error = %e, path = %paths.blacklist.display(), "Failed to persist blacklist");
        }
        if let Err(e) = crate::util::write_json_atomic(&paths.health, &payload.1) {
            tracing::warn!(error = %e, path = %paths.health.display(), "Failed to persist fingerprint health");
        }
    }
}

fn load_blacklist(path: &Path) -> BTreeSet<String> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<BlacklistFile>(&content)
            .map(|f| f.never_success_tls.into_iter().collect())
            .unwrap_or_default(),
        Err(_) => BTreeSet::new(),
    }
}

fn load_health(path: &Path) -> BTreeMap<String, FingerprintHealth> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<HealthFile>(&content)
            .map(|f| f.health)
            .unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    }
}
