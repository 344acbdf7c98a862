//! Run-local proxy health tracking and selection.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::outcome::{Outcome, TransportKind};
use crate::util;

/// A proxy with this many consecutive failures and no success ever is
/// blacklisted on sight.
const BLACKLIST_AFTER_CONSECUTIVE: u32 = 2;

/// Error-rate window: more than `MAX_RECENT_ERRORS` faults inside
/// `ERROR_WINDOW` takes a proxy out of rotation until the window drains.
const ERROR_WINDOW: Duration = Duration::from_secs(30);
const MAX_RECENT_ERRORS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct ProxyHealth {
    pub success: u64,
    pub fail: u64,
    pub block: u64,
    pub exception: u64,
    pub timeout: u64,
    pub rate_limited: u64,
    pub consecutive_failures: u32,
    pub blacklisted: bool,
    recent_errors: VecDeque<Instant>,
}

/// Serializable view for the progress snapshot (the error window is
/// monotonic-clock state and stays internal).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProxyHealthSnapshot {
    pub success: u64,
    pub fail: u64,
    pub block: u64,
    pub exception: u64,
    pub timeout: u64,
    pub rate_limited: u64,
    pub consecutive_failures: u32,
    pub blacklisted: bool,
}

impl ProxyHealth {
    fn snapshot(&self) -> ProxyHealthSnapshot {
        ProxyHealthSnapshot {
            success: self.success,
            fail: self.fail,
            block: self.block,
            exception: self.exception,
            timeout: self.timeout,
            rate_limited: self.rate_limited,
            consecutive_failures: self.consecutive_failures,
            blacklisted: self.blacklisted,
        }
    }

    fn recent_error_count(&self, now: Instant) -> usize {
        self.recent_errors
            .iter()
            .filter(|t| now.duration_since(**t) < ERROR_WINDOW)
            .count()
    }

    fn push_error(&mut self, now: Instant) {
        self.recent_errors.push_back(now);
        while let Some(front) = self.recent_errors.front() {
            if now.duration_since(*front) >= ERROR_WINDOW {
                self.recent_errors.pop_front();
            } else {
                break;
            }
        }
    }
}

pub(crate) struct ProxyPool {
    proxies: Vec<(String, ProxyHealth)>,
}

impl ProxyPool {
    pub fn new(urls: Vec<String>) -> Self {
        let proxies = urls
            .into_iter()
            .map(|u| (u, ProxyHealth::default()))
            .collect();
        Self { proxies }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Select a proxy: skip blacklisted entries, blacklist never-successful
    /// repeat offenders on sight, skip proxies with a hot error window, and
    /// prefer proxies that have delivered before.
    pub fn pick(&mut self, now: Instant) -> Option<String> {
        let mut valid: Vec<usize> = Vec::new();
        for (idx, (_, health)) in self.proxies.iter_mut().enumerate() {
            if health.blacklisted {
                continue;
            }
            if health.consecutive_failures >= BLACKLIST_AFTER_CONSECUTIVE && health.success == 0 {
                health.blacklisted = true;
                continue;
            }
            if health.recent_error_count(now) > MAX_RECENT_ERRORS {
                continue;
            }
            valid.push(idx);
        }

        let proven: Vec<usize> = valid
            .iter()
            .copied()
            .filter(|&i| self.proxies[i].1.success > 0)
            .collect();
        let candidates = if proven.is_empty() { &valid } else { &proven };
        if candidates.is_empty() {
            return None;
        }
        let idx = candidates[util::pick_index(candidates.len())];
        Some(self.proxies[idx].0.clone())
    }

    pub fn record_success(&mut self, url: &str) {
        if let Some(health) = self.health_mut(url) {
            health.success += 1;
            health.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&mut self, url: &str, outcome: &Outcome, now: Instant) {
        let Some(health) = self.health_mut(url) else {
            return;
        };
        health.fail += 1;
        health.consecutive_failures += 1;
        health.push_error(now);
        match outcome {
            Outcome::Blocked => health.block += 1,
            Outcome::RateLimited { .. } => health.rate_limited += 1,
            Outcome::Timeout => {
                health.timeout += 1;
                health.exception += 1;
            }
            Outcome::Transport(kind) => {
                health.exception += 1;
                // Connection-level failures mean the proxy itself is dead.
                if kind.is_connection_failure() {
                    health.blacklisted = true;
                }
            }
            _ => {}
        }
    }

    pub fn blacklist(&mut self, url: &str) {
        if let Some(health) = self.health_mut(url) {
            health.blacklisted = true;
        }
    }

    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.proxies
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, h)| h.blacklisted)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProxyHealthSnapshot> {
        self.proxies
            .iter()
            .map(|(url, health)| (url.clone(), health.snapshot()))
            .collect()
    }

    fn health_mut(&mut self, url: &str) -> Option<&mut ProxyHealth> {
        self.proxies
            .iter_mut()
            .find(|(u, _)| u == url)
            .map(|(_, h)| h)
    }
}
