//! Per-fingerprint health tracking and the persistent never-success list.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::outcome::{Outcome, TransportKind};
use crate::util;

/// A never-successful fingerprint is demoted for the rest of the run once it
/// reaches this failure streak (and at least as many total failures).
const DEMOTE_AFTER_CONSECUTIVE: u32 = 8;
const MIN_FAILURES_BEFORE_DEMOTE: u64 = 8;

/// Lifetime counters for one ClientHello profile. Serialized into the health
/// file and reloaded across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FingerprintHealth {
    pub success: u64,
    pub fail: u64,
    pub consecutive_failures: u32,
    pub ever_succeeded: bool,
    pub block: u64,
    pub exception: u64,
    pub timeout: u64,
    pub connect: u64,
    pub tls: u64,
    pub reset: u64,
    pub rate_limited: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

/// What a failure report did to the fingerprint's pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    None,
    /// Removed from the active pool for this run only.
    Demoted,
    /// Added to the persistent never-success list.
    Blacklisted,
}

pub(crate) struct FingerprintPool {
    active: Vec<String>,
    never_success: BTreeSet<String>,
    health: BTreeMap<String, FingerprintHealth>,
}

impl FingerprintPool {
    /// Active pool = supplied labels minus the persisted never-success set.
    pub fn new(
        labels: Vec<String>,
        never_success: BTreeSet<String>,
        health: BTreeMap<String, FingerprintHealth>,
    ) -> Self {
        let active = labels
            .into_iter()
            .filter(|l| !never_success.contains(l))
            .collect();
        Self {
            active,
            never_success,
            health,
        }
    }

    pub fn pick(&self) -> Option<String> {
        if self.active.is_empty() {
            return None;
        }
        Some(self.active[util::pick_index(self.active.len())].clone())
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, label: &str) -> bool {
        self.active.iter().any(|l| l == label)
    }

    pub fn never_success(&self) -> &BTreeSet<String> {
        &self.never_success
    }

    pub fn health(&self) -> &BTreeMap<String, FingerprintHealth> {
        &self.health
    }

    pub fn record_success(&mut self, label: &str) {
        let h = self.health.entry(label.to_string()).or_default();
        h.success += 1;
        h.ever_succeeded = true;
        h.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, label: &str, outcome: &Outcome) -> PoolAction {
        let reason = outcome.reason();
        let h = self.health.entry(label.to_string()).or_default();
        h.fail += 1;
        h.consecutive_failures += 1;
        h.last_failure_reason = Some(reason.to_string());
        match outcome {
            Outcome::Blocked => h.block += 1,
            Outcome::RateLimited { .. } => h.rate_limited += 1,
            Outcome::Timeout => {
                h.timeout += 1;
                h.exception += 1;
            }
            Outcome::Transport(kind) => {
                h.exception += 1;
                match kind {
                    TransportKind::Connect => h.connect += 1,
                    TransportKind::Tls => h.tls += 1,
                    TransportKind::Reset => h.reset += 1,
                    TransportKind::Other => {}
                }
            }
            Outcome::FingerprintUnsupported => h.exception += 1,
            Outcome::PermanentFailure { .. } => {}
            Outcome::Success(_) => {}
        }

        if matches!(outcome, Outcome::FingerprintUnsupported) {
            self.disable(label, reason);
            return PoolAction::Blacklisted;
        }

        let h = &self.health[label];
        if !h.ever_succeeded
            && h.fail >= MIN_FAILURES_BEFORE_DEMOTE
            && h.consecutive_failures >= DEMOTE_AFTER_CONSECUTIVE
            && self.is_active(label)
        {
            self.active.retain(|l| l != label);
            return PoolAction::Demoted;
        }

        PoolAction::None
    }

    fn disable(&mut self, label: &str, reason: &str) {
        self.never_success.insert(label.to_string());
        self.active.retain(|l| l != label);
        let h = self.health.entry(label.to_string()).or_default();
        h.disabled_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(labels: &[&str]) -> FingerprintPool {
        FingerprintPool::new(
            labels.iter().map(|s| s.to_string()).collect(),
            BTreeSet::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn blacklist_filters_initial_pool() {
        let never: BTreeSet<String> = ["chrome100".to_string()].into();
        let pool = FingerprintPool::new(
            vec!["chrome100".into(), "chrome120".into()],
            never,
            BTreeMap::new(),
        );
        assert_eq!(pool.active_len(), 1);
        assert!(!pool.is_active("chrome100"));
    }

    #[test]
    fn unsupported_blacklists_immediately() {
        let mut pool = pool(&["chrome120", "opera95"]);
        let action = pool.record_failure("opera95", &Outcome::FingerprintUnsupported);
        assert_eq!(action, PoolAction::Blacklisted);
        assert!(!pool.is_active("opera95"));
        assert!(pool.never_success().contains("opera95"));
        assert_eq!(
            pool.health()["opera95"].disabled_reason.as_deref(),
            Some("not_supported")
        );
    }

    #[test]
    fn never_successful_streak_demotes_without_blacklisting() {
        let mut pool = pool(&["chrome120", "firefox117"]);
        for i in 0..8 {
            let action = pool.record_failure("firefox117", &Outcome::Blocked);
            if i < 7 {
                assert_eq!(action, PoolAction::None);
            } else {
                assert_eq!(action, PoolAction::Demoted);
            }
        }
        assert!(!pool.is_active("firefox117"));
        assert!(!pool.never_success().contains("firefox117"));
    }

    #[test]
    fn success_resets_streak_and_prevents_demotion() {
        let mut pool = pool(&["chrome120"]);
        for _ in 0..7 {
            pool.record_failure("chrome120", &Outcome::Blocked);
        }
        pool.record_success("chrome120");
        for _ in 0..8 {
            let action = pool.record_failure("chrome120", &Outcome::Blocked);
            assert_eq!(action, PoolAction::None);
        }
        assert!(pool.is_active("chrome120"));
        assert!(pool.health()["chrome120"].ever_succeeded);
    }

    #[test]
    fn outcome_buckets_are_counted() {
        let mut pool = pool(&["chrome120"]);
        pool.record_failure("chrome120", &Outcome::Timeout);
        pool.record_failure("chrome120", &Outcome::Transport(TransportKind::Connect));
        pool.record_failure("chrome120", &Outcome::RateLimited { status: 429 });
        let h = &pool.health()["chrome120"];
        assert_eq!(h.timeout, 1);
        assert_eq!(h.connect, 1);
        assert_eq!(h.rate_limited, 1);
        assert_eq!(h.fail, 3);
    }

    #[test]
    fn pick_returns_none_when_empty() {
        let mut pool = pool(&["chrome120"]);
        pool.record_failure("chrome120", &Outcome::FingerprintUnsupported);
        assert_eq!(pool.pick(), None);
    }
}
