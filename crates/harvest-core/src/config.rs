//! Per-stage tuning knobs for the fetch engine.

use std::time::Duration;

use crate::util;

/// Known size of the collection behind the paginated endpoint.
pub const TOTAL_RECORD_COUNT: u64 = 247_187;

/// The origin caps `limit` at 5000.
pub const MAX_PAGE_LIMIT: u32 = 5000;

/// Number of pages needed to sweep the whole collection at a given limit.
pub fn max_pages(limit: u32) -> u32 {
    ((TOTAL_RECORD_COUNT + limit as u64 - 1) / limit as u64) as u32
}

/// How a unit id becomes a request URL.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// `{base}?page={id}&limit={limit}`
    Paged { base: String, limit: u32 },
    /// `{base}/{id}`
    Item { base: String },
}

impl Endpoint {
    pub fn url_for(&self, id: &str) -> String {
        match self {
            Endpoint::Paged { base, limit } => format!("{base}?page={id}&limit={limit}"),
            Endpoint::Item { base } => format!("{base}/{id}"),
        }
    }
}

/// Backoff shape applied between attempts after a given outcome.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `step * attempt`, growing linearly with the attempt number.
    Linear(Duration),
    /// Uniform sample from `[min, max]`.
    Range(Duration, Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Linear(step) => *step * attempt,
            Backoff::Range(min, max) => util::jitter(*min, *max),
        }
    }

    pub const ZERO: Backoff = Backoff::Linear(Duration::ZERO);
}

/// Tuning for one extraction stage.
///
/// The two stages share the engine but differ in pool size, retry budget,
/// pacing, and proxy policy.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Attempts per unit; `FingerprintUnsupported` outcomes do not count.
    pub max_attempts: u32,
    /// Random inter-attempt delay sampled before every HTTP attempt.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Request timeout for direct (proxyless) attempts.
    pub direct_timeout: Duration,
    /// Request timeout for proxied attempts; shorter so bad proxies fail fast.
    pub proxy_timeout: Duration,
    /// Attempts served without a proxy before escalating; `u32::MAX`
    /// disables proxies for the stage.
    pub proxyless_attempts: u32,
    /// How long a proxyless rate limit holds before a proxyless re-probe.
    pub rate_limit_recheck: Duration,
    /// Backoff after 429 / rate-limited interstitials.
    pub rate_limit_backoff: Backoff,
    /// Backoff after a bare 403 treated as a rate-limit signal.
    pub forbidden_backoff: Backoff,
    /// Backoff after an anti-bot block.
    pub block_backoff: Backoff,
    /// Backoff after timeouts and transport faults.
    pub transport_backoff: Backoff,
    /// Pause before re-selecting after an unsupported fingerprint.
    pub unsupported_pause: Duration,
}

impl StageConfig {
    /// Page-sweep stage: few workers, generous retries, no proxies.
    pub fn pages() -> Self {
        Self {
            workers: 10,
            max_attempts: 4,
            min_delay: Duration::from_millis(800),
            max_delay: Duration::from_millis(2500),
            direct_timeout: Duration::from_secs(30),
            proxy_timeout: Duration::from_secs(30),
            proxyless_attempts: u32::MAX,
            rate_limit_recheck: Duration::from_secs(60),
            rate_limit_backoff: Backoff::Linear(Duration::from_secs(5)),
            forbidden_backoff: Backoff::Linear(Duration::from_secs(5)),
            block_backoff: Backoff::Linear(Duration::from_secs(5)),
            transport_backoff: Backoff::Linear(Duration::from_secs(2)),
            unsupported_pause: Duration::from_millis(500),
        }
    }

    /// Per-record stage: wide pool, fail fast, proxy escalation.
    pub fn records() -> Self {
        Self {
            workers: 50,
            max_attempts: 3,
            min_delay: Duration::from_millis(1800),
            max_delay: Duration::from_millis(4000),
            direct_timeout: Duration::from_secs(20),
            proxy_timeout: Duration::from_secs(10),
            proxyless_attempts: 2,
            rate_limit_recheck: Duration::from_secs(60),
            rate_limit_backoff: Backoff::Range(Duration::from_secs(30), Duration::from_secs(60)),
            forbidden_backoff: Backoff::Range(Duration::from_secs(5), Duration::from_secs(10)),
            block_backoff: Backoff::Range(Duration::from_secs(2), Duration::from_secs(5)),
            transport_backoff: Backoff::Linear(Duration::from_secs(2)),
            unsupported_pause: Duration::from_millis(500),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Zero out every sleep. Test-only pacing.
    pub fn without_delays(mut self) -> Self {
        self.min_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self.rate_limit_backoff = Backoff::ZERO;
        self.forbidden_backoff = Backoff::ZERO;
        self.block_backoff = Backoff::ZERO;
        self.transport_backoff = Backoff::ZERO;
        self.unsupported_pause = Duration::ZERO;
        self
    }
}
