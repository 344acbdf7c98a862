//! The per-unit retry loop.
//!
//! A worker takes one unit id at a time and drives it to a terminal state:
//! successful, failed, exception, or blocked. Every recoverable condition is
//! absorbed here: the dispatcher only ever sees a completed unit or a
//! process-fatal error (exhausted fingerprint pool).

use std::sync::Arc;

use tokio::time::sleep;

use crate::classifier::classify;
use crate::config::{Endpoint, StageConfig};
use crate::error::HarvestError;
use crate::ledger::{Category, LedgerSet, RawDumps};
use crate::outcome::{Outcome, TransportKind};
use crate::queue::WorkQueue;
use crate::registry::{HealthRegistry, ProxylessGate};
use crate::sink::RecordStore;
use crate::stats::StatsStore;
use crate::transport::{Identity, Transport};
use crate::util;

/// Terminal state of a processed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Successful,
    Failed,
    Exception,
    Blocked,
    /// Already successful in a previous run or a concurrent worker.
    Skipped,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Successful => "successful",
            Disposition::Failed => "failed",
            Disposition::Exception => "exception",
            Disposition::Blocked => "blocked",
            Disposition::Skipped => "skipped",
        }
    }
}

/// What happened to one unit, as returned to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub id: String,
    pub disposition: Disposition,
    /// Charged attempts; unsupported-fingerprint retries are free.
    pub attempts: u32,
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    UnitStarted {
        id: &'a str,
    },
    UnitSkipped {
        id: &'a str,
    },
    AttemptIssued {
        id: &'a str,
        attempt: u32,
        max_attempts: u32,
        fingerprint: &'a str,
        proxied: bool,
    },
    Retrying {
        id: &'a str,
        attempt: u32,
        reason: &'a str,
    },
    FingerprintBlacklisted {
        fingerprint: &'a str,
    },
    UnitSucceeded {
        id: &'a str,
        attempts: u32,
    },
    UnitFailed {
        id: &'a str,
        disposition: Disposition,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::UnitStarted { id } => {
                tracing::debug!(unit = %id, "Unit started");
            }
            WorkerEvent::UnitSkipped { id } => {
                tracing::debug!(unit = %id, "Unit already successful, skipping");
            }
            WorkerEvent::AttemptIssued {
                id,
                attempt,
                max_attempts,
                fingerprint,
                proxied,
            } => {
                tracing::debug!(
                    unit = %id,
                    attempt = format_args!("{attempt}/{max_attempts}"),
                    %fingerprint,
                    %proxied,
                    "Issuing attempt"
                );
            }
            WorkerEvent::Retrying {
                id,
                attempt,
                reason,
            } => {
                tracing::info!(unit = %id, %attempt, %reason, "Retrying");
            }
            WorkerEvent::FingerprintBlacklisted { fingerprint } => {
                tracing::warn!(%fingerprint, "Unsupported fingerprint blacklisted, retrying free");
            }
            WorkerEvent::UnitSucceeded { id, attempts } => {
                tracing::info!(unit = %id, %attempts, "Unit succeeded");
            }
            WorkerEvent::UnitFailed { id, disposition } => {
                tracing::warn!(unit = %id, disposition = disposition.as_str(), "Unit failed");
            }
        }
    }
}

/// Tracks what the previous charged attempt produced, for exhaustion routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAttempt {
    BlockLike,
    Fault,
}

/// Executes the retry loop for single units.
#[derive(Clone)]
pub struct Worker<T, S>
where
    T: Transport,
    S: RecordStore,
{
    transport: T,
    store: S,
    queue: WorkQueue,
    registry: Arc<HealthRegistry>,
    ledgers: Arc<LedgerSet>,
    dumps: RawDumps,
    stats: Arc<StatsStore>,
    config: StageConfig,
    endpoint: Endpoint,
}

impl<T, S> Worker<T, S>
where
    T: Transport,
    S: RecordStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: T,
        store: S,
        queue: WorkQueue,
        registry: Arc<HealthRegistry>,
        ledgers: Arc<LedgerSet>,
        dumps: RawDumps,
        stats: Arc<StatsStore>,
        config: StageConfig,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            transport,
            store,
            queue,
            registry,
            ledgers,
            dumps,
            stats,
            config,
            endpoint,
        }
    }

    /// Drive one unit to a terminal state.
    ///
    /// The only error that escapes is an exhausted fingerprint pool, which is
    /// process-fatal by design.
    pub async fn process<R: WorkerReporter>(
        &self,
        id: &str,
        reporter: &R,
    ) -> Result<UnitReport, HarvestError> {
        if self.queue.is_done(id) {
            self.stats.incr_skipped();
            reporter.report(WorkerEvent::UnitSkipped { id });
            return Ok(UnitReport {
                id: id.to_string(),
                disposition: Disposition::Skipped,
                attempts: 0,
            });
        }

        reporter.report(WorkerEvent::UnitStarted { id });
        let url = self.endpoint.url_for(id);

        let mut attempt: u32 = 1;
        let mut last: Option<LastAttempt> = None;
        let mut last_fault: Option<String> = None;

        let disposition = loop {
            if attempt > self.config.max_attempts {
                break self.finish_exhausted(id, last, last_fault.as_deref());
            }

            sleep(util::jitter(self.config.min_delay, self.config.max_delay)).await;

            let fingerprint = self.registry.pick_fingerprint()?;
            let proxy = self.select_proxy(attempt);
            let proxied = proxy.is_some();
            let identity = Identity {
                fingerprint: fingerprint.clone(),
                proxy,
            };
            let timeout = if proxied {
                self.config.proxy_timeout
            } else {
                self.config.direct_timeout
            };

            reporter.report(WorkerEvent::AttemptIssued {
                id,
                attempt,
                max_attempts: self.config.max_attempts,
                fingerprint: &fingerprint,
                proxied,
            });

            let result = self.transport.get(&url, &identity, timeout).await;
            let fault_text = result.as_ref().err().map(|f| f.message.clone());
            let outcome = classify(result);

            self.registry.report_fingerprint(&fingerprint, &outcome);
            if let Some(proxy_url) = &identity.proxy {
                self.registry.report_proxy(proxy_url, &outcome);
            }

            match outcome {
                Outcome::Success(body) => {
                    if let Err(e) = self.store.put(id, &body).await {
                        tracing::error!(unit = %id, error = %e, "Record store write failed");
                        self.dump(id, &e.to_string());
                        self.append(Category::Exception, id);
                        self.stats.incr_exception();
                        break Disposition::Exception;
                    }
                    if !proxied && self.stage_uses_proxies() {
                        self.registry.clear_proxyless_rate_limited();
                    }
                    self.append(Category::Successful, id);
                    self.queue.mark_done(id);
                    self.stats.incr_success();
                    reporter.report(WorkerEvent::UnitSucceeded {
                        id,
                        attempts: attempt,
                    });
                    break Disposition::Successful;
                }

                Outcome::RateLimited { status } => {
                    self.stats.incr_rate_limited(status);
                    self.stats.incr_retries();
                    if !proxied && self.stage_uses_proxies() {
                        self.registry
                            .set_proxyless_rate_limited(self.config.rate_limit_recheck);
                    }
                    reporter.report(WorkerEvent::Retrying {
                        id,
                        attempt,
                        reason: "rate_limited",
                    });
                    let backoff = if status == 403 {
                        self.config.forbidden_backoff
                    } else {
                        self.config.rate_limit_backoff
                    };
                    sleep(backoff.delay(attempt)).await;
                    last = Some(LastAttempt::BlockLike);
                    attempt += 1;
                }

                Outcome::Blocked => {
                    self.stats.incr_retries();
                    reporter.report(WorkerEvent::Retrying {
                        id,
                        attempt,
                        reason: "block",
                    });
                    sleep(self.config.block_backoff.delay(attempt)).await;
                    last = Some(LastAttempt::BlockLike);
                    attempt += 1;
                }

                Outcome::Timeout => {
                    self.stats.incr_timeout();
                    self.stats.incr_retries();
                    reporter.report(WorkerEvent::Retrying {
                        id,
                        attempt,
                        reason: "timeout",
                    });
                    sleep(self.config.transport_backoff.delay(attempt)).await;
                    last = Some(LastAttempt::Fault);
                    last_fault = fault_text;
                    attempt += 1;
                }

                Outcome::Transport(kind) => {
                    self.stats.incr_transport(kind);
                    self.stats.incr_retries();
                    if let Some(bucket) = transport_bucket(kind) {
                        self.append(bucket, id);
                    }
                    reporter.report(WorkerEvent::Retrying {
                        id,
                        attempt,
                        reason: kind.as_str(),
                    });
                    sleep(self.config.transport_backoff.delay(attempt)).await;
                    last = Some(LastAttempt::Fault);
                    last_fault = fault_text;
                    attempt += 1;
                }

                Outcome::FingerprintUnsupported => {
                    reporter.report(WorkerEvent::FingerprintBlacklisted {
                        fingerprint: &fingerprint,
                    });
                    // Free retry: the attempt budget is for origin responses,
                    // not for profiles the runtime cannot emit.
                    sleep(self.config.unsupported_pause).await;
                }

                Outcome::PermanentFailure { status, snippet } => {
                    tracing::warn!(unit = %id, %status, "Permanent failure");
                    self.dump(id, &snippet);
                    self.append(Category::Failed, id);
                    self.stats.incr_fail();
                    break Disposition::Failed;
                }
            }
        };

        self.stats.incr_total();
        if !matches!(disposition, Disposition::Successful) {
            reporter.report(WorkerEvent::UnitFailed { id, disposition });
        }

        Ok(UnitReport {
            id: id.to_string(),
            disposition,
            attempts: attempt.min(self.config.max_attempts),
        })
    }

    /// Route an exhausted unit to its terminal ledger.
    fn finish_exhausted(
        &self,
        id: &str,
        last: Option<LastAttempt>,
        last_fault: Option<&str>,
    ) -> Disposition {
        match last {
            Some(LastAttempt::Fault) => {
                if let Some(text) = last_fault {
                    self.dump(id, text);
                }
                self.append(Category::Exception, id);
                self.stats.incr_exception();
                Disposition::Exception
            }
            // Blocked or rate-limited all the way down. A blocked-only
            // terminal is always also a drop.
            _ => {
                self.append(Category::Blocked, id);
                self.append(Category::Dropped, id);
                self.stats.incr_blocked();
                Disposition::Blocked
            }
        }
    }

    fn stage_uses_proxies(&self) -> bool {
        self.config.proxyless_attempts != u32::MAX
    }

    /// Proxy policy: early attempts go direct, later ones through a proxy;
    /// under a proxyless rate limit everything is proxied until the recheck
    /// window opens a single direct probe. No valid proxy means direct.
    fn select_proxy(&self, attempt: u32) -> Option<String> {
        if !self.stage_uses_proxies() || !self.registry.has_proxies() {
            return None;
        }
        match self.registry.proxyless_gate() {
            ProxylessGate::Probe => None,
            ProxylessGate::Limited => self.registry.pick_proxy(),
            ProxylessGate::Open => {
                if attempt <= self.config.proxyless_attempts {
                    None
                } else {
                    self.registry.pick_proxy()
                }
            }
        }
    }

    fn append(&self, category: Category, id: &str) {
        if let Err(e) = self.ledgers.append(category, id) {
            tracing::error!(unit = %id, ledger = category.as_str(), error = %e, "Ledger append failed");
        }
    }

    fn dump(&self, id: &str, text: &str) {
        if let Err(e) = self.dumps.write(id, text) {
            tracing::error!(unit = %id, error = %e, "Raw dump write failed");
        }
    }
}

fn transport_bucket(kind: TransportKind) -> Option<Category> {
    match kind {
        TransportKind::Connect => Some(Category::ConnectError),
        TransportKind::Tls => Some(Category::TlsError),
        TransportKind::Reset => Some(Category::ResetError),
        TransportKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Rig {
        _tmp: TempDir,
        worker: Worker<MockTransport, MemoryStore>,
        transport: MockTransport,
        store: MemoryStore,
        queue: WorkQueue,
        registry: Arc<HealthRegistry>,
        ledgers: Arc<LedgerSet>,
        stats: Arc<StatsStore>,
    }

    fn rig(config: StageConfig, fingerprints: &[&str], proxies: &[&str]) -> Rig {
        let tmp = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let store = MemoryStore::new();
        let queue = WorkQueue::new(Vec::new(), HashSet::new());
        let registry = Arc::new(
            HealthRegistry::new(
                fingerprints.iter().map(|s| s.to_string()).collect(),
                proxies.iter().map(|s| s.to_string()).collect(),
                None,
            )
            .unwrap(),
        );
        let ledgers = Arc::new(LedgerSet::open(tmp.path().join("lists")).unwrap());
        let dumps = RawDumps::open(tmp.path().join("raw")).unwrap();
        let stats = Arc::new(StatsStore::new());
        let worker = Worker::new(
            transport.clone(),
            store.clone(),
            queue.clone(),
            registry.clone(),
            ledgers.clone(),
            dumps,
            stats.clone(),
            config,
            Endpoint::Item {
                base: "https://origin.test/projects".into(),
            },
        );
        Rig {
            _tmp: tmp,
            worker,
            transport,
            store,
            queue,
            registry,
            ledgers,
            stats,
        }
    }

    fn fast_records() -> StageConfig {
        StageConfig::records().without_delays()
    }

    fn fast_pages() -> StageConfig {
        StageConfig::pages().without_delays()
    }

    const URL: &str = "https://origin.test/projects/u1";

    #[tokio::test]
    async fn success_first_attempt_lands_in_sink_and_ledger() {
        let rig = rig(fast_pages(), &["chrome120"], &[]);
        rig.transport.push(URL, ok_json(r#"{"data": 1}"#));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Successful);
        assert_eq!(report.attempts, 1);
        assert_eq!(
            rig.store.get("u1").await.unwrap().as_deref(),
            Some(r#"{"data": 1}"#)
        );
        assert_eq!(rig.ledgers.ids(Category::Successful), vec!["u1".to_string()]);
        assert!(rig.queue.is_done("u1"));
        assert_eq!(rig.stats.snapshot().success, 1);
        assert_eq!(rig.stats.snapshot().total, 1);
    }

    #[tokio::test]
    async fn transient_rate_limit_then_success() {
        let rig = rig(fast_pages(), &["chrome120"], &[]);
        rig.transport.push(URL, status(429, "slow down"));
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Successful);
        assert_eq!(report.attempts, 2);
        let snap = rig.stats.snapshot();
        assert_eq!(snap.rate_limited_429, 1);
        assert_eq!(snap.retries, 1);
        let health = rig.registry.fingerprint_snapshot();
        assert!(health["chrome120"].rate_limited >= 1);
    }

    #[tokio::test]
    async fn unsupported_fingerprint_does_not_consume_attempt_budget() {
        let config = fast_records().with_max_attempts(1);
        let rig = rig(config, &["chrome120", "opera95"], &[]);
        rig.transport
            .push(URL, fault("emulation profile is not supported"));
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Successful);
        assert_eq!(report.attempts, 1);
        assert_eq!(rig.registry.blacklisted_fingerprints().len(), 1);
        assert_eq!(rig.registry.active_fingerprint_count(), 1);
    }

    #[tokio::test]
    async fn all_blocked_lands_in_blocked_and_dropped() {
        let rig = rig(fast_records(), &["chrome120"], &[]);
        for _ in 0..3 {
            rig.transport
                .push(URL, status(200, "<html>Just a moment...</html>"));
        }

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Blocked);
        assert_eq!(rig.ledgers.ids(Category::Blocked), vec!["u1".to_string()]);
        assert_eq!(rig.ledgers.ids(Category::Dropped), vec!["u1".to_string()]);
        assert!(rig.ledgers.ids(Category::Successful).is_empty());
        assert_eq!(rig.store.count().await.unwrap(), 0);
        assert_eq!(rig.stats.snapshot().blocked, 1);
    }

    #[tokio::test]
    async fn permanent_failure_breaks_immediately_with_raw_dump() {
        let rig = rig(fast_records(), &["chrome120"], &[]);
        rig.transport.push(URL, status(502, "Bad Gateway"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Failed);
        assert_eq!(report.attempts, 1);
        assert_eq!(rig.ledgers.ids(Category::Failed), vec!["u1".to_string()]);
        let raw = std::fs::read_to_string(rig._tmp.path().join("raw/u1_raw.txt")).unwrap();
        assert_eq!(raw, "Bad Gateway");
    }

    #[tokio::test]
    async fn exhausted_timeouts_land_in_exception_with_dump() {
        let rig = rig(fast_records(), &["chrome120"], &[]);
        for _ in 0..3 {
            rig.transport.push(URL, fault("timeout: request timed out"));
        }

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Exception);
        assert_eq!(rig.ledgers.ids(Category::Exception), vec!["u1".to_string()]);
        assert_eq!(rig.stats.snapshot().timeout, 3);
        let raw = std::fs::read_to_string(rig._tmp.path().join("raw/u1_raw.txt")).unwrap();
        assert!(raw.contains("timed out"));
    }

    #[tokio::test]
    async fn transport_faults_fill_diagnostic_buckets() {
        let rig = rig(fast_records(), &["chrome120"], &[]);
        rig.transport
            .push(URL, fault("connection failed: refused"));
        rig.transport.push(URL, fault("tls handshake eof"));
        rig.transport.push(URL, fault("connection reset by peer"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Exception);
        assert_eq!(rig.ledgers.ids(Category::ConnectError), vec!["u1".to_string()]);
        assert_eq!(rig.ledgers.ids(Category::TlsError), vec!["u1".to_string()]);
        assert_eq!(rig.ledgers.ids(Category::ResetError), vec!["u1".to_string()]);
        let snap = rig.stats.snapshot();
        assert_eq!(snap.connect_errors, 1);
        assert_eq!(snap.tls_errors, 1);
        assert_eq!(snap.reset_errors, 1);
    }

    #[tokio::test]
    async fn already_done_unit_is_skipped_without_requests() {
        let rig = rig(fast_records(), &["chrome120"], &[]);
        rig.queue.mark_done("u1");

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();

        assert_eq!(report.disposition, Disposition::Skipped);
        assert_eq!(rig.transport.requests().len(), 0);
        assert_eq!(rig.stats.snapshot().skipped, 1);
        assert_eq!(rig.stats.snapshot().total, 0);
    }

    #[tokio::test]
    async fn proxy_escalation_starts_at_third_attempt() {
        let rig = rig(fast_records(), &["chrome120"], &["http://p1:8080"]);
        rig.transport
            .push(URL, status(200, "<html>Just a moment...</html>"));
        rig.transport
            .push(URL, status(200, "<html>Just a moment...</html>"));
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();
        assert_eq!(report.disposition, Disposition::Successful);

        let requests = rig.transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].identity.proxy, None);
        assert_eq!(requests[1].identity.proxy, None);
        assert_eq!(
            requests[2].identity.proxy.as_deref(),
            Some("http://p1:8080")
        );
    }

    #[tokio::test]
    async fn dead_proxy_is_blacklisted_and_next_attempt_goes_direct() {
        let config = fast_records().with_max_attempts(4);
        let rig = rig(config, &["chrome120"], &["http://p1:8080"]);
        rig.transport
            .push(URL, status(200, "<html>Just a moment...</html>"));
        rig.transport
            .push(URL, status(200, "<html>Just a moment...</html>"));
        rig.transport
            .push(URL, fault("connection failed: proxy unreachable"));
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();
        assert_eq!(report.disposition, Disposition::Successful);

        assert!(rig.registry.proxy_is_blacklisted("http://p1:8080"));
        let requests = rig.transport.requests();
        assert!(requests[2].identity.proxy.is_some());
        assert_eq!(requests[3].identity.proxy, None);
    }

    #[tokio::test]
    async fn proxyless_rate_limit_forces_proxy_from_first_attempt() {
        let rig = rig(fast_records(), &["chrome120"], &["http://p1:8080"]);
        rig.registry
            .set_proxyless_rate_limited(Duration::from_secs(60));
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();
        assert_eq!(report.disposition, Disposition::Successful);

        let requests = rig.transport.requests();
        assert_eq!(
            requests[0].identity.proxy.as_deref(),
            Some("http://p1:8080")
        );
    }

    #[tokio::test]
    async fn proxyless_success_clears_rate_limit_flag() {
        let rig = rig(fast_records(), &["chrome120"], &["http://p1:8080"]);
        rig.registry.set_proxyless_rate_limited(Duration::ZERO);
        // Recheck elapsed: the gate grants one direct probe, which succeeds.
        rig.transport.push(URL, ok_json("{}"));

        let report = rig.worker.process("u1", &RecordingReporter::new()).await.unwrap();
        assert_eq!(report.disposition, Disposition::Successful);
        assert_eq!(rig.transport.requests()[0].identity.proxy, None);
        assert!(!rig.registry.rate_limit_snapshot().proxyless_rate_limited);
    }

    #[tokio::test]
    async fn reporter_sees_lifecycle_events() {
        let rig = rig(fast_pages(), &["chrome120"], &[]);
        rig.transport.push(URL, status(429, "slow down"));
        rig.transport.push(URL, ok_json("{}"));
        let reporter = RecordingReporter::new();

        rig.worker.process("u1", &reporter).await.unwrap();

        let events = reporter.events();
        assert!(events.contains(&"UnitStarted".to_string()));
        assert!(events.contains(&"Retrying".to_string()));
        assert!(events.contains(&"UnitSucceeded".to_string()));
    }
}
