//! End-to-end engine scenarios against a scripted mock origin.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use harvest_core::testutil::*;
use harvest_core::{
    Category, Dispatcher, Endpoint, HealthRegistry, LedgerSet, RawDumps, RecordStore,
    RegistryPaths, StageConfig, StatsStore, WorkQueue, Worker,
};

const BASE: &str = "https://origin.test/api";

fn url(id: &str) -> String {
    format!("{BASE}/{id}")
}

struct Harness {
    tmp: TempDir,
    transport: MockTransport,
    store: MemoryStore,
    ledgers: Arc<LedgerSet>,
    registry: Arc<HealthRegistry>,
    stats: Arc<StatsStore>,
    dispatcher: Dispatcher<MockTransport, MemoryStore>,
}

impl Harness {
    fn registry_paths(dir: &std::path::Path) -> RegistryPaths {
        RegistryPaths {
            blacklist: dir.join("never_success_tls.json"),
            health: dir.join("impersonate_health.json"),
        }
    }

    /// Build a full engine over a scripted transport. Reuses any ledgers and
    /// registry files already present in `tmp`, which is what a process
    /// restart does.
    fn build(
        tmp: TempDir,
        units: &[&str],
        fingerprints: &[&str],
        proxies: &[&str],
        config: StageConfig,
    ) -> Self {
        let transport = MockTransport::new();
        let store = MemoryStore::new();
        let ledgers = Arc::new(LedgerSet::open(tmp.path().join("lists")).unwrap());
        let dumps = RawDumps::open(tmp.path().join("raw")).unwrap();
        let stats = Arc::new(StatsStore::new());
        let registry = Arc::new(
            HealthRegistry::new(
                fingerprints.iter().map(|s| s.to_string()).collect(),
                proxies.iter().map(|s| s.to_string()).collect(),
                Some(Self::registry_paths(tmp.path())),
            )
            .unwrap(),
        );

        let completed: HashSet<String> =
            ledgers.ids(Category::Successful).into_iter().collect();
        let queue = WorkQueue::new(units.iter().map(|s| s.to_string()), completed);

        let workers = config.workers;
        let worker = Worker::new(
            transport.clone(),
            store.clone(),
            queue.clone(),
            registry.clone(),
            ledgers.clone(),
            dumps,
            stats.clone(),
            config,
            Endpoint::Item { base: BASE.into() },
        );
        let dispatcher = Dispatcher::new(worker, queue, workers);

        Self {
            tmp,
            transport,
            store,
            ledgers,
            registry,
            stats,
            dispatcher,
        }
    }

    fn new(units: &[&str], fingerprints: &[&str], config: StageConfig) -> Self {
        Self::build(TempDir::new().unwrap(), units, fingerprints, &[], config)
    }

    async fn run(&self) {
        self.dispatcher
            .run(CancellationToken::new(), Arc::new(RecordingReporter::new()))
            .await
            .unwrap();
    }

    /// Invariant: every attempted unit appears in exactly one terminal ledger.
    fn assert_one_terminal_ledger(&self, units: &[&str]) {
        let terminal = [
            Category::Successful,
            Category::Failed,
            Category::Exception,
            Category::Blocked,
        ];
        for unit in units {
            let hits: Vec<&str> = terminal
                .iter()
                .filter(|c| self.ledgers.ids(**c).iter().any(|id| id == unit))
                .map(|c| c.as_str())
                .collect();
            assert_eq!(
                hits.len(),
                1,
                "unit {unit} is in {hits:?}, expected exactly one terminal ledger"
            );
        }
    }
}

fn fast() -> StageConfig {
    StageConfig::records().without_delays()
}

#[tokio::test]
async fn s1_happy_path() {
    let units: Vec<String> = (1..=10).map(|i| format!("u{i}")).collect();
    let unit_refs: Vec<&str> = units.iter().map(String::as_str).collect();
    let h = Harness::new(&unit_refs, &["chrome120"], fast().with_workers(4));

    h.run().await;

    assert_eq!(h.store.count().await.unwrap(), 10);
    assert_eq!(h.ledgers.count(Category::Successful), 10);
    assert_eq!(h.ledgers.count(Category::Failed), 0);
    assert_eq!(h.ledgers.count(Category::Exception), 0);
    assert_eq!(h.ledgers.count(Category::Blocked), 0);
    h.assert_one_terminal_ledger(&unit_refs);
    assert_eq!(h.stats.snapshot().success, 10);
}

#[tokio::test]
async fn s2_transient_rate_limit_recovers() {
    let h = Harness::new(&["u1"], &["chrome120"], fast().with_workers(1));
    h.transport.push(&url("u1"), status(429, "slow down"));
    h.transport.push(&url("u1"), ok_json(r#"{"ok": true}"#));

    h.run().await;

    assert_eq!(
        h.ledgers.ids(Category::Successful),
        vec!["u1".to_string()]
    );
    let health = h.registry.fingerprint_snapshot();
    assert!(health["chrome120"].rate_limited >= 1);
    assert_eq!(h.stats.snapshot().rate_limited_429, 1);
}

#[tokio::test]
async fn s3_unsupported_fingerprint_is_free_and_blacklisted_on_disk() {
    let tmp = TempDir::new().unwrap();
    let h = Harness::build(
        tmp,
        &["u1"],
        &["chrome120", "opera95"],
        &[],
        fast().with_workers(1).with_max_attempts(1),
    );
    h.transport
        .push(&url("u1"), fault("impersonating this profile is not supported"));
    h.transport.push(&url("u1"), ok_json("{}"));

    h.run().await;

    // The unsupported attempt did not consume the single-attempt budget.
    assert_eq!(h.ledgers.ids(Category::Successful), vec!["u1".to_string()]);

    let blacklist = std::fs::read_to_string(h.tmp.path().join("never_success_tls.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&blacklist).unwrap();
    let listed = parsed["never_success_tls"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn s4_permanent_block_lands_in_blocked_and_dropped() {
    let h = Harness::new(&["u1"], &["chrome120"], fast().with_workers(1));
    for _ in 0..3 {
        h.transport
            .push(&url("u1"), status(200, "<html>Just a moment...</html>"));
    }

    h.run().await;

    assert_eq!(h.ledgers.ids(Category::Blocked), vec!["u1".to_string()]);
    assert_eq!(h.ledgers.ids(Category::Dropped), vec!["u1".to_string()]);
    assert_eq!(h.store.count().await.unwrap(), 0);
    h.assert_one_terminal_ledger(&["u1"]);
}

#[tokio::test]
async fn s5_proxy_collapse_falls_back_to_direct() {
    let tmp = TempDir::new().unwrap();
    let h = Harness::build(
        tmp,
        &["u1"],
        &["chrome120"],
        &["http://only-proxy:8080"],
        fast().with_workers(1).with_max_attempts(4),
    );
    h.transport
        .push(&url("u1"), status(200, "<html>Just a moment...</html>"));
    h.transport
        .push(&url("u1"), status(200, "<html>Just a moment...</html>"));
    h.transport
        .push(&url("u1"), fault("connection failed: proxy unreachable"));
    h.transport.push(&url("u1"), ok_json("{}"));

    h.run().await;

    assert!(h.registry.proxy_is_blacklisted("http://only-proxy:8080"));
    let requests = h.transport.requests_for(&url("u1"));
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests[2].identity.proxy.as_deref(),
        Some("http://only-proxy:8080")
    );
    assert_eq!(requests[3].identity.proxy, None);
    assert_eq!(h.ledgers.ids(Category::Successful), vec!["u1".to_string()]);
}

#[tokio::test]
async fn s6_resume_enqueues_only_the_complement() {
    let tmp = TempDir::new().unwrap();

    // Run 1: only a subset of the range succeeds.
    let h1 = Harness::build(tmp, &["1", "3", "7"], &["chrome120"], &[], fast());
    h1.run().await;
    assert_eq!(h1.ledgers.count(Category::Successful), 3);

    // Run 2: the same output directory, the full range.
    let tmp = h1.tmp;
    let units: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
    let unit_refs: Vec<&str> = units.iter().map(String::as_str).collect();
    let h2 = Harness::build(tmp, &unit_refs, &["chrome120"], &[], fast().with_workers(2));
    h2.run().await;

    let requested: HashSet<String> = h2
        .transport
        .requests()
        .iter()
        .map(|r| r.url.clone())
        .collect();
    for done in ["1", "3", "7"] {
        assert!(
            !requested.contains(&url(done)),
            "unit {done} was re-requested after resume"
        );
    }
    assert_eq!(requested.len(), 7);
    assert_eq!(h2.ledgers.count(Category::Successful), 10);
}

#[tokio::test]
async fn rerun_after_complete_run_issues_no_requests() {
    let tmp = TempDir::new().unwrap();
    let units = ["1", "2", "3"];

    let h1 = Harness::build(tmp, &units, &["chrome120"], &[], fast());
    h1.run().await;
    assert_eq!(h1.store.count().await.unwrap(), 3);

    let h2 = Harness::build(h1.tmp, &units, &["chrome120"], &[], fast());
    h2.run().await;

    assert!(h2.transport.requests().is_empty());
    assert_eq!(h2.store.count().await.unwrap(), 0, "no new sink writes");
}

#[tokio::test]
async fn mixed_outcomes_each_get_exactly_one_terminal_ledger() {
    let h = Harness::new(
        &["ok", "perm", "blocked", "flaky"],
        &["chrome120"],
        fast().with_workers(2),
    );
    h.transport.push(&url("perm"), status(500, "boom"));
    for _ in 0..3 {
        h.transport
            .push(&url("blocked"), status(200, "<html>Just a moment...</html>"));
        h.transport
            .push(&url("flaky"), fault("timeout: request timed out"));
    }

    h.run().await;

    h.assert_one_terminal_ledger(&["ok", "perm", "blocked", "flaky"]);
    assert_eq!(h.ledgers.ids(Category::Successful), vec!["ok".to_string()]);
    assert_eq!(h.ledgers.ids(Category::Failed), vec!["perm".to_string()]);
    assert_eq!(h.ledgers.ids(Category::Exception), vec!["flaky".to_string()]);
    assert_eq!(h.ledgers.ids(Category::Blocked), vec!["blocked".to_string()]);
    assert_eq!(h.store.ids(), vec!["ok".to_string()]);
}
