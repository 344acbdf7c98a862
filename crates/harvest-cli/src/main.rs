use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_client::WreqTransport;
use harvest_client::profiles;
use harvest_core::config::{MAX_PAGE_LIMIT, max_pages};
use harvest_core::progress::DEFAULT_FLUSH_INTERVAL;
use harvest_core::{
    Category, Dispatcher, DualStore, Endpoint, FileStore, HealthRegistry, LedgerSet,
    ProgressStore, RawDumps, RecordStore, RegistryPaths, StageConfig, StatsStore,
    TracingWorkerReporter, WorkQueue, Worker,
};
use harvest_db::SqliteRecordStore;

const DEFAULT_BASE_URL: &str = "https://api.transparency.dpwh.gov.ph/projects";

#[derive(Parser)]
#[command(
    name = "harvest",
    version,
    about = "Adaptive harvester for the DPWH transparency API"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "HARVEST_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the paginated listing into per-page JSON dumps
    Pages {
        /// First page
        #[arg(long, default_value_t = 1)]
        start: u32,

        /// Last page (derived from the known record count when omitted)
        #[arg(long)]
        end: Option<u32>,

        /// Items per page (the API supports up to 5000)
        #[arg(long, default_value_t = MAX_PAGE_LIMIT)]
        limit: u32,

        /// Concurrent workers
        #[arg(long, default_value_t = 10)]
        workers: usize,

        /// Output directory
        #[arg(long, default_value = "base-data")]
        out: PathBuf,
    },

    /// Fetch one JSON document per record id into the embedded database
    Records {
        /// Line-oriented file of record ids (blank lines dropped, duplicates ignored)
        #[arg(long)]
        ids: PathBuf,

        /// Concurrent workers
        #[arg(long, default_value_t = 50)]
        workers: usize,

        /// Output directory
        #[arg(long, default_value = "projects-data")]
        out: PathBuf,

        /// Also mirror every record to {out}/records/{id}.json
        #[arg(long, default_value_t = false)]
        json_files: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pages {
            start,
            end,
            limit,
            workers,
            out,
        } => {
            ensure!(
                (1..=MAX_PAGE_LIMIT).contains(&limit),
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            );
            let end = end.unwrap_or_else(|| max_pages(limit));
            ensure!(start >= 1 && start <= end, "invalid page range {start}..{end}");

            let env = StageEnv::prepare(&out)?;
            let page_store = FileStore::with_template(
                out.join("pages"),
                format!("dump-page-{{id}}-{limit}.json"),
            )?;

            // Resume: pages recorded in the successful ledger plus any page
            // files already on disk.
            let mut completed: HashSet<String> =
                env.ledgers.ids(Category::Successful).into_iter().collect();
            completed.extend(page_store.existing_ids()?);

            let queue = WorkQueue::new((start..=end).map(|p| p.to_string()), completed);
            let registry = Arc::new(HealthRegistry::new(
                profiles::default_pool(),
                Vec::new(),
                Some(env.registry_paths.clone()),
            )?);

            let config = StageConfig::pages().with_workers(workers);
            let endpoint = Endpoint::Paged {
                base: cli.base_url,
                limit,
            };
            run_stage(env, page_store, queue, registry, config, endpoint).await
        }

        Commands::Records {
            ids,
            workers,
            out,
            json_files,
        } => {
            let record_ids = read_ids(&ids)?;
            ensure!(!record_ids.is_empty(), "ids file {} is empty", ids.display());
            tracing::info!(count = record_ids.len(), "Loaded record ids");

            let env = StageEnv::prepare(&out)?;
            let completed: HashSet<String> =
                env.ledgers.ids(Category::Successful).into_iter().collect();
            let queue = WorkQueue::new(record_ids, completed);

            let proxies = load_proxies()?;
            tracing::info!(count = proxies.len(), "Proxy pool loaded");
            let registry = Arc::new(HealthRegistry::new(
                profiles::default_pool(),
                proxies,
                Some(env.registry_paths.clone()),
            )?);

            let config = StageConfig::records().with_workers(workers);
            let endpoint = Endpoint::Item { base: cli.base_url };

            let db = SqliteRecordStore::open(&out.join("projects.db")).await?;
            if json_files {
                let mirror = FileStore::new(out.join("records"))?;
                let store = DualStore::new(db, mirror);
                run_stage(env, store, queue, registry, config, endpoint).await
            } else {
                run_stage(env, db, queue, registry, config, endpoint).await
            }
        }
    }
}

/// Shared per-stage output plumbing.
struct StageEnv {
    out: PathBuf,
    ledgers: Arc<LedgerSet>,
    dumps: RawDumps,
    registry_paths: RegistryPaths,
}

impl StageEnv {
    fn prepare(out: &Path) -> Result<Self> {
        fs::create_dir_all(out)
            .with_context(|| format!("output directory {} is not writable", out.display()))?;
        let ledgers = Arc::new(LedgerSet::open(out.join("lists"))?);
        let dumps = RawDumps::open(out.join("raw"))?;
        Ok(Self {
            out: out.to_path_buf(),
            ledgers,
            dumps,
            registry_paths: RegistryPaths {
                blacklist: out.join("never_success_tls.json"),
                health: out.join("impersonate_health.json"),
            },
        })
    }
}

async fn run_stage<S: RecordStore + 'static>(
    env: StageEnv,
    store: S,
    queue: WorkQueue,
    registry: Arc<HealthRegistry>,
    config: StageConfig,
    endpoint: Endpoint,
) -> Result<()> {
    if registry.active_fingerprint_count() == 0 {
        bail!(
            "every TLS fingerprint is blacklisted; delete {} to retry them",
            env.registry_paths.blacklist.display()
        );
    }
    if queue.remaining() == 0 {
        println!("Nothing to do: all requested units are already successful.");
        return Ok(());
    }

    let stats = Arc::new(StatsStore::new());

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        token.cancel();
    });

    let progress_cancel = CancellationToken::new();
    let progress = ProgressStore::new(env.out.join("progress_stats.json")).spawn(
        stats.clone(),
        registry.clone(),
        env.ledgers.clone(),
        DEFAULT_FLUSH_INTERVAL,
        progress_cancel.clone(),
    );

    let worker = Worker::new(
        WreqTransport::new(),
        store,
        queue.clone(),
        registry.clone(),
        env.ledgers.clone(),
        env.dumps.clone(),
        stats.clone(),
        config.clone(),
        endpoint,
    );
    let dispatcher = Dispatcher::new(worker, queue, config.workers);
    let run_result = dispatcher
        .run(cancel, Arc::new(TracingWorkerReporter))
        .await;

    progress_cancel.cancel();
    progress.await.ok();
    registry.flush(true);

    print_summary(&stats, &registry, &env.ledgers);

    // Units left in failed/blocked are a normal end state; only engine-fatal
    // conditions (exhausted fingerprint pool) make the run itself fail.
    run_result.map_err(Into::into)
}

fn print_summary(stats: &StatsStore, registry: &HealthRegistry, ledgers: &LedgerSet) {
    let snap = stats.snapshot();
    println!("\nRun summary");
    println!("-----------");
    println!("  total     : {}", snap.total);
    println!("  success   : {}", snap.success);
    println!("  fail      : {}", snap.fail);
    println!("  blocked   : {}", snap.blocked);
    println!("  exception : {}", snap.exception);
    println!("  skipped   : {}", snap.skipped);
    println!("  retries   : {}", snap.retries);
    println!(
        "  rate-limited: {} (429) / {} (403)",
        snap.rate_limited_429, snap.rate_limited_403
    );
    let attempted = snap.total.saturating_sub(snap.skipped);
    if attempted > 0 {
        println!(
            "  success rate: {:.2}%",
            snap.success as f64 / attempted as f64 * 100.0
        );
    }

    let health = registry.fingerprint_snapshot();
    let used: Vec<_> = health
        .iter()
        .filter(|(_, h)| h.success + h.fail > 0)
        .collect();
    if !used.is_empty() {
        println!("\nFingerprint health");
        for (label, h) in used {
            let total = h.success + h.fail;
            println!(
                "  {label}: success={}, fail={}, block={}, rate_limited={} ({:.1}% success)",
                h.success,
                h.fail,
                h.block,
                h.rate_limited,
                h.success as f64 / total as f64 * 100.0
            );
        }
    }
    let blacklisted = registry.blacklisted_fingerprints();
    if !blacklisted.is_empty() {
        println!("  never-success fingerprints: {blacklisted:?}");
    }

    let proxies = registry.proxy_snapshot();
    if !proxies.is_empty() {
        println!("\nProxy health");
        for (url, h) in proxies {
            println!(
                "  {url}: success={}, fail={}, blacklisted={}",
                h.success, h.fail, h.blacklisted
            );
        }
    }

    let non_success = [
        Category::Failed,
        Category::Exception,
        Category::Blocked,
        Category::Dropped,
    ];
    let mut printed_header = false;
    for category in non_success {
        if ledgers.count(category) > 0 {
            if !printed_header {
                println!("\nNon-success ledgers");
                printed_header = true;
            }
            println!(
                "  {}: {} ids -> {}",
                category.as_str(),
                ledgers.count(category),
                ledgers.txt_path(category).display()
            );
        }
    }
    println!();
}

/// Read record ids: one per line, trimmed, blanks dropped, first occurrence
/// wins. A missing file is a fatal startup error.
fn read_ids(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read ids file {}", path.display()))?;
    let mut seen = HashSet::new();
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect())
}

/// Proxy endpoints come from an external process that writes
/// `free_proxies.json` in the working directory; `premium_proxies.json` is
/// appended when present. Running without either just disables proxies.
fn load_proxies() -> Result<Vec<String>> {
    let mut proxies: Vec<String> = match fs::read_to_string("free_proxies.json") {
        Ok(content) => serde_json::from_str(&content)
            .context("free_proxies.json is not a JSON array of proxy URLs")?,
        Err(_) => {
            tracing::warn!("free_proxies.json not found; running proxyless");
            Vec::new()
        }
    };

    if let Ok(content) = fs::read_to_string("premium_proxies.json") {
        let premium: Vec<String> = serde_json::from_str(&content)
            .context("premium_proxies.json is not a JSON array of proxy URLs")?;
        tracing::info!(count = premium.len(), "Loaded premium proxies");
        proxies.extend(premium);
    }

    Ok(proxies)
}
