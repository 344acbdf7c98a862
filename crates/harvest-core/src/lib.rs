//! # harvest-core
//!
//! Adaptive concurrent fetch engine shared by both extraction stages of the
//! transparency-API harvester: the paginated sweep and the per-record fetch.
//!
//! The engine dispatches units of work across a bounded worker pool, rotates
//! request identities (TLS ClientHello profile, proxy, header set) per
//! attempt, classifies every response into a tagged outcome, tracks
//! fingerprint and proxy health persistently, and lands each unit in exactly
//! one terminal ledger. Successful payloads flow into an idempotent record
//! sink, so interrupted runs resume from whatever the ledgers say is done.

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod outcome;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod stats;
pub mod testutil;
pub mod transport;
pub mod util;
pub mod worker;

pub use classifier::classify;
pub use config::{Backoff, Endpoint, StageConfig};
pub use dispatcher::Dispatcher;
pub use error::HarvestError;
pub use ledger::{Category, LedgerSet, RawDumps};
pub use outcome::{Outcome, RawResponse, TransportFault, TransportKind, TransportResult};
pub use progress::ProgressStore;
pub use queue::WorkQueue;
pub use registry::{HealthRegistry, ProxylessGate, RegistryPaths};
pub use sink::{DualStore, FileStore, NullStore, RecordStore};
pub use stats::StatsStore;
pub use transport::{Identity, Transport};
pub use worker::{Disposition, TracingWorkerReporter, Worker, WorkerReporter};
