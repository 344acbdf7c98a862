//! Test utilities: mock implementations of the engine seams.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::HarvestError;
use crate::outcome::{RawResponse, TransportFault, TransportResult};
use crate::sink::RecordStore;
use crate::transport::{Identity, Transport};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// Response shorthands
// ---------------------------------------------------------------------------

/// 200 with the given JSON body.
pub fn ok_json(body: &str) -> TransportResult {
    Ok(RawResponse::new(200, body))
}

/// Arbitrary status + body.
pub fn status(code: u16, body: &str) -> TransportResult {
    Ok(RawResponse::new(code, body))
}

/// Transport-level fault with the given message.
pub fn fault(message: &str) -> TransportResult {
    Err(TransportFault::new(message))
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// One issued request, as recorded by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub identity: Identity,
    pub timeout: Duration,
}

/// Mock transport with per-URL scripted responses.
///
/// Each `get` pops the next scripted response for its URL; when the script
/// runs dry the mock answers with a default JSON-object success.
#[derive(Clone, Default)]
pub struct MockTransport {
    scripts: Arc<Mutex<HashMap<String, VecDeque<TransportResult>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response for a URL.
    pub fn push(&self, url: &str, result: TransportResult) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests issued for one URL.
    pub fn requests_for(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    async fn get(&self, url: &str, identity: &Identity, timeout: Duration) -> TransportResult {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            identity: identity.clone(),
            timeout,
        });
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(RawResponse::new(200, r#"{"data": []}"#)))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory record store with upsert semantics.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, String>>>,
    put_error: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose next `put` fails with the given message.
    pub fn with_put_error(message: &str) -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            put_error: Arc::new(Mutex::new(Some(message.to_string()))),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

impl RecordStore for MemoryStore {
    async fn put(&self, id: &str, json: &str) -> Result<(), HarvestError> {
        if let Some(msg) = self.put_error.lock().unwrap().take() {
            return Err(HarvestError::Store(msg));
        }
        self.records
            .lock()
            .unwrap()
            .insert(id.to_string(), json.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, HarvestError> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn count(&self) -> Result<u64, HarvestError> {
        Ok(self.records.lock().unwrap().len() as u64)
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Worker reporter that records event labels.
#[derive(Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for RecordingReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::UnitStarted { .. } => "UnitStarted",
            WorkerEvent::UnitSkipped { .. } => "UnitSkipped",
            WorkerEvent::AttemptIssued { .. } => "AttemptIssued",
            WorkerEvent::Retrying { .. } => "Retrying",
            WorkerEvent::FingerprintBlacklisted { .. } => "FingerprintBlacklisted",
            WorkerEvent::UnitSucceeded { .. } => "UnitSucceeded",
            WorkerEvent::UnitFailed { .. } => "UnitFailed",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
