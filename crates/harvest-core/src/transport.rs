//! Transport seam between the engine and the HTTP layer.

use std::future::Future;
use std::time::Duration;

use crate::outcome::TransportResult;

/// The rotating identity a single attempt is issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// ClientHello profile label, e.g. `chrome120`.
    pub fingerprint: String,
    /// Proxy URL, or `None` for a direct attempt.
    pub proxy: Option<String>,
}

impl Identity {
    pub fn direct(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            proxy: None,
        }
    }

    pub fn proxied(fingerprint: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            proxy: Some(proxy.into()),
        }
    }
}

/// Issues one GET under the given identity.
///
/// Implementations must never panic on origin misbehavior: every failure
/// mode is reported as a [`TransportFault`](crate::outcome::TransportFault)
/// with a matchable message so the classifier can map it. Well-known
/// conditions use normalized prefixes: `"timeout: …"`, `"connection
/// failed: …"`, and unsupported-profile faults carry `"not supported"`.
pub trait Transport: Send + Sync + Clone {
    fn get(
        &self,
        url: &str,
        identity: &Identity,
        timeout: Duration,
    ) -> impl Future<Output = TransportResult> + Send;
}
