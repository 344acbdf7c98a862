use thiserror::Error;

/// Application-wide error types for the harvester.
///
/// Everything the origin can throw at us (blocks, rate limits, transport
/// faults) is absorbed by the worker retry loop and never surfaces here;
/// these variants cover the process-fatal and infrastructure failures only.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Filesystem operation failed (ledgers, raw dumps, snapshots).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid or missing configuration / input file.
    #[error("config error: {0}")]
    Config(String),

    /// Every TLS fingerprint has been blacklisted or demoted.
    ///
    /// Recovery requires operator intervention: delete the blacklist file
    /// or upgrade the emulation library.
    #[error("fingerprint pool exhausted: {0}")]
    PoolExhausted(String),
}

impl HarvestError {
    /// Returns true if the run cannot continue and the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::PoolExhausted(_) | HarvestError::Config(_)
        )
    }
}
