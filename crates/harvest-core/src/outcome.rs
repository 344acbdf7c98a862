use serde::Serialize;

/// What the transport layer handed back, before classification.
///
/// `Ok` means the HTTP exchange completed (whatever the status code);
/// `Err` means the request never produced a response.
pub type TransportResult = Result<RawResponse, TransportFault>;

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A transport-level failure with a normalized, matchable message.
///
/// Transports are expected to prefix well-known conditions ("timeout: …",
/// "connection failed: …", "… is not supported") so the classifier can stay
/// a pure string-matching function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub message: String,
}

impl TransportFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Transport failure kinds that get their own counters and ledger buckets.
///
/// The first three correspond to the connection-failure class that triggers
/// immediate proxy blacklisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// DNS failure, refused connection, unreachable proxy.
    Connect,
    /// TLS/handshake failure.
    Tls,
    /// Connection reset or truncated mid-transfer.
    Reset,
    Other,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Connect => "connect",
            TransportKind::Tls => "tls",
            TransportKind::Reset => "reset",
            TransportKind::Other => "other",
        }
    }

    /// Connection-level failures blacklist the proxy that produced them.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportKind::Connect | TransportKind::Tls | TransportKind::Reset
        )
    }
}

/// Classified result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 200 with a JSON object body and no interstitial markers.
    Success(String),
    /// 429, or 403 carrying interstitial markers.
    RateLimited { status: u16 },
    /// Anti-bot interstitial without an explicit rate-limit status.
    Blocked,
    /// The attempt timed out.
    Timeout,
    /// Transport-level failure other than a timeout.
    Transport(TransportKind),
    /// The runtime cannot emit the requested ClientHello profile.
    FingerprintUnsupported,
    /// Unretryable HTTP error; the snippet goes to the raw dump.
    PermanentFailure { status: u16, snippet: String },
}

impl Outcome {
    /// Short label used for health bookkeeping and log lines.
    pub fn reason(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::Blocked => "block",
            Outcome::Timeout => "timeout",
            Outcome::Transport(kind) => kind.as_str(),
            Outcome::FingerprintUnsupported => "not_supported",
            Outcome::PermanentFailure { .. } => "http_fail",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}
