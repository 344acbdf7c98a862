//! HTTP transport backed by `wreq`.
//!
//! Builds a fresh client per attempt keyed on `(emulation profile, proxy)`;
//! clients are cheap, and a fresh ClientHello per attempt is the point.
//! Failure modes are normalized into matchable fault text so the engine's
//! classifier never has to know which HTTP library sits underneath.

use std::error::Error as StdError;
use std::time::Duration;

use harvest_core::outcome::{RawResponse, TransportFault, TransportResult};
use harvest_core::transport::{Identity, Transport};
use harvest_core::util;

use crate::profiles;

const ACCEPT: &str = "application/json, text/plain, */*";
const ORIGIN: &str = "https://transparency.dpwh.gov.ph";
const DEFAULT_REFERER: &str = "https://transparency.dpwh.gov.ph/";

/// Rotated per request to vary the header fingerprint alongside the TLS one.
const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-PH,en;q=0.9,tl;q=0.8",
    "fil-PH,fil;q=0.9,en;q=0.8",
    "en;q=0.9",
];

/// An empty entry falls back to the site's own referer.
const REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://transparency.dpwh.gov.ph/",
    "https://www.dpwh.gov.ph/",
    "",
];

/// Transport whose TLS ClientHello mimics the browser profile named by the
/// attempt's identity. User-Agent is supplied by the emulation so it always
/// matches the TLS fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct WreqTransport;

impl WreqTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WreqTransport {
    async fn get(&self, url: &str, identity: &Identity, timeout: Duration) -> TransportResult {
        let Some(emulation) = profiles::emulation_for(&identity.fingerprint) else {
            return Err(TransportFault::new(format!(
                "impersonating {} is not supported by this build",
                identity.fingerprint
            )));
        };

        let mut builder = wreq::Client::builder().emulation(emulation);
        if let Some(proxy_url) = &identity.proxy {
            match wreq::Proxy::all(proxy_url.as_str()) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    return Err(TransportFault::new(format!(
                        "connection failed: proxy {proxy_url} rejected: {e}"
                    )));
                }
            }
        }
        let client = builder.build().map_err(|e| fault_from_error(&e))?;

        let referer = REFERERS[util::pick_index(REFERERS.len())];
        let referer = if referer.is_empty() {
            DEFAULT_REFERER
        } else {
            referer
        };
        let accept_language = ACCEPT_LANGUAGES[util::pick_index(ACCEPT_LANGUAGES.len())];

        let request = client
            .get(url)
            .header("Accept", ACCEPT)
            .header("Accept-Language", accept_language)
            .header("Accept-Encoding", "gzip, deflate, br")
            .header("Referer", referer)
            .header("Origin", ORIGIN)
            .header("DNT", "1")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-site")
            .timeout(timeout);

        let response = request.send().await.map_err(|e| fault_from_error(&e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| fault_from_error(&e))?;
        Ok(RawResponse { status, body })
    }
}

/// Normalize a `wreq` error into matchable fault text. Well-known conditions
/// get stable prefixes; everything else keeps its full source chain so
/// TLS/reset markers stay visible to the classifier.
fn fault_from_error(e: &wreq::Error) -> TransportFault {
    if e.is_timeout() {
        TransportFault::new(format!("timeout: {e}"))
    } else if e.is_connect() {
        TransportFault::new(format!("connection failed: {}", chain_text(e)))
    } else {
        TransportFault::new(chain_text(e))
    }
}

fn chain_text(e: &dyn StdError) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
