//! Best-effort public address discovery.
//!
//! The result is a weak signal for rate limiting only. It is spoofable and
//! frequently `"unknown"`; nothing should treat it as client identity.

use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const UNKNOWN_ADDRESS: &str = "unknown";

pub const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Anything that can name the caller's approximate address.
///
/// Implementations must always resolve; failure is expressed as
/// [`UNKNOWN_ADDRESS`].
#[async_trait]
pub trait AddressResolver: Send + Sync + Debug {
    async fn resolve_approximate_address(&self) -> String;
}

/// Source of ICE-style candidate lines, e.g.
/// `candidate:1 1 udp 1686052607 203.0.113.7 54321 typ srflx`.
///
/// Candidates are pushed into `tx` as they are found. Returning ends
/// gathering; the task may also be aborted at any await point.
#[async_trait]
pub trait CandidateGatherer: Send + Sync + Debug + 'static {
    async fn gather(&self, tx: mpsc::Sender<String>) -> io::Result<()>;
}

// First whitespace token of the candidate that is an IPv4/IPv6 literal
pub fn extract_address(candidate: &str) -> Option<IpAddr> {
    candidate
        .split_whitespace()
        .find_map(|token| token.parse::<IpAddr>().ok())
}

// Resolver that always answers the same thing
#[derive(Debug, Clone)]
pub struct FixedAddress(pub String);

#[async_trait]
impl AddressResolver for FixedAddress {
    async fn resolve_approximate_address(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct IpApproximator<G> {
    gatherer: std::sync::Arc<G>,
    timeout: Duration,
}

impl<G: CandidateGatherer> IpApproximator<G> {
    pub fn new(gatherer: G) -> Self {
        Self::with_timeout(gatherer, DEFAULT_ADDRESS_TIMEOUT)
    }

    pub fn with_timeout(gatherer: G, timeout: Duration) -> Self {
        Self {
            gatherer: std::sync::Arc::new(gatherer),
            timeout,
        }
    }

    async fn first_address(rx: &mut mpsc::Receiver<String>) -> Option<IpAddr> {
        while let Some(candidate) = rx.recv().await {
            debug!(candidate = %candidate, "Received candidate");
            if let Some(ip) = extract_address(&candidate) {
                return Some(ip);
            }
        }
        None
    }
}

#[async_trait]
impl<G: CandidateGatherer> AddressResolver for IpApproximator<G> {
    async fn resolve_approximate_address(&self) -> String {
        let (tx, mut rx) = mpsc::channel(16);
        let gatherer = self.gatherer.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = gatherer.gather(tx).await {
                debug!(error = %e, "Candidate gathering failed");
            }
        });

        let outcome = tokio::time::timeout(self.timeout, Self::first_address(&mut rx)).await;

        // release the socket whichever path won
        task.abort();

        match outcome {
            Ok(Some(ip)) => ip.to_string(),
            Ok(None) => {
                debug!("No candidate carried an address");
                UNKNOWN_ADDRESS.to_string()
            }
            Err(_) => {
                debug!(timeout = ?self.timeout, "Address lookup timed out");
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }
}
