//! Reachability probes.

use crate::resilience::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// A lightweight check that the internet is reachable.
///
/// Implementations should be cheap; the monitor applies its own timeout.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), TransportError>;
}

/// Probe by opening (and immediately closing) a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    /// `target` is a `host:port` pair, e.g. `"1.1.1.1:443"`.
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> Result<(), TransportError> {
        let stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await??;
        debug!(target = %self.target, peer = ?stream.peer_addr().ok(), "probe connected");
        Ok(())
    }
}

/// Probe with a switchable outcome, for tests.
#[derive(Debug)]
pub struct MockProbe {
    reachable: AtomicBool,
    calls: AtomicUsize,
    latency: Duration,
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProbe {
    /// Reachable until told otherwise.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Each probe takes `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for MockProbe {
    async fn probe(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Network("mock probe unreachable".to_string()))
        }
    }
}
