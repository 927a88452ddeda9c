//! TCP-connect reachability probes.
//!
//! 每个探测只做 TCP 握手，不走代理协议；延迟 = connect 开始到成功的墙钟时间。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::cache::unix_now;
use crate::config::subscription::Server;

pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeErrorKind {
    Timeout,
    Refused,
    Unreachable,
    Dns,
    Cancelled,
}

impl ProbeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::Refused => "refused",
            ProbeErrorKind::Unreachable => "unreachable",
            ProbeErrorKind::Dns => "dns",
            ProbeErrorKind::Cancelled => "cancelled",
        }
    }

    fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ProbeErrorKind::Refused,
            io::ErrorKind::TimedOut => ProbeErrorKind::Timeout,
            _ => ProbeErrorKind::Unreachable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub server_id: String,
    pub server_name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<ProbeErrorKind>,
    /// Unix seconds.
    pub measured_at: u64,
}

impl ProbeResult {
    fn ok(server: &Server, latency_ms: u64) -> Self {
        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            available: true,
            latency_ms: Some(latency_ms),
            error: None,
            measured_at: unix_now(),
        }
    }

    fn failed(server: &Server, kind: ProbeErrorKind) -> Self {
        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            available: false,
            latency_ms: None,
            error: Some(kind),
            measured_at: unix_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeProgress {
    pub completed: usize,
    pub total: usize,
    pub last_server: String,
}

/// Invoked after every completed probe. Must not block.
pub type ProgressFn = Arc<dyn Fn(ProbeProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProbeEngine {
    timeout: Duration,
    max_concurrency: usize,
}

impl ProbeEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_concurrency: MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single server.
    pub async fn probe_one(&self, server: &Server) -> ProbeResult {
        let deadline = Instant::now() + self.timeout;

        let host = server.address.as_str();
        let addrs: Vec<SocketAddr> =
            match tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, server.port)))
                .await
            {
                Ok(Ok(addrs)) => addrs.collect(),
                Ok(Err(e)) => {
                    debug!(server = %server.name, error = %e, "probe resolve failed");
                    return ProbeResult::failed(server, ProbeErrorKind::Dns);
                }
                Err(_) => return ProbeResult::failed(server, ProbeErrorKind::Timeout),
            };
        if addrs.is_empty() {
            return ProbeResult::failed(server, ProbeErrorKind::Dns);
        }

        let mut last_err = ProbeErrorKind::Unreachable;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ProbeResult::failed(server, ProbeErrorKind::Timeout);
            }
            let start = Instant::now();
            match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let latency_ms = (start.elapsed().as_secs_f64() * 1000.0).round() as u64;
                    drop(stream);
                    return ProbeResult::ok(server, latency_ms);
                }
                Ok(Err(e)) => {
                    debug!(server = %server.name, %addr, error = %e, "probe connect failed");
                    last_err = ProbeErrorKind::from_io(&e);
                }
                Err(_) => return ProbeResult::failed(server, ProbeErrorKind::Timeout),
            }
        }
        ProbeResult::failed(server, last_err)
    }

    /// Probe every server with at most `min(n, 16)` in flight.
    ///
    /// Results follow the input order. On cancellation the probes still in flight
    /// are dropped and reported as [`ProbeErrorKind::Cancelled`].
    pub async fn probe_all(
        &self,
        servers: &[Server],
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let total = servers.len();
        if total == 0 {
            return Vec::new();
        }
        let limit = total.min(self.max_concurrency);
        let started = Instant::now();

        let mut slots: Vec<Option<ProbeResult>> = vec![None; total];
        let mut completed = 0usize;

        // 每个任务持有自己的引擎与服务器副本，整个 sweep 可以安全地 spawn
        let jobs: Vec<_> = servers
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, server)| {
                let engine = self.clone();
                async move { (idx, engine.probe_one(&server).await) }
            })
            .collect();
        let mut pending = stream::iter(jobs).buffer_unordered(limit);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = pending.next() => next,
            };
            let Some((idx, result)) = next else {
                break;
            };
            completed += 1;
            if let Some(cb) = &progress {
                cb(ProbeProgress {
                    completed,
                    total,
                    last_server: result.server_name.clone(),
                });
            }
            slots[idx] = Some(result);
        }
        drop(pending);

        let results: Vec<ProbeResult> = slots
            .into_iter()
            .zip(servers)
            .map(|(slot, server)| {
                slot.unwrap_or_else(|| ProbeResult::failed(server, ProbeErrorKind::Cancelled))
            })
            .collect();

        let available = results.iter().filter(|r| r.available).count();
        info!(
            total,
            available,
            cancelled = total - completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "probe sweep finished"
        );
        results
    }
}

/// Available first by ascending latency, then unavailable in input order.
pub fn sort_by_latency(results: &mut [ProbeResult]) {
    results.sort_by_key(|r| match (r.available, r.latency_ms) {
        (true, Some(ms)) => (0u8, ms),
        _ => (1u8, 0),
    });
}
