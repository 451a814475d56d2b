//! Outbound flow shaping.
//!
//! Two concerns sit between [`Session`](crate::session::Session) and the
//! socket:
//!
//! - **Rate limiting**: a [`RateLimiter`] sliding window keeps the command rate
//!   under the server's flood threshold. Commands are delayed, never
//!   dropped or reordered.
//! - **Write coalescing**: [`WriteCoalescer`] owns the write half, feeds up
//!   to a batch of queued lines into the codec buffer and flushes once per
//!   batch. While the socket is not writable the lines simply wait in the
//!   queue.
//!
//! Each line carries a sequence number so its write outcome can be reported
//! back through [`WriteObserver`].

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tsq_codec::QueryCodec;

/// Default number of lines written before a flush.
pub const DEFAULT_WRITE_BATCH: usize = 16;

// ─── Policy ─────────────────────────────────────────────────────────────────

/// How the command rate is chosen for a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// No limit.
    Unlimited,
    /// The server's default flood threshold.
    Limited,
    /// Unlimited for `127.0.0.1`, limited for everything else.
    #[default]
    Autodetect,
}

impl RateLimitPolicy {
    /// Pick the concrete limit for a connection to `remote`.
    ///
    /// Only the IPv4 loopback address is whitelisted by default server
    /// configurations, so `::1` is treated as remote.
    pub fn resolve(self, remote: IpAddr) -> RateLimit {
        match self {
            Self::Unlimited => RateLimit::UNLIMITED,
            Self::Limited => RateLimit::LIMITED,
            Self::Autodetect if remote == IpAddr::V4(Ipv4Addr::LOCALHOST) => RateLimit::UNLIMITED,
            Self::Autodetect => RateLimit::LIMITED,
        }
    }

    /// [`resolve`](Self::resolve) for a socket address.
    pub fn resolve_for(self, remote: SocketAddr) -> RateLimit {
        self.resolve(remote.ip())
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unlimited => "unlimited",
            Self::Limited => "limited",
            Self::Autodetect => "autodetect",
        })
    }
}

impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unlimited" | "none" | "off" => Ok(Self::Unlimited),
            "limited" | "on" => Ok(Self::Limited),
            "autodetect" | "auto" => Ok(Self::Autodetect),
            other => Err(format!(
                "unknown rate limit {other:?} (expected unlimited, limited or autodetect)"
            )),
        }
    }
}

/// A concrete command rate: at most `commands` in any span of `period`.
/// Zero commands means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    /// Commands allowed per period.
    pub commands: u32,
    /// Length of the period.
    pub period: Duration,
}

impl RateLimit {
    /// No limit.
    pub const UNLIMITED: Self = Self {
        commands: 0,
        period: Duration::ZERO,
    };

    /// Ten commands every 3.5 seconds, just under the default threshold of
    /// ten commands per three seconds.
    pub const LIMITED: Self = Self {
        commands: 10,
        period: Duration::from_millis(3500),
    };

    /// Whether this limit lets everything through.
    pub fn is_unlimited(&self) -> bool {
        self.commands == 0 || self.period.is_zero()
    }

    /// Refill rate in commands per second; `0.0` when unlimited.
    pub fn per_second(&self) -> f64 {
        if self.is_unlimited() {
            0.0
        } else {
            f64::from(self.commands) / self.period.as_secs_f64()
        }
    }
}

// ─── Window limiter ─────────────────────────────────────────────────────────

/// Sliding-window limiter: at most `commands` admissions in any span of
/// `period`. A command becomes admissible again exactly one period after
/// the oldest admission still in the window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    admitted: VecDeque<Instant>,
}

impl RateLimiter {
    /// An empty window for `limit`.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            admitted: VecDeque::with_capacity(limit.commands as usize),
        }
    }

    /// The limit this window enforces.
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) < self.limit.period {
                break;
            }
            let _ = self.admitted.pop_front();
        }
    }

    /// Whether a command may be sent right now.
    pub fn has_credit(&mut self) -> bool {
        if self.limit.is_unlimited() {
            return true;
        }
        self.expire(Instant::now());
        self.admitted.len() < self.limit.commands as usize
    }

    /// Record one admission if the window has room.
    pub fn try_acquire(&mut self) -> bool {
        if !self.has_credit() {
            return false;
        }
        if !self.limit.is_unlimited() {
            self.admitted.push_back(Instant::now());
        }
        true
    }

    /// Time until the window has room again.
    pub fn wait_time(&mut self) -> Duration {
        if self.has_credit() {
            return Duration::ZERO;
        }
        match self.admitted.front() {
            Some(&oldest) => (oldest + self.limit.period).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Wait for room in the window and take it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.wait_time();
            trace!(wait_ms = wait.as_millis(), "rate limited, delaying write");
            tokio::time::sleep(wait).await;
        }
    }
}

// ─── Writer ─────────────────────────────────────────────────────────────────

/// One encoded request line waiting to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundLine {
    /// Local sequence number of the request (never sent).
    pub seq: u64,
    /// Encoded line without terminator.
    pub line: String,
}

/// Receives the outcome of every queued write.
pub trait WriteObserver: Send + Sync + 'static {
    /// The line with this sequence number reached the socket.
    fn on_written(&self, seq: u64);

    /// Writing the line failed.
    fn on_write_failed(&self, seq: u64, error: &str);
}

/// Writer task state: the framed write half plus the rate limiter.
pub struct WriteCoalescer<W> {
    sink: FramedWrite<W, QueryCodec>,
    limiter: RateLimiter,
    batch_size: usize,
    broken: Option<String>,
}

impl<W: AsyncWrite + Unpin> WriteCoalescer<W> {
    /// Wrap a write half.
    pub fn new(writer: W, limiter: RateLimiter) -> Self {
        Self {
            sink: FramedWrite::new(writer, QueryCodec::new()),
            limiter,
            batch_size: DEFAULT_WRITE_BATCH,
            broken: None,
        }
    }

    /// Override the number of lines written per flush.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Drain `rx` until it closes or `shutdown` fires. Shutdown also
    /// interrupts a write stuck on an unwritable socket, releasing the
    /// write half.
    ///
    /// After a write error the transport is considered broken: every later
    /// line is reported as failed without touching the socket.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<OutboundLine>,
        observer: Arc<dyn WriteObserver>,
        shutdown: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if let Some(error) = &self.broken {
                observer.on_write_failed(first.seq, error);
                continue;
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = self.limiter.acquire() => {}
            }

            let mut batch = vec![first];
            while batch.len() < self.batch_size && self.limiter.has_credit() {
                match rx.try_recv() {
                    Ok(item) => {
                        let _ = self.limiter.try_acquire();
                        batch.push(item);
                    }
                    Err(_) => break,
                }
            }

            let outcome = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    debug!(lines = batch.len(), "shutdown while writing, dropping batch");
                    break;
                }
                outcome = self.write_batch(&batch) => outcome,
            };

            match outcome {
                Ok(()) => {
                    trace!(lines = batch.len(), "flushed batch");
                    for item in &batch {
                        observer.on_written(item.seq);
                    }
                }
                Err(error) => {
                    warn!(%error, lines = batch.len(), "write failed, transport is broken");
                    for item in &batch {
                        observer.on_write_failed(item.seq, &error);
                    }
                    self.broken = Some(error);
                }
            }
        }
        debug!("writer stopped");
    }

    async fn write_batch(&mut self, batch: &[OutboundLine]) -> Result<(), String> {
        for item in batch {
            debug!(seq = item.seq, line = %item.line, "writing request");
            self.sink
                .feed(item.line.clone())
                .await
                .map_err(|e| e.to_string())?;
        }
        SinkExt::<String>::flush(&mut self.sink)
            .await
            .map_err(|e| e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
