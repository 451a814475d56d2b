//! Staggered connection racing ("happy eyeballs").
//!
//! The first candidate is dialed at once. Each stagger tick dials the next
//! untried candidate, and a failure dials the next candidate immediately
//! when no other attempt is in flight. The first successful dial wins;
//! every other attempt is dropped, which aborts it and closes its socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tsq_core::{QueryError, Result};

/// Default delay between two dial starts.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(50);

/// Races dials across an ordered candidate list.
#[derive(Clone, Copy, Debug)]
pub struct Connector {
    stagger: Duration,
    attempt_timeout: Option<Duration>,
}

impl Default for Connector {
    fn default() -> Self {
        Self {
            stagger: DEFAULT_STAGGER,
            attempt_timeout: None,
        }
    }
}

impl Connector {
    /// A connector with the default stagger and no per-attempt timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay between dial starts. Zero is bumped to one millisecond.
    #[must_use]
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger.max(Duration::from_millis(1));
        self
    }

    /// Give up on a single attempt after `timeout`.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Race TCP connects across `candidates`.
    pub async fn connect_tcp(&self, candidates: &[SocketAddr]) -> Result<(SocketAddr, TcpStream)> {
        let (addr, stream) = self.race(candidates, TcpStream::connect).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        Ok((addr, stream))
    }

    /// Race `dial` across `candidates` and return the first stream that
    /// connects.
    ///
    /// Fails with [`QueryError::ConnectFailure`] once every candidate has
    /// failed, carrying one cause per attempt.
    pub async fn race<S, F, Fut>(&self, candidates: &[SocketAddr], dial: F) -> Result<(SocketAddr, S)>
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = io::Result<S>>,
    {
        if candidates.is_empty() {
            warn!("no candidate addresses to connect to");
            return Err(QueryError::ConnectFailure {
                attempts: 0,
                causes: Vec::new(),
            });
        }

        let started = Instant::now();
        let mut attempts = FuturesUnordered::new();
        let mut tried = 0usize;
        let mut connecting = 0usize;
        let mut failed = 0usize;
        let mut causes = Vec::new();
        let mut dial_now = true;

        let mut ticker = tokio::time::interval_at(started + self.stagger, self.stagger);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if dial_now && tried < candidates.len() {
                let addr = candidates[tried];
                tried += 1;
                connecting += 1;
                debug!(%addr, attempt = tried, of = candidates.len(), "dialing");
                attempts.push(attempt(addr, &dial, self.attempt_timeout));
            }
            dial_now = false;

            tokio::select! {
                Some((addr, outcome)) = attempts.next() => match outcome {
                    Ok(stream) => {
                        info!(
                            %addr,
                            attempts = tried,
                            elapsed_ms = started.elapsed().as_millis(),
                            "connected"
                        );
                        // Dropping the remaining attempts aborts them.
                        return Ok((addr, stream));
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "dial failed");
                        causes.push(format!("{addr}: {e}"));
                        failed += 1;
                        if failed == candidates.len() {
                            warn!(attempts = failed, first = %causes[0], "all candidates failed");
                            return Err(QueryError::ConnectFailure { attempts: failed, causes });
                        }
                        connecting -= 1;
                        dial_now = connecting == 0;
                    }
                },
                _ = ticker.tick(), if tried < candidates.len() => dial_now = true,
                else => return Err(QueryError::ConnectFailure { attempts: failed, causes }),
            }
        }
    }
}

async fn attempt<S, F, Fut>(
    addr: SocketAddr,
    dial: &F,
    timeout: Option<Duration>,
) -> (SocketAddr, io::Result<S>)
where
    F: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, dial(addr))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))),
        None => dial(addr).await,
    };
    (addr, outcome)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
