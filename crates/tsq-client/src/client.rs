//! Connection bootstrap.
//!
//! [`QueryClient::connect`] takes a host (or explicit addresses) through
//! resolution, connection racing, banner validation, and session start,
//! then optionally logs in, selects a virtual server, and sets the display
//! name. A keepalive task keeps idle connections from being dropped by the
//! server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tsq_core::{QueryError, Request, Result};

use crate::connector::{Connector, DEFAULT_STAGGER};
use crate::handshake::{DEFAULT_HANDSHAKE_TIMEOUT, read_banner};
use crate::session::{
    ClosePolicy, DEFAULT_FORCE_CLOSE_TIMEOUT, ResponseHandle, Session, SessionOptions,
};
use crate::shaper::RateLimitPolicy;
use crate::subscription::{NotificationCategory, NotificationRouter, SubscriptionHandler};

/// Default ServerQuery port.
pub const DEFAULT_PORT: u16 = 10011;

/// Default interval between keepalive commands.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(240);

/// Login name and password of a query account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Query login name.
    pub username: String,
    /// Query password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to pick the virtual server after connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerSelector {
    /// By virtual server id (`use sid=`).
    Id(u32),
    /// By voice port (`use port=`).
    Port(u16),
}

impl ServerSelector {
    fn request(self) -> Request {
        match self {
            Self::Id(sid) => Request::builder("use").param("sid", sid).build(),
            Self::Port(port) => Request::builder("use").param("port", port).build(),
        }
    }
}

/// Everything [`QueryClient::connect`] needs.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Host name or address literal.
    pub host: String,
    /// Query port.
    pub port: u16,
    /// Pre-resolved candidates; when non-empty, `host` is not resolved.
    pub addresses: Vec<SocketAddr>,
    /// Login, if any.
    pub credentials: Option<Credentials>,
    /// Virtual server to select, if any.
    pub server: Option<ServerSelector>,
    /// Display name to set, if any.
    pub nickname: Option<String>,
    /// Command-rate policy.
    pub rate_limit: RateLimitPolicy,
    /// Delay between connection attempts.
    pub stagger: Duration,
    /// Per-attempt connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Time allowed for the banner.
    pub handshake_timeout: Duration,
    /// Fallback timeout for force-close requests.
    pub force_close_timeout: Duration,
    /// Keepalive interval; `None` disables it.
    pub keepalive: Option<Duration>,
}

impl ConnectOptions {
    /// Defaults for `host` on the standard port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            addresses: Vec::new(),
            credentials: None,
            server: None,
            nickname: None,
            rate_limit: RateLimitPolicy::Autodetect,
            stagger: DEFAULT_STAGGER,
            connect_timeout: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            force_close_timeout: DEFAULT_FORCE_CLOSE_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }

    /// Connect to explicit addresses instead of resolving a host.
    pub fn with_addresses(addresses: Vec<SocketAddr>) -> Self {
        let host = addresses.first().map(|a| a.ip().to_string()).unwrap_or_default();
        Self {
            addresses,
            ..Self::new(host)
        }
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Log in after connecting.
    #[must_use]
    pub fn login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Select a virtual server after connecting.
    #[must_use]
    pub fn server(mut self, server: ServerSelector) -> Self {
        self.server = Some(server);
        self
    }

    /// Set the display name after connecting.
    #[must_use]
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Set the rate-limit policy.
    #[must_use]
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    /// Set or disable the keepalive.
    #[must_use]
    pub fn keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    async fn candidates(&self) -> Result<Vec<SocketAddr>> {
        if !self.addresses.is_empty() {
            return Ok(self.addresses.clone());
        }
        let resolved = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| QueryError::ConnectFailure {
                attempts: 0,
                causes: vec![format!("resolving {}: {e}", self.host)],
            })?;
        let candidates: Vec<_> = resolved.collect();
        debug!(host = %self.host, candidates = candidates.len(), "resolved");
        Ok(candidates)
    }
}

/// A connected, optionally logged-in ServerQuery client.
#[derive(Debug)]
pub struct QueryClient {
    session: Session,
    router: Arc<NotificationRouter>,
    keepalive: Option<JoinHandle<()>>,
}

impl QueryClient {
    /// Connect and bootstrap a session.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let candidates = options.candidates().await?;
        let connector = Connector::new()
            .with_stagger(options.stagger)
            .with_attempt_timeout(options.connect_timeout);
        let (remote, mut stream) = connector.connect_tcp(&candidates).await?;

        let leftover = read_banner(&mut stream, options.handshake_timeout).await?;

        let rate_limit = options.rate_limit.resolve_for(remote);
        let session = Session::from_tcp(
            stream,
            leftover,
            remote,
            SessionOptions::default()
                .with_rate_limit(rate_limit)
                .with_force_close_timeout(options.force_close_timeout),
        );

        if let Err(error) = bootstrap(&session, &options).await {
            warn!(%error, "bootstrap failed, closing session");
            session.abort();
            return Err(error);
        }

        let keepalive = options
            .keepalive
            .map(|interval| tokio::spawn(keepalive_loop(session.clone(), interval)));
        let router = Arc::new(NotificationRouter::new(session.clone()));

        info!(%remote, "query client ready");
        Ok(Self {
            session,
            router,
            keepalive,
        })
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send a plain request.
    pub fn send(&self, request: Request) -> ResponseHandle {
        self.session.send(request)
    }

    /// Send a request with an explicit close policy.
    pub fn send_with_policy(&self, request: Request, policy: ClosePolicy) -> ResponseHandle {
        self.session.send_request(request, policy)
    }

    /// Notification router of this connection.
    pub fn subscriptions(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    /// Shorthand for the handler of a built-in category.
    pub fn category(&self, category: NotificationCategory) -> Arc<SubscriptionHandler> {
        self.router.category(category)
    }

    /// Send `quit` and wait for the session to close.
    pub async fn quit(self) -> Result<()> {
        let _ = self.session.close().await?;
        self.session.closed().await;
        Ok(())
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if !self.session.is_closed() {
            self.session.abort();
        }
    }
}

async fn bootstrap(session: &Session, options: &ConnectOptions) -> Result<()> {
    if let Some(credentials) = &options.credentials {
        let request = Request::builder("login")
            .param("client_login_name", &credentials.username)
            .param("client_login_password", &credentials.password)
            .build();
        let _ = session.send(request).await?;
        debug!(user = %credentials.username, "logged in");
    }

    if let Some(server) = options.server {
        let _ = session.send(server.request()).await?;
        debug!(?server, "virtual server selected");
    }

    if let Some(nickname) = &options.nickname {
        let request = Request::builder("clientupdate")
            .param("client_nickname", nickname)
            .build();
        let _ = session.send(request).await?;
        debug!(%nickname, "display name set");
    }
    Ok(())
}

async fn keepalive_loop(session: Session, interval: Duration) {
    loop {
        tokio::select! {
            () = session.closed() => break,
            () = tokio::time::sleep(interval) => {
                match session.send(Request::new("version")).await {
                    Ok(_) => debug!("keepalive"),
                    Err(e) if e.is_channel_closed() => break,
                    Err(e) => warn!(error = %e, "keepalive failed"),
                }
            }
        }
    }
    debug!("keepalive stopped");
}
