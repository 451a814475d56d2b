//! Settings types.
//!
//! Every struct uses `#[serde(default)]`, so a settings file only needs the
//! keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tsq_client::client::DEFAULT_KEEPALIVE;
use tsq_client::{ConnectOptions, DEFAULT_PORT, RateLimitPolicy, ServerSelector};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TsqSettings {
    /// Where to connect.
    pub connection: ConnectionSettings,
    /// Optional login and virtual server selection.
    pub login: LoginSettings,
    /// Command-rate policy.
    pub rate_limit: RateLimitPolicy,
    /// Protocol timeouts.
    pub timeouts: TimeoutSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Server address settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Host name or address literal.
    pub host: String,
    /// ServerQuery port.
    pub port: u16,
    /// Delay between staggered connection attempts, in milliseconds.
    pub stagger_ms: u64,
    /// Per-attempt connect timeout in milliseconds; `0` disables it.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            stagger_ms: 50,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Login and post-connect settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginSettings {
    /// Query login name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Query password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Virtual server id to select.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u32>,
    /// Voice port of the virtual server to select.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    /// Display name to set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Timeouts in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Time allowed for the banner.
    pub handshake_ms: u64,
    /// Fallback before a force-close request closes the connection.
    pub force_close_ms: u64,
    /// Keepalive interval; `0` disables the keepalive.
    pub keepalive_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_ms: 10_000,
            force_close_ms: 10_000,
            keepalive_ms: u64::try_from(DEFAULT_KEEPALIVE.as_millis()).unwrap_or(240_000),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

impl TsqSettings {
    /// Build [`ConnectOptions`] for these settings.
    ///
    /// Fails when values conflict: a login name without password, both a
    /// server id and a server port, or an empty host.
    pub fn to_connect_options(&self) -> Result<ConnectOptions> {
        let conn = &self.connection;
        if conn.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("connection.host is empty".to_string()));
        }
        if conn.port == 0 {
            return Err(SettingsError::InvalidValue("connection.port must be non-zero".to_string()));
        }

        let mut options = ConnectOptions::new(conn.host.trim())
            .port(conn.port)
            .rate_limit(self.rate_limit)
            .keepalive(non_zero_ms(self.timeouts.keepalive_ms));
        options.stagger = Duration::from_millis(conn.stagger_ms);
        options.connect_timeout = non_zero_ms(conn.connect_timeout_ms);
        if let Some(handshake) = non_zero_ms(self.timeouts.handshake_ms) {
            options.handshake_timeout = handshake;
        }
        if let Some(force_close) = non_zero_ms(self.timeouts.force_close_ms) {
            options.force_close_timeout = force_close;
        }

        let login = &self.login;
        match (&login.username, &login.password) {
            (Some(user), Some(password)) => options = options.login(user, password),
            (Some(user), None) => {
                return Err(SettingsError::InvalidValue(format!(
                    "login.username {user:?} set without login.password"
                )));
            }
            (None, _) => {}
        }

        match (login.server_id, login.server_port) {
            (Some(_), Some(_)) => {
                return Err(SettingsError::InvalidValue(
                    "login.serverId and login.serverPort are mutually exclusive".to_string(),
                ));
            }
            (Some(sid), None) => options = options.server(ServerSelector::Id(sid)),
            (None, Some(port)) => options = options.server(ServerSelector::Port(port)),
            (None, None) => {}
        }

        if let Some(nickname) = &login.nickname {
            options = options.nickname(nickname);
        }
        Ok(options)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
