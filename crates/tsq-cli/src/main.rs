//! # tsq
//!
//! Command-line ServerQuery client: connects, runs command lines from the
//! arguments or stdin in order, and optionally stays connected to print
//! notifications.

#![deny(unsafe_code)]

mod input;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tsq_client::{Notification, QueryClient, RateLimitPolicy};
use tsq_settings::TsqSettings;

use crate::input::{parse_category, parse_command_line};
use crate::output::{Format, render_notification, render_response};

/// ServerQuery command-line client.
#[derive(Parser, Debug)]
#[command(name = "tsq", about = "ServerQuery command-line client")]
struct Cli {
    /// Server host (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// ServerQuery port (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Query login name.
    #[arg(long, short = 'u')]
    user: Option<String>,

    /// Query password.
    #[arg(long)]
    password: Option<String>,

    /// Virtual server id to select.
    #[arg(long)]
    server_id: Option<u32>,

    /// Display name for the query client.
    #[arg(long)]
    nickname: Option<String>,

    /// Rate limit: unlimited, limited or autodetect.
    #[arg(long)]
    rate_limit: Option<RateLimitPolicy>,

    /// Settings file (default `~/.tsq/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Print replies and notifications as JSON.
    #[arg(long)]
    json: bool,

    /// Subscribe to a notification category and print events until Ctrl-C.
    #[arg(long, value_name = "CATEGORY")]
    listen: Vec<String>,

    /// Command lines to run; read from stdin when empty.
    commands: Vec<String>,
}

impl Cli {
    fn apply_to(&self, settings: &mut TsqSettings) {
        if let Some(host) = &self.host {
            settings.connection.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.connection.port = port;
        }
        if let Some(user) = &self.user {
            settings.login.username = Some(user.clone());
        }
        if let Some(password) = &self.password {
            settings.login.password = Some(password.clone());
        }
        if let Some(sid) = self.server_id {
            settings.login.server_id = Some(sid);
            settings.login.server_port = None;
        }
        if let Some(nickname) = &self.nickname {
            settings.login.nickname = Some(nickname.clone());
        }
        if let Some(policy) = self.rate_limit {
            settings.rate_limit = policy;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(tsq_settings::settings_path);
    let mut settings = tsq_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply_to(&mut settings);

    if settings.logging.json {
        tsq_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        tsq_core::logging::init_subscriber(&settings.logging.level);
    }

    let format = if args.json { Format::Json } else { Format::Text };
    let categories = args
        .listen
        .iter()
        .map(|name| parse_category(name))
        .collect::<Result<Vec<_>>>()?;

    let options = settings.to_connect_options().context("Invalid connection settings")?;
    let client = QueryClient::connect(options)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.connection.host))?;

    for category in &categories {
        let listener = Arc::new(move |n: &Notification| match render_notification(n, format) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to render notification"),
        });
        client
            .category(*category)
            .add_handler(listener)
            .await
            .with_context(|| format!("Failed to subscribe to {}", category.event_name()))?;
    }

    let mut failed = false;
    if args.commands.is_empty() && categories.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            failed |= !run_line(&client, &line, format).await;
        }
    } else {
        for line in &args.commands {
            failed |= !run_line(&client, line, format).await;
        }
    }

    if !categories.is_empty() {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C")?,
            () = client.session().closed() => tracing::warn!("server closed the connection"),
        }
    }

    if let Err(e) = client.quit().await {
        tracing::debug!(error = %e, "quit failed");
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Run one command line; returns whether it succeeded.
async fn run_line(client: &QueryClient, line: &str, format: Format) -> bool {
    let request = match parse_command_line(line) {
        Ok(Some(request)) => request,
        Ok(None) => return true,
        Err(e) => {
            eprintln!("{e}");
            return false;
        }
    };

    match client.send(request).await {
        Ok(response) => match render_response(&response, format) {
            Ok(text) => {
                println!("{text}");
                true
            }
            Err(e) => {
                eprintln!("{e}");
                false
            }
        },
        Err(e) => {
            eprintln!("{e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags_and_commands() {
        let cli = Cli::try_parse_from([
            "tsq",
            "--host",
            "ts.example.net",
            "--user",
            "serveradmin",
            "--server-id",
            "2",
            "--rate-limit",
            "limited",
            "--listen",
            "textserver",
            "clientlist -uid",
            "version",
        ])
        .unwrap();
        assert_eq!(cli.host.as_deref(), Some("ts.example.net"));
        assert_eq!(cli.rate_limit, Some(RateLimitPolicy::Limited));
        assert_eq!(cli.listen, vec!["textserver"]);
        assert_eq!(cli.commands, vec!["clientlist -uid", "version"]);
    }

    #[test]
    fn cli_rejects_bad_rate_limit() {
        assert!(Cli::try_parse_from(["tsq", "--rate-limit", "turbo"]).is_err());
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::try_parse_from(["tsq", "--port", "10022", "--server-id", "4", "--log-level", "debug"]).unwrap();
        let mut settings = TsqSettings::default();
        settings.login.server_port = Some(9987);
        cli.apply_to(&mut settings);
        assert_eq!(settings.connection.port, 10022);
        assert_eq!(settings.login.server_id, Some(4));
        assert_eq!(settings.login.server_port, None);
        assert_eq!(settings.logging.level, "debug");
    }
}
