//! Turning typed command lines into requests.
//!
//! Input uses the wire syntax (`clientlist -uid -away`,
//! `sendtextmessage targetmode=3 target=1 msg=hi\sall`). The line is parsed
//! and rebuilt as a [`Request`], so it is re-escaped consistently on send.

use anyhow::{Result, bail};
use tsq_client::NotificationCategory;
use tsq_codec::parse_line;
use tsq_core::Request;

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_command_line(line: &str) -> Result<Option<Request>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if line.contains('|') {
        bail!("piped parameter groups are not supported: {line}");
    }

    let parsed = parse_line(line)?;
    let Some(command) = parsed.command else {
        bail!("line does not start with a command: {line}");
    };

    let mut builder = Request::builder(command);
    for record in &parsed.records {
        for (key, value) in record.iter() {
            if value.is_empty() && key.starts_with('-') {
                builder = builder.flag(key);
            } else {
                builder = builder.param(key, value);
            }
        }
    }
    Ok(Some(builder.build()))
}

/// Parse a `--listen` value.
pub fn parse_category(name: &str) -> Result<NotificationCategory> {
    let lower = name.trim().to_ascii_lowercase();
    if let Some(id) = lower.strip_prefix("channel:") {
        return Ok(NotificationCategory::Channel(id.parse()?));
    }
    Ok(match lower.as_str() {
        "server" => NotificationCategory::Server,
        "channel" => NotificationCategory::Channel(0),
        "textserver" => NotificationCategory::TextServer,
        "textchannel" => NotificationCategory::TextChannel,
        "textprivate" => NotificationCategory::TextPrivate,
        "tokenused" => NotificationCategory::TokenUsed,
        other => bail!(
            "unknown category {other:?} (expected server, channel[:id], textserver, textchannel, textprivate or tokenused)"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn plain_command() {
        let req = parse_command_line("whoami").unwrap().unwrap();
        assert_eq!(req.command(), "whoami");
        assert_eq!(req.params().count(), 0);
    }

    #[test]
    fn params_are_unescaped_and_flags_kept() {
        let req = parse_command_line(r"clientlist -uid -away").unwrap().unwrap();
        assert!(req.has_flag("-uid"));
        assert!(req.has_flag("-away"));

        let req = parse_command_line(r"sendtextmessage targetmode=3 msg=hi\sall").unwrap().unwrap();
        assert_eq!(req.param("msg"), Some("hi all"));
        assert_eq!(req.param("targetmode"), Some("3"));
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_command_line("   ").unwrap().is_none());
        assert!(parse_command_line("# list clients").unwrap().is_none());
    }

    #[test]
    fn rejects_lines_without_command() {
        assert!(parse_command_line("cid=1").is_err());
        assert!(parse_command_line("clientkick clid=1|clid=2").is_err());
        assert!(parse_command_line(r"use sid=\q").is_err());
    }

    #[test]
    fn categories() {
        assert_matches!(parse_category("Server"), Ok(NotificationCategory::Server));
        assert_matches!(parse_category("channel"), Ok(NotificationCategory::Channel(0)));
        assert_matches!(parse_category("channel:12"), Ok(NotificationCategory::Channel(12)));
        assert_matches!(parse_category("textprivate"), Ok(NotificationCategory::TextPrivate));
        assert!(parse_category("channel:x").is_err());
        assert!(parse_category("voice").is_err());
    }
}
