//! Printing replies and notifications.

use std::fmt::Write as _;

use anyhow::Result;
use tsq_codec::escape;
use tsq_core::{Notification, Record, Response};

/// Output style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Wire-style `key=value` lines.
    Text,
    /// One JSON object per reply or notification.
    Json,
}

fn render_record(record: &Record) -> String {
    let mut out = String::new();
    for (key, value) in record.iter() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&escape(key));
        if !value.is_empty() {
            out.push('=');
            out.push_str(&escape(value));
        }
    }
    out
}

/// Render a reply: one line per record, then the status line.
pub fn render_response(response: &Response, format: Format) -> Result<String> {
    if format == Format::Json {
        return Ok(serde_json::to_string(response)?);
    }
    let mut out = String::new();
    for record in &response.records {
        out.push_str(&render_record(record));
        out.push('\n');
    }
    let _ = write!(out, "error id={} msg={}", response.code, escape(&response.message));
    if let Some(extra) = &response.extra_message {
        let _ = write!(out, " extra_msg={}", escape(extra));
    }
    Ok(out)
}

/// Render a notification on one line.
pub fn render_notification(notification: &Notification, format: Format) -> Result<String> {
    if format == Format::Json {
        return Ok(serde_json::to_string(notification)?);
    }
    let segments: Vec<String> = notification.records.iter().map(render_record).collect();
    Ok(format!("{} {}", notification.name, segments.join("|")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn text_response() {
        let response = Response {
            records: vec![
                record(&[("clid", "1"), ("client_nickname", "Bob Smith")]),
                record(&[("clid", "2"), ("client_away", "")]),
            ],
            code: 0,
            message: "ok".into(),
            extra_message: None,
        };
        assert_eq!(
            render_response(&response, Format::Text).unwrap(),
            "clid=1 client_nickname=Bob\\sSmith\nclid=2 client_away\nerror id=0 msg=ok"
        );
    }

    #[test]
    fn text_status_with_extra() {
        let response = Response {
            records: Vec::new(),
            code: 1538,
            message: "invalid parameter".into(),
            extra_message: Some("missing sid".into()),
        };
        assert_eq!(
            render_response(&response, Format::Text).unwrap(),
            "error id=1538 msg=invalid\\sparameter extra_msg=missing\\ssid"
        );
    }

    #[test]
    fn json_response() {
        let json = render_response(&Response::empty(), Format::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["code"], 0);
        assert_eq!(value["message"], "ok");
    }

    #[test]
    fn text_notification() {
        let notification = Notification {
            name: "notifyclientleftview".into(),
            records: vec![record(&[("clid", "5")]), record(&[("clid", "6")])],
        };
        assert_eq!(
            render_notification(&notification, Format::Text).unwrap(),
            "notifyclientleftview clid=5|clid=6"
        );
    }
}
