//! Turns a stream of parsed lines into replies and notifications.
//!
//! Data rows (lines without a leading command word) accumulate until a line
//! that carries one arrives. That line closes the reply: its `id`, `msg`, and
//! `extra_msg` fields become the status of a [`Response`] built from every
//! buffered row.
//!
//! Lines whose command starts with [`NOTIFY_PREFIX`] are forwarded as a
//! [`Notification`] first. They still close the reply when rows are
//! buffered, so a notification arriving in the middle of a multi-line reply
//! cuts that reply short.

use std::collections::VecDeque;

use tracing::{debug, warn};
use tsq_core::{Notification, QueryError, Record, Response};

use crate::line::parse_line;

/// Command word of the status line that ends every reply.
pub const STATUS_KEYWORD: &str = "error";

/// Prefix shared by all unsolicited notifications.
pub const NOTIFY_PREFIX: &str = "notify";

/// Output of the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete reply.
    Response(Response),
    /// An unsolicited server event.
    Notification(Notification),
}

/// Whether `command` names an unsolicited notification.
pub fn is_notification(command: &str) -> bool {
    command.starts_with(NOTIFY_PREFIX)
}

/// Accumulates data rows between status lines.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    rows: Vec<Record>,
}

impl ResponseAssembler {
    /// An assembler with nothing buffered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of data rows waiting for a status line.
    pub fn buffered(&self) -> usize {
        self.rows.len()
    }

    /// Drop any buffered rows.
    pub fn reset(&mut self) {
        self.rows.clear();
    }

    /// Feed one line; completed frames are appended to `out` in the order
    /// they must be delivered.
    pub fn push_line(&mut self, line: &str, out: &mut VecDeque<Frame>) -> Result<(), QueryError> {
        let parsed = parse_line(line)?;

        let Some(command) = parsed.command else {
            self.rows.extend(parsed.records);
            return Ok(());
        };

        if is_notification(&command) {
            let status = parsed.records.first().cloned().unwrap_or_default();
            out.push_back(Frame::Notification(Notification {
                name: command,
                records: parsed.records,
            }));
            if !self.rows.is_empty() {
                warn!(
                    rows = self.rows.len(),
                    "notification interrupted a multi-line reply, flushing buffered rows"
                );
                out.push_back(Frame::Response(self.flush(&status)));
            }
            return Ok(());
        }

        let mut records = parsed.records.into_iter();
        let status = records.next().unwrap_or_default();
        let extra = records.count();
        if extra > 0 {
            warn!(%command, extra, "ignoring extra segments on status line");
        }
        if command != STATUS_KEYWORD {
            debug!(%command, "unexpected command word closes reply");
        }
        out.push_back(Frame::Response(self.flush(&status)));
        Ok(())
    }

    fn flush(&mut self, status: &Record) -> Response {
        Response {
            records: std::mem::take(&mut self.rows),
            code: status.get_parsed("id").unwrap_or(0),
            message: status.get("msg").unwrap_or_default().to_string(),
            extra_message: status.get("extra_msg").map(str::to_string),
        }
    }
}
