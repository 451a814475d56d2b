//! Banner validation.
//!
//! A ServerQuery server greets every connection with two fixed lines. They
//! are read here, before the session exists, under a read timeout that is
//! dropped once the banner checks out. Bytes that arrived after the banner
//! are handed back so the session decodes them first.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use tsq_codec::{CodecError, QueryCodec};
use tsq_core::{QueryError, Result};

/// Expected banner lines, in order.
pub const BANNER: [&str; 2] = [
    "TS3",
    "Welcome to the TeamSpeak 3 ServerQuery interface, type \"help\" for a list of commands and \"help <command>\" for information on a specific command.",
];

/// Default time allowed for the whole banner to arrive.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read and check the banner from `reader`.
///
/// Returns the bytes already read past the banner.
pub async fn read_banner<R>(reader: &mut R, timeout: Duration) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_banner_lines(reader)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis(), "banner did not arrive in time");
            Err(QueryError::HandshakeFailure(format!(
                "no banner within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

async fn read_banner_lines<R>(reader: &mut R) -> Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut codec = QueryCodec::new();
    let mut buf = BytesMut::with_capacity(512);

    for expected in BANNER {
        let line = loop {
            if let Some(line) = codec.next_line(&mut buf).map_err(CodecError::into_query_error)? {
                break line;
            }
            let read = reader
                .read_buf(&mut buf)
                .await
                .map_err(|e| QueryError::HandshakeFailure(format!("read failed: {e}")))?;
            if read == 0 {
                return Err(QueryError::HandshakeFailure(
                    "connection closed before banner".to_string(),
                ));
            }
        };

        if line != expected {
            warn!(expected, received = %line, "unexpected banner line");
            return Err(QueryError::HandshakeFailure(format!(
                "expected {expected:?}, received {line:?}"
            )));
        }
    }

    debug!(leftover = buf.len(), "banner accepted");
    Ok(buf)
}
