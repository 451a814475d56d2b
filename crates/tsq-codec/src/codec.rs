//! `tokio-util` framing for ServerQuery streams.
//!
//! Lines end at LF. A CR right before the LF is dropped, and so is a CR at
//! the start of a line: servers terminate lines with `\n\r`, which leaves
//! the CR at the head of the following line. Lines that are empty after
//! stripping are skipped.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;
use tsq_core::{QueryError, Request};

use crate::assembler::{Frame, ResponseAssembler};
use crate::line::encode_request;

/// Default maximum length of one inbound line (4 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Errors raised while framing the byte stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying transport error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be decoded.
    #[error(transparent)]
    Decode(#[from] QueryError),

    /// A line exceeded the configured maximum.
    #[error("line longer than {max} bytes")]
    LineTooLong {
        /// Configured limit.
        max: usize,
    },
}

impl CodecError {
    /// Collapse into the public error taxonomy.
    pub fn into_query_error(self) -> QueryError {
        match self {
            Self::Io(e) => QueryError::channel_closed(Some(&e.to_string())),
            Self::Decode(e) => e,
            Self::LineTooLong { max } => {
                QueryError::DecodeFailure(format!("line longer than {max} bytes"))
            }
        }
    }
}

/// Codec producing [`Frame`]s and encoding requests as single lines.
#[derive(Debug)]
pub struct QueryCodec {
    assembler: ResponseAssembler,
    ready: VecDeque<Frame>,
    /// Bytes of the read buffer already scanned for LF.
    scanned: usize,
    max_line_length: usize,
}

impl QueryCodec {
    /// A codec with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// A codec rejecting lines longer than `max_line_length` bytes.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            assembler: ResponseAssembler::new(),
            ready: VecDeque::new(),
            scanned: 0,
            max_line_length,
        }
    }

    /// Take the next complete, non-empty line out of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Used directly for the
    /// banner, which must not go through reply assembly.
    pub fn next_line(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_line_length {
                    return Err(CodecError::LineTooLong {
                        max: self.max_line_length,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.max_line_length {
                return Err(CodecError::LineTooLong {
                    max: self.max_line_length,
                });
            }

            let raw = src.split_to(end + 1);
            let mut line = &raw[..end];
            if let Some(rest) = line.strip_suffix(b"\r") {
                line = rest;
            }
            if let Some(rest) = line.strip_prefix(b"\r") {
                line = rest;
            }
            if line.is_empty() {
                continue;
            }

            let text = std::str::from_utf8(line)
                .map_err(|e| QueryError::DecodeFailure(format!("invalid UTF-8 in line: {e}")))?;
            trace!(line = text, "received line");
            return Ok(Some(text.to_string()));
        }
    }
}

impl Default for QueryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for QueryCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let Some(line) = self.next_line(src)? else {
                return Ok(None);
            };
            self.assembler.push_line(&line, &mut self.ready)?;
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // Treat an unterminated tail as a final line.
        if src.iter().any(|b| !matches!(b, b'\r' | b'\n')) {
            src.put_u8(b'\n');
            return self.decode(src);
        }
        src.advance(src.len());
        Ok(None)
    }
}

impl Encoder<&Request> for QueryCodec {
    type Error = CodecError;

    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.encode(encode_request(request), dst)
    }
}

impl Encoder<String> for QueryCodec {
    type Error = CodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn decode_all(codec: &mut QueryCodec, bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_crlf_and_lfcr_terminators() {
        let mut codec = QueryCodec::new();
        let frames = decode_all(&mut codec, b"cid=1\r\ncid=2\n\rerror id=0 msg=ok\n\r");
        assert_eq!(frames.len(), 1);
        let Frame::Response(resp) = &frames[0] else {
            panic!("expected response");
        };
        assert_eq!(resp.records.len(), 2);
    }

    #[test]
    fn partial_line_waits_for_more_bytes() {
        let mut codec = QueryCodec::new();
        let mut buf = BytesMut::from(&b"error id=0 ms"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"g=ok\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_matches!(frame, Frame::Response(r) if r.message == "ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn notification_and_flush_come_out_in_order() {
        let mut codec = QueryCodec::new();
        let frames = decode_all(&mut codec, b"cid=1\nnotifytokenused token=abc\n");
        assert_eq!(frames.len(), 2);
        assert_matches!(&frames[0], Frame::Notification(n) if n.name == "notifytokenused");
        assert_matches!(&frames[1], Frame::Response(r) if r.records.len() == 1);
    }

    #[test]
    fn rejects_overlong_line() {
        let mut codec = QueryCodec::with_max_line_length(8);
        let mut buf = BytesMut::from(&b"cid=123456789"[..]);
        assert_matches!(codec.decode(&mut buf), Err(CodecError::LineTooLong { max: 8 }));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut codec = QueryCodec::new();
        let mut buf = BytesMut::from(&b"name=\xff\xfe\n"[..]);
        assert_matches!(
            codec.decode(&mut buf),
            Err(CodecError::Decode(QueryError::DecodeFailure(_)))
        );
    }

    #[test]
    fn next_line_skips_blank_lines() {
        let mut codec = QueryCodec::new();
        let mut buf = BytesMut::from(&b"\r\n\n\rTS3\n\r"[..]);
        assert_eq!(codec.next_line(&mut buf).unwrap().as_deref(), Some("TS3"));
        assert!(codec.next_line(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_eof_flushes_unterminated_status() {
        let mut codec = QueryCodec::new();
        let mut buf = BytesMut::from(&b"error id=0 msg=ok"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let frame = codec.decode_eof(&mut buf).unwrap();
        assert_matches!(frame, Some(Frame::Response(_)));
    }

    #[test]
    fn decode_eof_ignores_trailing_cr() {
        let mut codec = QueryCodec::new();
        let mut buf = BytesMut::from(&b"\r"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_request_with_newline() {
        let mut codec = QueryCodec::new();
        let mut dst = BytesMut::new();
        let req = Request::builder("use").param("sid", 1).build();
        codec.encode(&req, &mut dst).unwrap();
        assert_eq!(&dst[..], b"use sid=1\n");
    }

    #[tokio::test]
    async fn framed_read_over_duplex() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut framed = FramedRead::new(client, QueryCodec::new());

        server
            .write_all(b"clid=1 client_nickname=a\n\rclid=2 client_nickname=b\n\rerror id=0 msg=ok\n\r")
            .await
            .unwrap();
        drop(server);

        let frame = framed.next().await.unwrap().unwrap();
        let Frame::Response(resp) = frame else {
            panic!("expected response");
        };
        assert_eq!(resp.records[1].get("client_nickname"), Some("b"));
        assert!(framed.next().await.is_none());
    }
}
