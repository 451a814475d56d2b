//! # tsq-codec
//!
//! Wire format of the ServerQuery protocol:
//!
//! - [`escape`]: the escape table for keys and values
//! - [`line`]: splitting a line into a command word and records
//! - [`assembler`]: grouping data rows and status lines into replies
//! - [`codec`]: `tokio-util` [`Decoder`](tokio_util::codec::Decoder) /
//!   [`Encoder`](tokio_util::codec::Encoder) over byte streams

#![deny(unsafe_code)]

pub mod assembler;
pub mod codec;
pub mod escape;
pub mod line;

pub use assembler::{Frame, NOTIFY_PREFIX, ResponseAssembler, STATUS_KEYWORD, is_notification};
pub use codec::{CodecError, DEFAULT_MAX_LINE_LENGTH, QueryCodec};
pub use escape::{escape, unescape};
pub use line::{ParsedLine, encode_request, parse_line};
