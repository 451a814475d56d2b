//! # tsq-core
//!
//! Shared vocabulary for the tsq ServerQuery client.
//!
//! - **Requests**: [`Request`] built through [`RequestBuilder`], with ordered
//!   parameters and bare flags
//! - **Replies**: [`Response`] made of [`Record`]s plus a status line, and
//!   unsolicited [`Notification`]s
//! - **Errors**: [`QueryError`] taxonomy via `thiserror`
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod logging;
pub mod request;
pub mod response;

pub use errors::{QueryError, Result};
pub use request::{Request, RequestBuilder};
pub use response::{Notification, Record, Response};
