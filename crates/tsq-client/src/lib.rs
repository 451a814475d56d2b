//! # tsq-client
//!
//! Async ServerQuery client on tokio.
//!
//! - [`connector`]: staggered connection racing across candidate addresses
//! - [`handshake`]: banner validation before a session starts
//! - [`shaper`]: rate limiting and write coalescing on the outbound path
//! - [`session`]: FIFO request/response correlation and close policies
//! - [`subscription`]: reference-counted notification subscriptions
//! - [`client`]: [`QueryClient::connect`] bootstrap and keepalive

#![deny(unsafe_code)]

pub mod client;
pub mod connector;
pub mod handshake;
pub mod session;
pub mod shaper;
pub mod subscription;

pub use client::{ConnectOptions, Credentials, DEFAULT_PORT, QueryClient, ServerSelector};
pub use connector::Connector;
pub use session::{ClosePolicy, ResponseHandle, Session, SessionOptions, SessionState};
pub use shaper::{RateLimit, RateLimitPolicy};
pub use subscription::{
    EventFilter, Listener, NotificationCategory, NotificationListener, NotificationRouter,
    SubscriptionHandler, SubscriptionOp,
};
pub use tsq_core::{Notification, QueryError, Record, Request, Response};
