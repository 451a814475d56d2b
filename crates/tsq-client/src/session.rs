//! Request/response correlation over one ServerQuery connection.
//!
//! The protocol has no request ids: replies arrive in the order requests
//! were written. The session keeps a FIFO of [`PendingRequest`]s and pairs
//! each assembled reply with the oldest entry. Enqueueing and handing the
//! line to the writer happen under the same lock, so queue order always
//! equals wire order.
//!
//! Two tasks run per session:
//!
//! - the I/O task owns the read half, decodes frames, completes pending
//!   requests, broadcasts notifications, and performs teardown;
//! - the writer task ([`WriteCoalescer`]) owns the write half and applies
//!   the rate limit.
//!
//! ```text
//! Open ──(close-policy request succeeds)──► Closing ──(transport closed)──► Closed
//!   └───────────────────(transport drops)──────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tsq_codec::{CodecError, DEFAULT_MAX_LINE_LENGTH, Frame, QueryCodec, encode_request};
use tsq_core::{Notification, QueryError, Request, Response, Result};

use crate::shaper::{
    DEFAULT_WRITE_BATCH, OutboundLine, RateLimit, RateLimiter, WriteCoalescer, WriteObserver,
};

/// Default grace period before a [`ClosePolicy::ForceClose`] request closes
/// the transport without a reply.
pub const DEFAULT_FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// What a request does to the session once answered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Plain request.
    #[default]
    Normal,
    /// Close the session when the reply is a success.
    CloseAfterSuccess,
    /// Close the session on any reply, or after the fallback timeout.
    ForceClose,
}

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting and correlating requests.
    Open,
    /// A close-policy request was answered; the transport is going away.
    Closing,
    /// The transport is gone.
    Closed,
}

/// Tunables for [`Session::start`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Command rate for the writer.
    pub rate_limit: RateLimit,
    /// Fallback timeout for [`ClosePolicy::ForceClose`].
    pub force_close_timeout: Duration,
    /// Lines written per flush.
    pub write_batch: usize,
    /// Longest accepted inbound line.
    pub max_line_length: usize,
    /// Buffered notifications per subscriber before it lags.
    pub notification_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            rate_limit: RateLimit::LIMITED,
            force_close_timeout: DEFAULT_FORCE_CLOSE_TIMEOUT,
            write_batch: DEFAULT_WRITE_BATCH,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl SessionOptions {
    /// Set the command rate.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the force-close fallback timeout.
    #[must_use]
    pub fn with_force_close_timeout(mut self, timeout: Duration) -> Self {
        self.force_close_timeout = timeout;
        self
    }
}

// ─── Pending requests ───────────────────────────────────────────────────────

/// An in-flight request waiting for its reply.
struct PendingRequest {
    seq: u64,
    command: String,
    policy: ClosePolicy,
    tx: oneshot::Sender<Result<Response>>,
}

impl PendingRequest {
    fn complete(self, response: Response) {
        let outcome = if response.is_success() {
            Ok(response)
        } else {
            Err(QueryError::ProtocolError {
                command: self.command,
                code: response.code,
                message: response.message,
                extra_message: response.extra_message,
            })
        };
        let _ = self.tx.send(outcome);
    }

    /// Resolve on teardown: close-policy requests got what they asked for.
    fn drain(self, cause: Option<&str>) {
        let outcome = match self.policy {
            ClosePolicy::Normal => Err(QueryError::channel_closed(cause)),
            ClosePolicy::CloseAfterSuccess | ClosePolicy::ForceClose => Ok(Response::empty()),
        };
        let _ = self.tx.send(outcome);
    }
}

/// Future resolving to the outcome of one request.
///
/// Dropping the handle discards the result; the request itself stays in
/// flight.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<Response>>,
}

impl Future for ResponseHandle {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(QueryError::channel_closed(None))))
    }
}

// ─── Shared state ───────────────────────────────────────────────────────────

struct SessionInner {
    state: SessionState,
    pending: VecDeque<PendingRequest>,
    next_seq: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundLine>>,
    closed_result: Option<Response>,
}

struct SessionShared {
    inner: Mutex<SessionInner>,
    /// Tells both tasks to drop their halves.
    shutdown: CancellationToken,
    /// Fires once the state is [`SessionState::Closed`].
    closed: CancellationToken,
    notifications: broadcast::Sender<Notification>,
    remote_addr: SocketAddr,
    force_close_timeout: Duration,
}

impl SessionShared {
    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => self.complete_next(response),
            Frame::Notification(notification) => {
                trace!(name = %notification.name, "notification");
                if self.notifications.send(notification).is_err() {
                    trace!("no notification subscribers");
                }
            }
        }
    }

    fn complete_next(&self, response: Response) {
        let (pending, close) = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.pop_front() else {
                warn!(code = response.code, message = %response.message, "reply with no pending request, dropping");
                return;
            };
            let close = match pending.policy {
                ClosePolicy::Normal => false,
                ClosePolicy::CloseAfterSuccess => response.is_success(),
                ClosePolicy::ForceClose => true,
            };
            if close && inner.state == SessionState::Open {
                inner.state = SessionState::Closing;
            }
            (pending, close)
        };

        debug!(command = %pending.command, code = response.code, rows = response.records.len(), "reply");
        if close {
            info!(command = %pending.command, "closing session after reply");
        }
        pending.complete(response);
        if close {
            self.shutdown.cancel();
        }
    }

    fn finish(&self, cause: Option<&str>) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.outbound = None;
            inner.closed_result = Some(Response::empty());
            std::mem::take(&mut inner.pending)
        };
        self.closed.cancel();

        match cause {
            Some(cause) => warn!(remote = %self.remote_addr, %cause, pending = drained.len(), "session closed"),
            None => info!(remote = %self.remote_addr, pending = drained.len(), "session closed"),
        }
        for pending in drained {
            pending.drain(cause);
        }
    }

    fn arm_force_close(&self) {
        let shutdown = self.shutdown.clone();
        let closed = self.closed.clone();
        let timeout = self.force_close_timeout;
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = closed.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    warn!(timeout_ms = timeout.as_millis(), "no reply to force-close request, closing transport");
                    shutdown.cancel();
                }
            }
        });
    }
}

impl WriteObserver for SessionShared {
    fn on_written(&self, seq: u64) {
        let arm = {
            let inner = self.inner.lock();
            inner.state != SessionState::Closed
                && inner
                    .pending
                    .iter()
                    .any(|p| p.seq == seq && p.policy == ClosePolicy::ForceClose)
        };
        if arm {
            self.arm_force_close();
        }
    }

    fn on_write_failed(&self, seq: u64, error: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let index = inner.pending.iter().position(|p| p.seq == seq);
            index.and_then(|i| inner.pending.remove(i))
        };
        if let Some(pending) = removed {
            warn!(command = %pending.command, %error, "request could not be written");
            let _ = pending.tx.send(Err(QueryError::SendFailure(error.to_string())));
        }
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Handle to a running session. Cheap to clone; all clones share the same
/// connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote_addr", &self.shared.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session over a split transport.
    ///
    /// `leftover` holds bytes already read past the banner. Must be called
    /// from within a tokio runtime.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        leftover: BytesMut,
        remote_addr: SocketAddr,
        options: SessionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(options.notification_capacity.max(1));

        let shared = Arc::new(SessionShared {
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                pending: VecDeque::new(),
                next_seq: 0,
                outbound: Some(outbound),
                closed_result: None,
            }),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            notifications,
            remote_addr,
            force_close_timeout: options.force_close_timeout,
        });

        let coalescer = WriteCoalescer::new(writer, RateLimiter::new(options.rate_limit))
            .with_batch_size(options.write_batch);
        let observer: Arc<dyn WriteObserver> = shared.clone();
        let _ = tokio::spawn(coalescer.run(rx, observer, shared.shutdown.clone()));

        let codec = QueryCodec::with_max_line_length(options.max_line_length);
        let _ = tokio::spawn(read_loop(Arc::clone(&shared), reader, codec, leftover));

        info!(
            remote = %remote_addr,
            rate_limit = options.rate_limit.commands,
            "session started"
        );
        Self { shared }
    }

    /// Start a session over a connected TCP stream.
    pub fn from_tcp(
        stream: TcpStream,
        leftover: BytesMut,
        remote_addr: SocketAddr,
        options: SessionOptions,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self::start(reader, writer, leftover, remote_addr, options)
    }

    /// Send a request. Never blocks; the handle resolves with the reply.
    pub fn send_request(&self, request: Request, policy: ClosePolicy) -> ResponseHandle {
        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle { rx };
        let command = request.command().to_string();

        let mut inner = self.shared.inner.lock();
        if inner.state == SessionState::Closed {
            let outcome = match policy {
                ClosePolicy::Normal => Err(QueryError::channel_closed(None)),
                ClosePolicy::CloseAfterSuccess | ClosePolicy::ForceClose => {
                    Ok(inner.closed_result.clone().unwrap_or_else(Response::empty))
                }
            };
            drop(inner);
            debug!(%command, ?policy, "session closed, request not sent");
            let _ = tx.send(outcome);
            return handle;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let line = encode_request(&request);
        inner.pending.push_back(PendingRequest {
            seq,
            command,
            policy,
            tx,
        });
        // A stopped writer means teardown is underway; the entry is drained
        // with the rest of the queue.
        if let Some(outbound) = &inner.outbound {
            if outbound.send(OutboundLine { seq, line }).is_err() {
                debug!(seq, "writer stopped, request left for teardown");
            }
        }
        handle
    }

    /// [`send_request`](Self::send_request) with [`ClosePolicy::Normal`].
    pub fn send(&self, request: Request) -> ResponseHandle {
        self.send_request(request, ClosePolicy::Normal)
    }

    /// Ask the server to end the session (`quit`, force-close).
    pub fn close(&self) -> ResponseHandle {
        self.send_request(Request::new("quit"), ClosePolicy::ForceClose)
    }

    /// Drop the transport now without sending anything.
    pub fn abort(&self) {
        self.shared.shutdown.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Whether the transport is gone.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Resolves once the session is [`SessionState::Closed`].
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Subscribe to unsolicited notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Address of the server.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }
}

// ─── I/O task ───────────────────────────────────────────────────────────────

async fn read_loop<R>(shared: Arc<SessionShared>, reader: R, mut codec: QueryCodec, mut leftover: BytesMut)
where
    R: AsyncRead + Unpin,
{
    let cause = match drain_leftover(&shared, &mut codec, &mut leftover) {
        Err(e) => Some(e.to_string()),
        Ok(()) => {
            let mut frames = FramedRead::new(reader, codec);
            frames.read_buffer_mut().extend_from_slice(&leftover);
            loop {
                tokio::select! {
                    biased;
                    () = shared.shutdown.cancelled() => break None,
                    frame = frames.next() => match frame {
                        Some(Ok(frame)) => shared.handle_frame(frame),
                        Some(Err(e)) => break Some(e.to_string()),
                        None => {
                            debug!(remote = %shared.remote_addr, "transport closed by peer");
                            break None;
                        }
                    },
                }
            }
        }
    };

    shared.shutdown.cancel();
    shared.finish(cause.as_deref());
}

/// Decode complete frames left over from the handshake.
fn drain_leftover(
    shared: &SessionShared,
    codec: &mut QueryCodec,
    leftover: &mut BytesMut,
) -> std::result::Result<(), CodecError> {
    while let Some(frame) = codec.decode(leftover)? {
        shared.handle_frame(frame);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::time::Instant;

    fn remote() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 10], 10011))
    }

    fn options() -> SessionOptions {
        SessionOptions::default().with_rate_limit(RateLimit::UNLIMITED)
    }

    struct FakeServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn expect(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }

        async fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }
    }

    fn start_pair() -> (Session, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(client);
        let session = Session::start(r, w, BytesMut::new(), remote(), options());
        let (sr, sw) = tokio::io::split(server);
        let server = FakeServer {
            lines: BufReader::new(sr).lines(),
            writer: sw,
        };
        (session, server)
    }

    /// Writer that records everything it is given.
    #[derive(Clone, Default)]
    struct RecordingWriter(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for RecordingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.0.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn multi_row_reply() {
        let (session, mut server) = start_pair();
        let handle = session.send(Request::new("channellist"));
        assert_eq!(server.expect().await, "channellist");
        server.send("cid=1 pid=0\n\rcid=2 pid=0\n\rerror id=0 msg=ok\n\r").await;

        let resp = handle.await.unwrap();
        assert_eq!(resp.records.len(), 2);
        assert_eq!(resp.records[0].get("cid"), Some("1"));
        assert_eq!(resp.records[1].get("cid"), Some("2"));
        assert_eq!(resp.code, 0);
        assert_eq!(resp.message, "ok");
    }

    #[tokio::test]
    async fn error_status_becomes_protocol_error() {
        let (session, mut server) = start_pair();
        let handle = session.send(Request::new("bogus"));
        let _ = server.expect().await;
        server.send("error id=256 msg=command\\snot\\sfound\n").await;

        let err = handle.await.unwrap_err();
        assert_matches!(
            &err,
            QueryError::ProtocolError { command, code: 256, message, .. }
                if command == "bogus" && message == "command not found"
        );
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn back_to_back_requests_complete_in_send_order() {
        let (session, mut server) = start_pair();
        let a = session.send(Request::new("whoami"));
        let b = session.send(Request::new("version"));
        assert_eq!(server.expect().await, "whoami");
        assert_eq!(server.expect().await, "version");
        server
            .send("client_id=1\nerror id=0 msg=ok\nversion=3.13\nerror id=0 msg=ok\n")
            .await;

        assert_eq!(a.await.unwrap().records[0].get("client_id"), Some("1"));
        assert_eq!(b.await.unwrap().records[0].get("version"), Some("3.13"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fifo_holds_under_concurrent_senders() {
        let (session, mut server) = start_pair();
        const N: usize = 64;

        let echo = tokio::spawn(async move {
            for _ in 0..N {
                let line = server.expect().await;
                let n = line.strip_prefix("echo n=").unwrap().to_string();
                server.send(&format!("n={n}\nerror id=0 msg=ok\n")).await;
            }
            server
        });

        let mut tasks = Vec::new();
        for i in 0..N {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let resp = session
                    .send(Request::builder("echo").param("n", i).build())
                    .await
                    .unwrap();
                assert_eq!(resp.records[0].get_parsed::<usize>("n"), Some(i));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(echo.await.unwrap());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn transport_drop_fails_normal_request() {
        let (session, mut server) = start_pair();
        let handle = session.send(Request::new("serverinfo"));
        let _ = server.expect().await;
        drop(server);

        let err = handle.await.unwrap_err();
        assert!(err.is_channel_closed());
        assert!(err.to_string().contains("Channel closed"));
        session.closed().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn close_after_success_closes_session() {
        let (session, mut server) = start_pair();
        let quit = session.send_request(Request::new("quit"), ClosePolicy::CloseAfterSuccess);
        let _ = server.expect().await;
        server.send("error id=0 msg=ok\n").await;

        assert!(quit.await.is_ok());
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_matches!(
            session.send(Request::new("version")).await,
            Err(QueryError::ChannelClosed { cause: None })
        );
    }

    #[tokio::test]
    async fn close_after_success_keeps_session_on_error() {
        let (session, mut server) = start_pair();
        let handle = session.send_request(Request::new("logout"), ClosePolicy::CloseAfterSuccess);
        let _ = server.expect().await;
        server.send("error id=518 msg=not\\slogged\\sin\n").await;

        assert_eq!(handle.await.unwrap_err().code(), Some(518));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn requests_queued_behind_quit_are_drained() {
        let (session, mut server) = start_pair();
        let quit = session.send_request(Request::new("quit"), ClosePolicy::CloseAfterSuccess);
        let late = session.send(Request::new("version"));
        let _ = server.expect().await;
        server.send("error id=0 msg=ok\n").await;

        assert!(quit.await.is_ok());
        assert!(late.await.unwrap_err().is_channel_closed());
    }

    #[tokio::test]
    async fn closed_session_answers_close_requests_from_cache() {
        let (client, server) = tokio::io::duplex(1024);
        let recorder = RecordingWriter::default();
        let session = Session::start(client, recorder.clone(), BytesMut::new(), remote(), options());
        drop(server);
        session.closed().await;

        let written = recorder.0.lock().len();
        let first = session
            .send_request(Request::new("quit"), ClosePolicy::CloseAfterSuccess)
            .await
            .unwrap();
        let second = session.close().await.unwrap();
        assert_eq!(first, Response::empty());
        assert_eq!(second, first);

        tokio::task::yield_now().await;
        assert_eq!(recorder.0.lock().len(), written);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_falls_back_to_timer() {
        let (session, mut server) = start_pair();
        let start = Instant::now();
        let quit = session.close();
        assert_eq!(server.expect().await, "quit");

        session.closed().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= DEFAULT_FORCE_CLOSE_TIMEOUT, "{elapsed:?}");
        assert!(elapsed < DEFAULT_FORCE_CLOSE_TIMEOUT + Duration::from_millis(100), "{elapsed:?}");
        assert_eq!(quit.await.unwrap(), Response::empty());
    }

    #[tokio::test]
    async fn force_close_reply_closes_at_once() {
        let (session, mut server) = start_pair();
        let quit = session.close();
        let _ = server.expect().await;
        server.send("error id=0 msg=ok\n").await;

        assert!(quit.await.is_ok());
        session.closed().await;
    }

    #[tokio::test]
    async fn write_failure_fails_only_that_request() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = Session::start(client, BrokenWriter, BytesMut::new(), remote(), options());

        let err = session.send(Request::new("version")).await.unwrap_err();
        assert_matches!(err, QueryError::SendFailure(msg) if msg.contains("broken pipe"));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn notifications_are_broadcast() {
        let (session, mut server) = start_pair();
        let mut events = session.notifications();
        let handle = session.send(Request::new("clientlist"));
        let _ = server.expect().await;
        server
            .send("notifycliententerview cfid=0 ctid=1 clid=9 client_nickname=eve\nclid=1\nerror id=0 msg=ok\n")
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "notifycliententerview");
        assert_eq!(event.records[0].get("client_nickname"), Some("eve"));
        let resp = handle.await.unwrap();
        assert_eq!(resp.records.len(), 1);
    }

    #[tokio::test]
    async fn unsolicited_reply_is_dropped() {
        let (session, mut server) = start_pair();
        server.send("error id=0 msg=ok\n").await;
        tokio::task::yield_now().await;

        let handle = session.send(Request::new("version"));
        let _ = server.expect().await;
        server.send("version=3\nerror id=0 msg=ok\n").await;
        assert_eq!(handle.await.unwrap().records[0].get("version"), Some("3"));
    }

    #[tokio::test]
    async fn leftover_bytes_are_decoded_first() {
        let (client, _server) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(client);
        let leftover = BytesMut::from(&b"notifytokenused token=abc\n\r"[..]);
        let session = Session::start(r, w, leftover, remote(), options());
        let mut events = session.notifications();

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "notifytokenused");
    }

    #[tokio::test]
    async fn abort_drains_with_channel_closed() {
        let (session, mut server) = start_pair();
        let handle = session.send(Request::new("serverinfo"));
        let _ = server.expect().await;
        session.abort();

        assert_matches!(handle.await, Err(QueryError::ChannelClosed { .. }));
        session.closed().await;
    }
}
