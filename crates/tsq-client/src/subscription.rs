//! Notification subscriptions.
//!
//! A [`SubscriptionHandler`] owns one notification category: the request
//! that registers for it, the request that unregisters, and the set of
//! local listeners. The server is only told about the category while at
//! least one listener is present:
//!
//! - the first listener sends the subscribe request;
//! - listeners added while that is in flight share the same operation;
//! - removing the last listener sends the unsubscribe request.
//!
//! [`NotificationRouter`] reads the session's notification broadcast and
//! hands every notification to the handlers registered with it.
//!
//! The server's unregister command is not per category: it drops every
//! registration of the query client. Handlers registered with a router
//! therefore re-register the other categories that still have listeners
//! right after sending it. Both go through the session queue, so the
//! server sees the unregister first.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use tsq_core::{Notification, QueryError, Request};

use crate::session::Session;

/// Callback receiving notifications of a category.
pub trait NotificationListener: Send + Sync {
    /// Handle one notification.
    fn on_notification(&self, notification: &Notification);
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) {
        self(notification);
    }
}

/// Shared listener handle. Identity is the allocation, so keep the `Arc`
/// around to remove the listener later.
pub type Listener = Arc<dyn NotificationListener>;

/// Cloneable outcome of a subscribe or unsubscribe request.
pub type SubscriptionOp = Shared<BoxFuture<'static, Result<(), QueryError>>>;

fn completed_op() -> SubscriptionOp {
    futures::future::ready(Ok(())).boxed().shared()
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ─── Filter ─────────────────────────────────────────────────────────────────

/// Which notifications belong to a category.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    names: Vec<String>,
    field: Option<(String, String)>,
}

impl EventFilter {
    /// Match any of `names`.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            field: None,
        }
    }

    /// Additionally require the first record to carry `key=value`.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = Some((key.into(), value.into()));
        self
    }

    /// Whether `notification` is covered.
    pub fn matches(&self, notification: &Notification) -> bool {
        if !self.names.iter().any(|n| *n == notification.name) {
            return false;
        }
        match &self.field {
            None => true,
            Some((key, value)) => notification
                .records
                .first()
                .and_then(|r| r.get(key))
                .is_some_and(|v| v == value),
        }
    }
}

// ─── Categories ─────────────────────────────────────────────────────────────

/// Event groups a virtual server can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationCategory {
    /// Clients joining, leaving, and server edits.
    Server,
    /// Channel changes and client moves under channel `id` (0 = all).
    Channel(u32),
    /// Server-wide chat.
    TextServer,
    /// Chat in the query client's current channel.
    TextChannel,
    /// Private chat with the query client.
    TextPrivate,
    /// Privilege keys being used.
    TokenUsed,
}

impl NotificationCategory {
    /// Value of the `event` parameter.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Channel(_) => "channel",
            Self::TextServer => "textserver",
            Self::TextChannel => "textchannel",
            Self::TextPrivate => "textprivate",
            Self::TokenUsed => "tokenused",
        }
    }

    /// `servernotifyregister` request for this category.
    pub fn subscribe_request(self) -> Request {
        let builder = Request::builder("servernotifyregister").param("event", self.event_name());
        match self {
            Self::Channel(id) => builder.param("id", id).build(),
            _ => builder.build(),
        }
    }

    /// `servernotifyunregister` request.
    ///
    /// The server drops every registration of this query client at once;
    /// [`NotificationRouter`] restores the categories still in use.
    pub fn unsubscribe_request(self) -> Request {
        Request::new("servernotifyunregister")
    }

    /// Notifications delivered for this category.
    pub fn filter(self) -> EventFilter {
        match self {
            Self::Server => EventFilter::names([
                "notifycliententerview",
                "notifyclientleftview",
                "notifyserveredited",
            ]),
            Self::Channel(_) => EventFilter::names([
                "notifychanneledited",
                "notifychanneldescriptionchanged",
                "notifychannelpasswordchanged",
                "notifychannelcreated",
                "notifychanneldeleted",
                "notifychannelmoved",
                "notifyclientmoved",
                "notifycliententerview",
                "notifyclientleftview",
            ]),
            Self::TextServer => EventFilter::names(["notifytextmessage"]).with_field("targetmode", "3"),
            Self::TextChannel => EventFilter::names(["notifytextmessage"]).with_field("targetmode", "2"),
            Self::TextPrivate => EventFilter::names(["notifytextmessage"]).with_field("targetmode", "1"),
            Self::TokenUsed => EventFilter::names(["notifytokenused"]),
        }
    }
}

// ─── Handler ────────────────────────────────────────────────────────────────

type HandlerSet = RwLock<Vec<Arc<SubscriptionHandler>>>;

struct HandlerState {
    listeners: Vec<Listener>,
    current: SubscriptionOp,
}

/// Listener set for one category, bound to its subscribe/unsubscribe pair.
pub struct SubscriptionHandler {
    session: Session,
    subscribe: Request,
    unsubscribe: Request,
    filter: EventFilter,
    state: Mutex<HandlerState>,
    peers: Mutex<Weak<HandlerSet>>,
}

impl std::fmt::Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandler")
            .field("subscribe", &self.subscribe.command())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandler {
    /// A handler with an explicit command pair and filter.
    pub fn new(session: Session, subscribe: Request, unsubscribe: Request, filter: EventFilter) -> Arc<Self> {
        Arc::new(Self {
            session,
            subscribe,
            unsubscribe,
            filter,
            state: Mutex::new(HandlerState {
                listeners: Vec::new(),
                current: completed_op(),
            }),
            peers: Mutex::new(Weak::new()),
        })
    }

    /// A handler for one of the built-in categories.
    pub fn for_category(session: Session, category: NotificationCategory) -> Arc<Self> {
        Self::new(
            session,
            category.subscribe_request(),
            category.unsubscribe_request(),
            category.filter(),
        )
    }

    fn send(&self, request: &Request) -> SubscriptionOp {
        debug!(command = request.command(), "sending subscription request");
        self.session
            .send(request.clone())
            .map(|outcome| outcome.map(|_| ()))
            .boxed()
            .shared()
    }

    /// Add a listener, subscribing on the server if it is the first one.
    ///
    /// If the returned operation fails, the listener is removed again.
    pub fn add_handler(self: &Arc<Self>, listener: Listener) -> SubscriptionOp {
        let op = {
            let mut state = self.state.lock();
            if state.listeners.is_empty() {
                state.current = self.send(&self.subscribe);
            }
            state.listeners.push(Arc::clone(&listener));
            state.current.clone()
        };

        if !matches!(op.peek(), Some(Ok(()))) {
            let this = Arc::clone(self);
            let watched = op.clone();
            let _ = tokio::spawn(async move {
                if let Err(error) = watched.await {
                    warn!(%error, command = this.subscribe.command(), "subscribe failed, dropping listener");
                    this.forget(&listener);
                }
            });
        }
        op
    }

    /// Remove a listener, unsubscribing on the server if it was the last
    /// one. Unknown listeners leave everything untouched.
    pub fn remove_handler(&self, listener: &Listener) -> SubscriptionOp {
        let op = {
            let mut state = self.state.lock();
            let Some(index) = state.listeners.iter().position(|l| same_listener(l, listener)) else {
                return state.current.clone();
            };
            let _ = state.listeners.remove(index);
            if !state.listeners.is_empty() {
                return state.current.clone();
            }
            state.current = self.send(&self.unsubscribe);
            state.current.clone()
        };
        self.restore_peers();
        op
    }

    /// Remove every listener, unsubscribing if any were present.
    pub fn clear(&self) -> SubscriptionOp {
        let op = {
            let mut state = self.state.lock();
            if state.listeners.is_empty() {
                return state.current.clone();
            }
            state.listeners.clear();
            state.current = self.send(&self.unsubscribe);
            state.current.clone()
        };
        self.restore_peers();
        op
    }

    /// Re-register every sibling that shares this handler's unregister
    /// command and still has listeners. Must run without holding `state`.
    fn restore_peers(&self) {
        let Some(peers) = self.peers.lock().upgrade() else {
            return;
        };
        let peers = peers.read().clone();
        for peer in peers {
            if std::ptr::eq(Arc::as_ptr(&peer), self) || peer.unsubscribe != self.unsubscribe {
                continue;
            }
            peer.resubscribe();
        }
    }

    fn resubscribe(&self) {
        let mut state = self.state.lock();
        if state.listeners.is_empty() {
            return;
        }
        debug!(
            command = self.subscribe.command(),
            listeners = state.listeners.len(),
            "restoring registration dropped by unregister"
        );
        state.current = self.send(&self.subscribe);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Whether this handler's category covers `notification`.
    pub fn covers(&self, notification: &Notification) -> bool {
        self.filter.matches(notification)
    }

    /// Invoke every listener if the notification is covered.
    pub fn dispatch(&self, notification: &Notification) {
        if !self.covers(notification) {
            return;
        }
        let listeners = self.state.lock().listeners.clone();
        trace!(name = %notification.name, listeners = listeners.len(), "dispatching");
        for listener in listeners {
            listener.on_notification(notification);
        }
    }

    fn forget(&self, listener: &Listener) {
        let mut state = self.state.lock();
        if let Some(index) = state.listeners.iter().position(|l| same_listener(l, listener)) {
            let _ = state.listeners.remove(index);
        }
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

/// Fans session notifications out to subscription handlers.
pub struct NotificationRouter {
    session: Session,
    handlers: Arc<HandlerSet>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("handlers", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}

impl NotificationRouter {
    /// Start routing notifications of `session`.
    pub fn new(session: Session) -> Self {
        let handlers: Arc<HandlerSet> = Arc::default();
        let mut events = session.notifications();
        let routed = Arc::clone(&handlers);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(notification) => {
                        let targets = routed.read().clone();
                        for handler in targets {
                            handler.dispatch(&notification);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification router lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("notification router stopped");
        });

        Self {
            session,
            handlers,
            task,
        }
    }

    /// Register a handler built elsewhere.
    pub fn register(&self, handler: Arc<SubscriptionHandler>) {
        *handler.peers.lock() = Arc::downgrade(&self.handlers);
        self.handlers.write().push(handler);
    }

    /// The handler for `category`, created and registered on first use.
    ///
    /// All built-in categories share one unregister command. When the last
    /// listener of one category goes away, the categories that still have
    /// listeners are registered again.
    pub fn category(&self, category: NotificationCategory) -> Arc<SubscriptionHandler> {
        let subscribe = category.subscribe_request();
        let mut handlers = self.handlers.write();
        if let Some(existing) = handlers.iter().find(|h| h.subscribe == subscribe) {
            return Arc::clone(existing);
        }
        let handler = SubscriptionHandler::for_category(self.session.clone(), category);
        *handler.peers.lock() = Arc::downgrade(&self.handlers);
        handlers.push(Arc::clone(&handler));
        handler
    }

    /// Registered handlers.
    pub fn handlers(&self) -> Vec<Arc<SubscriptionHandler>> {
        self.handlers.read().clone()
    }
}

impl Drop for NotificationRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
