//! The shared realtime connection.
//!
//! One [`Connection`] exists per process. It holds the event-name → handler
//! registry, publishes the lifecycle state, and queues outbound frames for
//! the [`transport`] task. Pages never own it; they hold clones of the
//! handle through their [`Session`](crate::session::Session).
//!
//! # Lifecycle signals
//!
//! The transport drives the state through `mark_*` calls, each of which is
//! also dispatched to subscribers as an event:
//!
//! | call                  | state          | dispatched                      |
//! |-----------------------|----------------|---------------------------------|
//! | `mark_connecting`     | connecting / reconnecting | -                    |
//! | `mark_connected`      | connected      | `connect`, then `reconnect` if not the first |
//! | `mark_disconnected`   | disconnected   | `disconnect(reason)`            |
//! | `mark_connect_error`  | disconnected   | `connect_error(err)`            |

pub mod backoff;
pub mod codec;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::events;

/// Callback invoked with an event's payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one subscription on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// A named request waiting for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub event: String,
    pub payload: Value,
}

struct Binding {
    id: HandlerId,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    bindings: HashMap<String, Vec<Binding>>,
    ever_connected: bool,
    reconnect_attempts: u32,
    /// Successful connects so far.
    epoch: u64,
}

struct Inner {
    registry: Mutex<Registry>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    closed: AtomicBool,
}

/// Handle to the shared realtime connection. Clones share the same channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create the connection and the receiver the transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        let conn = Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                state_tx,
                outbound_tx,
                closed: AtomicBool::new(false),
            }),
        };

        (conn, outbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of successful connects so far.
    ///
    /// Bumped before `connect` is dispatched, so handlers of one connect
    /// and of the `reconnect` that follows it observe the same value.
    pub fn epoch(&self) -> u64 {
        self.inner.registry.lock().epoch
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut the connection down. Every later operation is a logged no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.lock().bindings.clear();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!("Realtime connection closed");
    }

    pub fn subscribe(&self, event: &str, handler: Handler) -> HandlerId {
        self.bind(event, handler, false)
    }

    /// Subscribe a handler that is removed after its first invocation.
    pub fn once(&self, event: &str, handler: Handler) -> HandlerId {
        self.bind(event, handler, true)
    }

    fn bind(&self, event: &str, handler: Handler, once: bool) -> HandlerId {
        let mut registry = self.inner.registry.lock();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);

        if self.is_closed() {
            tracing::warn!(event, "Subscribe on closed connection ignored");
            return id;
        }

        registry
            .bindings
            .entry(event.to_string())
            .or_default()
            .push(Binding { id, once, handler });
        id
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, event: &str, id: HandlerId) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(bindings) = registry.bindings.get_mut(event) else {
            return false;
        };
        let before = bindings.len();
        bindings.retain(|binding| binding.id != id);
        let removed = bindings.len() != before;
        if bindings.is_empty() {
            registry.bindings.remove(event);
        }
        removed
    }

    /// Number of live handlers for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .registry
            .lock()
            .bindings
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Queue a named request for the server.
    ///
    /// Frames queued while disconnected are sent once the transport
    /// reconnects.
    pub fn emit(&self, event: &str, payload: Value) {
        if self.is_closed() {
            tracing::warn!(event, "Emit on closed connection dropped");
            return;
        }
        let frame = OutboundFrame {
            event: event.to_string(),
            payload,
        };
        if self.inner.outbound_tx.send(frame).is_err() {
            tracing::warn!(event, "Transport gone, emit dropped");
        }
    }

    /// Deliver an event to every handler bound to it.
    ///
    /// Handlers run after the registry lock is released, so they may
    /// subscribe or unsubscribe freely.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = {
            let mut registry = self.inner.registry.lock();
            let Some(bindings) = registry.bindings.get_mut(event) else {
                tracing::trace!(event, "No handlers for event");
                return;
            };
            let handlers = bindings.iter().map(|b| b.handler.clone()).collect();
            bindings.retain(|binding| !binding.once);
            if bindings.is_empty() {
                registry.bindings.remove(event);
            }
            handlers
        };

        tracing::trace!(event, handlers = handlers.len(), "Dispatching event");
        for handler in handlers {
            handler(payload);
        }
    }

    /// A connection attempt is starting.
    pub fn mark_connecting(&self) {
        if self.is_closed() {
            return;
        }
        let state = {
            let mut registry = self.inner.registry.lock();
            if registry.ever_connected {
                registry.reconnect_attempts += 1;
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            }
        };
        self.inner.state_tx.send_replace(state);
    }

    pub fn mark_connected(&self) {
        if self.is_closed() {
            return;
        }
        let (is_reconnect, attempts) = {
            let mut registry = self.inner.registry.lock();
            let is_reconnect = registry.ever_connected;
            let attempts = registry.reconnect_attempts;
            registry.ever_connected = true;
            registry.reconnect_attempts = 0;
            registry.epoch += 1;
            (is_reconnect, attempts)
        };

        self.inner.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!(reconnect = is_reconnect, "Realtime connection established");

        self.dispatch(events::CONNECT, &Value::Null);
        if is_reconnect {
            self.dispatch(events::RECONNECT, &Value::from(attempts));
        }
    }

    pub fn mark_disconnected(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        tracing::warn!(reason, "Realtime connection lost");
        self.dispatch(events::DISCONNECT, &Value::from(reason));
    }

    pub fn mark_connect_error(&self, error: &str) {
        if self.is_closed() {
            return;
        }
        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        tracing::warn!(error, "Realtime connection attempt failed");
        self.dispatch(events::CONNECT_ERROR, &Value::from(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move |_: &Value| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn new_connection_is_connecting() {
        let (conn, _rx) = Connection::new();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_connected());
        assert!(!conn.is_closed());
    }

    #[test]
    fn dispatch_reaches_all_subscribers() {
        let (conn, _rx) = Connection::new();
        let (a, ha) = counter();
        let (b, hb) = counter();
        conn.subscribe("jobs_list", ha);
        conn.subscribe("jobs_list", hb);

        conn.dispatch("jobs_list", &json!({}));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let (conn, _rx) = Connection::new();
        let (a, ha) = counter();
        let (b, hb) = counter();
        let id_a = conn.subscribe("stats_list", ha);
        conn.subscribe("stats_list", hb);

        assert!(conn.unsubscribe("stats_list", id_a));
        assert!(!conn.unsubscribe("stats_list", id_a));
        conn.dispatch("stats_list", &Value::Null);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(conn.handler_count("stats_list"), 1);
    }

    #[test]
    fn once_handler_fires_a_single_time() {
        let (conn, _rx) = Connection::new();
        let (count, handler) = counter();
        conn.once(events::CONNECT, handler);

        conn.mark_connected();
        conn.mark_disconnected("transport close");
        conn.mark_connected();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(conn.handler_count(events::CONNECT), 0);
    }

    #[test]
    fn reconnect_only_after_first_connect() {
        let (conn, _rx) = Connection::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        conn.subscribe(
            events::RECONNECT,
            Arc::new(move |payload: &Value| seen.lock().push(payload.as_u64())),
        );

        conn.mark_connecting();
        conn.mark_connected();
        assert!(attempts.lock().is_empty());

        conn.mark_disconnected("ping timeout");
        conn.mark_connecting();
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        conn.mark_connect_error("refused");
        conn.mark_connecting();
        conn.mark_connected();
        assert_eq!(*attempts.lock(), vec![Some(2)]);
    }

    #[test]
    fn epoch_counts_connects_and_is_visible_to_connect_handlers() {
        let (conn, _rx) = Connection::new();
        assert_eq!(conn.epoch(), 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_connect = seen.clone();
        let inner_conn = conn.clone();
        conn.subscribe(
            events::CONNECT,
            Arc::new(move |_: &Value| seen_connect.lock().push(inner_conn.epoch())),
        );

        conn.mark_connected();
        conn.mark_disconnected("transport close");
        conn.mark_connect_error("refused");
        conn.mark_connecting();
        conn.mark_connected();

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(conn.epoch(), 2);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let (conn, _rx) = Connection::new();
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let inner_conn = conn.clone();
        let inner_slot = slot.clone();
        let id = conn.subscribe(
            "joined",
            Arc::new(move |_: &Value| {
                if let Some(id) = *inner_slot.lock() {
                    inner_conn.unsubscribe("joined", id);
                }
            }),
        );
        *slot.lock() = Some(id);

        conn.dispatch("joined", &Value::Null);
        assert_eq!(conn.handler_count("joined"), 0);
    }

    #[test]
    fn emit_queues_outbound_frame() {
        let (conn, mut rx) = Connection::new();
        conn.emit("get_jobs", json!({"user": "alice"}));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, "get_jobs");
        assert_eq!(frame.payload["user"], "alice");
    }

    #[test]
    fn closed_connection_ignores_everything() {
        let (conn, mut rx) = Connection::new();
        let (count, handler) = counter();
        conn.subscribe("jobs_list", handler.clone());
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.handler_count("jobs_list"), 0);

        conn.subscribe("jobs_list", handler);
        conn.emit("get_jobs", Value::Null);
        conn.mark_connected();
        conn.dispatch("jobs_list", &Value::Null);

        assert!(rx.try_recv().is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!conn.is_connected());
    }

    #[test]
    fn state_watch_sees_transitions() {
        let (conn, _rx) = Connection::new();
        let state_rx = conn.subscribe_state();
        conn.mark_connected();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        conn.mark_disconnected("io error");
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }
}
