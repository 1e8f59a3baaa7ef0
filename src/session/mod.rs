//! Page sessions over the shared realtime connection.
//!
//! A [`Session`] gives one logical page an isolated, leak-free view of the
//! shared [`Connection`]:
//!
//! - **Bindings**: at most one live handler per event name. Binding the same
//!   event again unsubscribes the previous handler first.
//! - **Deferred emits**: [`Session::emit_when_ready`] runs now if connected,
//!   otherwise exactly once on the next `connect`.
//! - **Polling**: interval timers whose ticks are skipped while the page is
//!   hidden or the connection is down. Repeated [`Session::poll`] calls
//!   stack timers; stopping the old one is the caller's job.
//! - **Reconnect refresh**: the [`Session::on_reconnect`] callback runs on
//!   every `reconnect` signal after [`Session::mark_started`] took effect.
//!   Marking a session started while disconnected takes effect on the next
//!   `connect`, and the `reconnect` paired with that same connect is
//!   ignored: the deferred bootstrap already fetched.
//!
//! [`Session::cleanup`] releases every binding, timer and queued emit. It is
//! idempotent and runs on drop.
//!
//! On a closed connection every operation logs and returns.

pub mod poll;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::{Connection, Handler, HandlerId};
use crate::error::{DashError, Result};
use crate::events;
use crate::visibility::Visibility;

pub use poll::{PollFn, PollHandle, PollOptions};

/// Callback run when the shared connection reports `reconnect`.
pub type ReconnectFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SessionState {
    bindings: HashMap<String, HandlerId>,
    polls: HashMap<PollHandle, JoinHandle<()>>,
    next_poll: u64,
    /// `connect` once-handlers queued by `emit_when_ready`.
    deferred: Vec<HandlerId>,
    reconnect_binding: Option<HandlerId>,
    on_reconnect: Option<ReconnectFn>,
    started: bool,
    /// Connection epoch at which the session started.
    started_epoch: u64,
}

struct SessionInner {
    name: String,
    conn: Connection,
    visibility: Visibility,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn start(&self) {
        let epoch = self.conn.epoch();
        let mut state = self.state.lock();
        state.started = true;
        state.started_epoch = epoch;
        drop(state);
        tracing::info!(session = %self.name, epoch, "Session started");
    }

    fn forget_deferred(&self, id: HandlerId) {
        self.state.lock().deferred.retain(|d| *d != id);
    }
}

/// Page-scoped facade over the shared connection.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session for the page `name`.
    ///
    /// Registers this session's own `reconnect` handler on the connection.
    pub fn new(name: impl Into<String>, conn: Connection, visibility: Visibility) -> Self {
        let inner = Arc::new(SessionInner {
            name: name.into(),
            conn,
            visibility,
            state: Mutex::new(SessionState::default()),
        });

        if inner.conn.is_closed() {
            tracing::warn!(session = %inner.name, "Session created on a closed connection");
        } else {
            let id = inner
                .conn
                .subscribe(events::RECONNECT, reconnect_handler(Arc::downgrade(&inner)));
            inner.state.lock().reconnect_binding = Some(id);
        }

        tracing::debug!(session = %inner.name, "Session created");
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn visibility(&self) -> &Visibility {
        &self.inner.visibility
    }

    fn unavailable(&self, op: &str) -> bool {
        if self.inner.conn.is_closed() {
            tracing::warn!(session = %self.inner.name, op, "Connection unavailable, ignoring");
            return true;
        }
        false
    }

    /// Bind `handler` to `event`, replacing this session's previous handler
    /// for that event.
    pub fn on<F>(&self, event: &str, handler: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.unavailable("on") {
            return self;
        }

        let conn = &self.inner.conn;
        let mut state = self.inner.state.lock();
        if let Some(previous) = state.bindings.remove(event) {
            conn.unsubscribe(event, previous);
            tracing::debug!(session = %self.inner.name, event, "Replacing event handler");
        }
        let id = conn.subscribe(event, Arc::new(handler));
        state.bindings.insert(event.to_string(), id);
        self
    }

    /// Remove this session's handler for `event`, if any.
    pub fn off(&self, event: &str) -> &Self {
        let removed = self.inner.state.lock().bindings.remove(event);
        if let Some(id) = removed {
            self.inner.conn.unsubscribe(event, id);
        }
        self
    }

    /// Run `emit` now if connected, otherwise once on the next `connect`.
    pub fn emit_when_ready<F>(&self, emit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.unavailable("emit_when_ready") {
            return;
        }
        let _ = self.defer_until_connected(emit);
    }

    /// Queue `f` for the next `connect` unless already connected, in which
    /// case it runs immediately and `None` is returned.
    ///
    /// The queued id leaves `deferred` once the handler has fired.
    fn defer_until_connected<F>(&self, f: F) -> Option<HandlerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let conn = &self.inner.conn;
        if conn.is_connected() {
            f();
            return None;
        }

        let slot = Arc::new(Mutex::new(Some(f)));
        let own_id: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let session = Arc::downgrade(&self.inner);
        let handler: Handler = {
            let slot = slot.clone();
            let own_id = own_id.clone();
            Arc::new(move |_: &Value| {
                let pending = slot.lock().take();
                if let Some(f) = pending {
                    f();
                }
                let id = *own_id.lock();
                if let (Some(inner), Some(id)) = (session.upgrade(), id) {
                    inner.forget_deferred(id);
                }
            })
        };

        let id = conn.once(events::CONNECT, handler.clone());
        // The connection may have come up between the check and the subscribe.
        if conn.is_connected() && conn.unsubscribe(events::CONNECT, id) {
            handler(&Value::Null);
            return None;
        }

        *own_id.lock() = Some(id);
        let mut state = self.inner.state.lock();
        state.deferred.push(id);
        // A transport-side connect may have fired the handler before its id
        // was recorded.
        if slot.lock().is_none() {
            state.deferred.retain(|d| *d != id);
            return None;
        }
        drop(state);

        tracing::debug!(session = %self.inner.name, "Deferring emit until connected");
        Some(id)
    }

    /// Send a named request through the shared connection.
    pub fn emit(&self, event: &str, payload: Value) {
        if self.unavailable("emit") {
            return;
        }
        self.inner.conn.emit(event, payload);
    }

    /// Start a repeating timer running `f` every `period`.
    ///
    /// With `immediate`, `f` also runs once through
    /// [`emit_when_ready`](Self::emit_when_ready) before the first tick. With
    /// `visible_only`, ticks landing while the page is hidden are skipped and
    /// never replayed. Ticks landing while the connection is down are
    /// skipped as well; the reconnect refresh covers the outage.
    ///
    /// Returns `None` when the connection is closed and no timer started.
    pub fn poll<F>(&self, period: Duration, f: F, options: PollOptions) -> Option<PollHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.unavailable("poll") {
            return None;
        }

        let handle = {
            let mut state = self.inner.state.lock();
            state.next_poll += 1;
            PollHandle(state.next_poll)
        };

        let callback: PollFn = Arc::new(f);
        if options.immediate {
            let first = callback.clone();
            self.emit_when_ready(move || first());
        }

        let timer = poll::spawn_timer(
            self.inner.name.clone(),
            period,
            callback,
            options.visible_only,
            self.inner.visibility.clone(),
            self.inner.conn.clone(),
        );
        self.inner.state.lock().polls.insert(handle, timer);

        tracing::debug!(
            session = %self.inner.name,
            period_ms = period.as_millis() as u64,
            immediate = options.immediate,
            visible_only = options.visible_only,
            "Polling started"
        );
        Some(handle)
    }

    /// Cancel one timer. Returns false if the handle is not active.
    pub fn stop_poll(&self, handle: PollHandle) -> bool {
        let timer = self.inner.state.lock().polls.remove(&handle);
        match timer {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Set the callback run on `reconnect` once the session has started.
    pub fn on_reconnect<F>(&self, f: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.lock().on_reconnect = Some(Arc::new(f));
        self
    }

    /// Mark initial setup complete; reconnect refreshes are enabled from now.
    ///
    /// While disconnected the mark is queued like a deferred emit, so it
    /// lands on the same `connect` that flushes the initial load. The
    /// `reconnect` dispatched right after that connect is then ignored.
    pub fn mark_started(&self) {
        if self.unavailable("mark_started") {
            return;
        }
        let session = Arc::downgrade(&self.inner);
        let deferred = self.defer_until_connected(move || {
            if let Some(inner) = session.upgrade() {
                inner.start();
            }
        });
        if deferred.is_some() {
            tracing::debug!(session = %self.inner.name, "Start deferred until connected");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Number of timers not yet stopped.
    pub fn active_polls(&self) -> usize {
        self.inner.state.lock().polls.len()
    }

    /// Number of `emit_when_ready` callbacks still waiting for `connect`.
    pub fn pending_emits(&self) -> usize {
        self.inner.state.lock().deferred.len()
    }

    /// Number of event bindings made through [`on`](Self::on).
    pub fn binding_count(&self) -> usize {
        self.inner.state.lock().bindings.len()
    }

    /// Emit `event` and wait for the next `response_event`.
    ///
    /// Resolves exactly once: with the response payload, with
    /// [`DashError::Timeout`] after `wait`, or with
    /// [`DashError::ConnectionUnavailable`] if the connection closes first.
    /// A `success: false` payload is returned as-is; see
    /// [`events::check_response`].
    pub async fn request(
        &self,
        event: &str,
        payload: Value,
        response_event: &str,
        wait: Duration,
    ) -> Result<Value> {
        if self.unavailable("request") {
            return Err(DashError::ConnectionUnavailable);
        }

        let conn = self.inner.conn.clone();
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let response_id = conn.once(
            response_event,
            Arc::new(move |payload: &Value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(payload.clone());
                }
            }),
        );

        let emit_conn = conn.clone();
        let event_name = event.to_string();
        let deferred = self.defer_until_connected(move || emit_conn.emit(&event_name, payload));

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DashError::ConnectionUnavailable),
            Err(_) => {
                conn.unsubscribe(response_event, response_id);
                if let Some(id) = deferred {
                    conn.unsubscribe(events::CONNECT, id);
                    self.inner.forget_deferred(id);
                }
                tracing::warn!(
                    session = %self.inner.name,
                    event,
                    response_event,
                    "Request timed out"
                );
                Err(DashError::Timeout(response_event.to_string()))
            }
        }
    }

    /// Release every binding, timer and queued emit of this session.
    ///
    /// Safe to call repeatedly; later calls find nothing to release.
    pub fn cleanup(&self) {
        let (bindings, polls, deferred, reconnect) = {
            let mut state = self.inner.state.lock();
            state.on_reconnect = None;
            (
                std::mem::take(&mut state.bindings),
                std::mem::take(&mut state.polls),
                std::mem::take(&mut state.deferred),
                state.reconnect_binding.take(),
            )
        };

        let conn = &self.inner.conn;
        for (event, id) in &bindings {
            conn.unsubscribe(event, *id);
        }
        for id in &deferred {
            conn.unsubscribe(events::CONNECT, *id);
        }
        if let Some(id) = reconnect {
            conn.unsubscribe(events::RECONNECT, id);
        }
        for timer in polls.values() {
            timer.abort();
        }

        if bindings.is_empty() && polls.is_empty() && deferred.is_empty() && reconnect.is_none() {
            tracing::trace!(session = %self.inner.name, "Cleanup found nothing to release");
        } else {
            tracing::info!(
                session = %self.inner.name,
                bindings = bindings.len(),
                polls = polls.len(),
                "Session cleaned up"
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn reconnect_handler(session: Weak<SessionInner>) -> Handler {
    Arc::new(move |_: &Value| {
        let Some(inner) = session.upgrade() else {
            return;
        };
        let epoch = inner.conn.epoch();
        let callback = {
            let state = inner.state.lock();
            if !state.started {
                tracing::debug!(session = %inner.name, "Reconnect before start, not refreshing");
                return;
            }
            if state.started_epoch >= epoch {
                tracing::debug!(session = %inner.name, epoch, "Started on this connect, not refreshing");
                return;
            }
            state.on_reconnect.clone()
        };
        if let Some(callback) = callback {
            tracing::info!(session = %inner.name, "Refreshing after reconnect");
            callback();
        }
    })
}
