//! Connection multiplexer shared by the WebSocket and IPC transports.
//!
//! Many concurrent operations share one logical, self-healing connection.
//! All bookkeeping (pending table, outgoing queue, connection slots) lives
//! behind a single lock so that every state change is made in one step;
//! observer callbacks are only invoked after the lock is released.

use crate::backoff::{ExponentialBackoff, RetryDelay};
use crate::transport::{Connector, MessageChannel};
use futures::{SinkExt, StreamExt};
use indexmap::{IndexMap, IndexSet};
use linkrpc_core::wire::PING;
use linkrpc_core::{
    ClientError, ConnectionParamsMessage, Envelope, ErrorShape, IncomingMessage, Observable,
    Observer, OpId, Operation, OperationKind, OperationResult, OutgoingFrame, RequestMessage,
    ResultKind, Teardown, TransportError,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Close the socket after a period without pending requests, and only
/// open it when the first operation arrives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LazyConfig {
    pub enabled: bool,
    pub close_ms: u64,
}

impl Default for LazyConfig {
    fn default() -> Self {
        LazyConfig {
            enabled: false,
            close_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            enabled: false,
            interval_ms: 5_000,
            pong_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Delay of the outgoing micro-batch timer. Zero flushes on the next
    /// scheduler tick.
    pub flush_interval_ms: u64,
    pub lazy: LazyConfig,
    pub keep_alive: KeepAliveConfig,
    /// Sent as the first frame on every new connection.
    pub connection_params: Option<Value>,
    #[serde(skip, default = "default_retry")]
    pub retry: Arc<dyn RetryDelay>,
}

fn default_retry() -> Arc<dyn RetryDelay> {
    Arc::new(ExponentialBackoff::default())
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            flush_interval_ms: 0,
            lazy: LazyConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            connection_params: None,
            retry: default_retry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none scheduled.
    Idle,
    Connecting,
    Open,
    Closed,
}

type ConnId = u64;

enum Outbound {
    Frame(String),
    Close,
}

struct ConnectionSlot {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl ConnectionSlot {
    fn send(&self, outbound: Outbound) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(outbound).is_ok(),
            None => false,
        }
    }
}

struct PendingRequest {
    op: Operation,
    observer: Observer<Envelope, ClientError>,
    /// Connection the request was last sent on; `None` while queued.
    connection: Option<ConnId>,
    started: bool,
}

enum Emit {
    Next(Observer<Envelope, ClientError>, Envelope),
    Error(Observer<Envelope, ClientError>, ClientError),
    Complete(Observer<Envelope, ClientError>),
}

/// `data` of a `type: "error"` result.
fn error_result(data: Value) -> ClientError {
    match serde_json::from_value::<ErrorShape>(data) {
        Ok(shape) => ClientError::Server(shape),
        Err(e) => TransportError::Protocol(format!("malformed error result: {}", e)).into(),
    }
}

fn deliver(emits: Vec<Emit>) {
    for emit in emits {
        match emit {
            Emit::Next(o, env) => o.next(env),
            Emit::Error(o, err) => o.error(err),
            Emit::Complete(o) => o.complete(),
        }
    }
}

#[derive(Default)]
struct State {
    pending: IndexMap<OpId, PendingRequest>,
    outgoing: IndexSet<OpId>,
    connections: HashMap<ConnId, ConnectionSlot>,
    active: Option<ConnId>,
    next_conn_id: ConnId,
    flush_scheduled: bool,
    attempt: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    state: Mutex<State>,
}

struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Handle to one multiplexed connection manager. Clones share it; the
/// manager closes when the last handle is dropped.
#[derive(Clone)]
pub struct MuxClient {
    inner: Arc<Inner>,
    _guard: Arc<CloseOnDrop>,
}

impl fmt::Debug for MuxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxClient")
            .field("connector", &self.inner.connector)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl MuxClient {
    /// Must be called from within a tokio runtime. Unless lazy mode is on,
    /// the first connection is opened immediately.
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        let inner = Arc::new(Inner {
            connector,
            options,
            state: Mutex::new(State::default()),
        });
        if !inner.options.lazy.enabled {
            let mut st = inner.state.lock();
            inner.open_connection(&mut st);
        }
        MuxClient {
            _guard: Arc::new(CloseOnDrop(inner.clone())),
            inner,
        }
    }

    /// Run one operation over the shared connection.
    pub fn operation(&self, op: Operation) -> OperationResult {
        let inner = self.inner.clone();
        Observable::new(move |observer| {
            let id = op.id;
            inner.request(op.clone(), observer);
            let inner = inner.clone();
            Teardown::new(move || inner.unsubscribe(id))
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        let st = self.inner.state.lock();
        if st.closed {
            return ConnectionState::Closed;
        }
        match st.active.and_then(|id| st.connections.get(&id)) {
            Some(slot) => slot.state,
            None if st.reconnect_timer.is_some() => ConnectionState::Connecting,
            None => ConnectionState::Idle,
        }
    }

    /// Requests still awaiting a terminal result, queued ones included.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Requests queued but not yet written to a connection.
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().outgoing.len()
    }

    /// Close every connection. One-shot requests fail, subscriptions
    /// complete, and no reconnect is attempted afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Inner {
    fn request(self: &Arc<Self>, op: Operation, observer: Observer<Envelope, ClientError>) {
        let mut emits = Vec::new();
        {
            let mut st = self.state.lock();
            if st.closed {
                emits.push(Emit::Error(
                    observer,
                    ClientError::from(TransportError::ConnectionClosed),
                ));
            } else if op.kind == OperationKind::SubscriptionStop {
                emits.push(Emit::Error(
                    observer,
                    ClientError::usage("subscription.stop is sent by unsubscribing"),
                ));
            } else if st.pending.contains_key(&op.id) {
                warn!(op_id = %op.id, "duplicate operation id");
                emits.push(Emit::Error(
                    observer,
                    ClientError::usage(format!("operation id {} is already in flight", op.id)),
                ));
            } else {
                trace!(op_id = %op.id, kind = %op.kind, path = %op.path, "queueing request");
                let id = op.id;
                st.pending.insert(
                    id,
                    PendingRequest {
                        op,
                        observer,
                        connection: None,
                        started: false,
                    },
                );
                st.outgoing.insert(id);
                if let Some(timer) = st.idle_timer.take() {
                    timer.abort();
                }
                if st.active.is_none() && st.reconnect_timer.is_none() {
                    self.open_connection(&mut st);
                }
                self.schedule_flush(&mut st);
            }
        }
        deliver(emits);
    }

    fn unsubscribe(self: &Arc<Self>, id: OpId) {
        let mut st = self.state.lock();
        let Some(req) = st.pending.shift_remove(&id) else {
            return;
        };
        if st.outgoing.shift_remove(&id) {
            trace!(op_id = %id, "dropped queued request before sending");
        } else if req.op.kind == OperationKind::Subscription {
            if let Some(slot) = req.connection.and_then(|c| st.connections.get(&c)) {
                if slot.state == ConnectionState::Open {
                    match serde_json::to_string(&RequestMessage::stop(id)) {
                        Ok(text) => {
                            debug!(op_id = %id, "sending subscription stop");
                            slot.send(Outbound::Frame(text));
                        }
                        Err(e) => warn!(op_id = %id, "failed to encode stop: {}", e),
                    }
                }
            }
        }
        if let Some(conn) = req.connection {
            Self::close_if_drained(&mut st, conn);
        }
        self.schedule_idle_close(&mut st);
    }

    fn open_connection(self: &Arc<Self>, st: &mut State) {
        let conn_id = st.next_conn_id;
        st.next_conn_id += 1;
        st.connections.insert(
            conn_id,
            ConnectionSlot {
                state: ConnectionState::Connecting,
                outbound: None,
            },
        );
        st.active = Some(conn_id);
        debug!(conn_id, connector = ?self.connector, "opening connection");
        tokio::spawn(self.clone().run_connection(conn_id));
    }

    async fn run_connection(self: Arc<Self>, conn_id: ConnId) {
        let channel = match self.connector.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(conn_id, "connection failed: {}", e);
                self.on_closed(conn_id, Some(e));
                return;
            }
        };
        let MessageChannel {
            mut sink,
            mut stream,
        } = channel;

        if let Some(params) = &self.options.connection_params {
            let sent = match serde_json::to_string(&ConnectionParamsMessage::new(params.clone())) {
                Ok(text) => sink.send(text).await,
                Err(e) => Err(TransportError::from(e)),
            };
            if let Err(e) = sent {
                warn!(conn_id, "failed to send connection params: {}", e);
                self.on_closed(conn_id, Some(e));
                return;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.on_open(conn_id, tx) {
            let _ = sink.close().await;
            self.on_closed(conn_id, None);
            return;
        }

        let keep_alive = &self.options.keep_alive;
        let mut ping = tokio::time::interval(Duration::from_millis(keep_alive.interval_ms.max(1)));
        ping.reset();
        let mut pong_deadline: Option<Instant> = None;

        let reason = loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        trace!(conn_id, "sending frame: {}", text);
                        if let Err(e) = sink.send(text).await {
                            break Some(e);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!(conn_id, "closing connection");
                        let _ = sink.close().await;
                        break None;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(text)) => {
                        pong_deadline = None;
                        self.on_message(conn_id, &text);
                    }
                    Some(Err(e)) => break Some(e),
                    None => break Some(TransportError::ConnectionClosed),
                },
                _ = ping.tick(), if keep_alive.enabled && pong_deadline.is_none() => {
                    if let Err(e) = sink.send(PING.to_string()).await {
                        break Some(e);
                    }
                    let timeout = Duration::from_millis(keep_alive.pong_timeout_ms);
                    pong_deadline = Some(Instant::now() + timeout);
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                    if pong_deadline.is_some() =>
                {
                    warn!(conn_id, "no pong within {}ms", keep_alive.pong_timeout_ms);
                    let _ = sink.close().await;
                    break Some(TransportError::Protocol("keep-alive timed out".into()));
                }
            }
        };

        self.on_closed(conn_id, reason);
    }

    fn on_open(self: &Arc<Self>, conn_id: ConnId, tx: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut emits = Vec::new();
        let opened = {
            let mut st = self.state.lock();
            let is_active = st.active == Some(conn_id) && !st.closed;
            match st.connections.get_mut(&conn_id) {
                Some(slot) if is_active => {
                    slot.state = ConnectionState::Open;
                    slot.outbound = Some(tx);
                }
                _ => return false,
            }
            info!(conn_id, "connection open");

            // Replay subscriptions that were sent on an earlier connection,
            // ahead of anything queued since.
            let resumed: Vec<OpId> = st
                .pending
                .iter_mut()
                .filter(|(_, req)| {
                    req.op.kind == OperationKind::Subscription
                        && req.connection.is_some_and(|c| c != conn_id)
                })
                .map(|(id, req)| {
                    debug!(op_id = %id, previous = ?req.connection, "resuming subscription");
                    req.connection = None;
                    *id
                })
                .collect();
            if !resumed.is_empty() {
                let queued = std::mem::take(&mut st.outgoing);
                st.outgoing = resumed.into_iter().chain(queued).collect();
                let stale: Vec<ConnId> = st
                    .connections
                    .keys()
                    .copied()
                    .filter(|c| *c != conn_id)
                    .collect();
                for conn in stale {
                    Self::close_if_drained(&mut st, conn);
                }
            }
            self.flush_locked(&mut st, &mut emits);
            self.schedule_idle_close(&mut st);
            true
        };
        deliver(emits);
        opened
    }

    fn schedule_flush(self: &Arc<Self>, st: &mut State) {
        if st.flush_scheduled {
            return;
        }
        st.flush_scheduled = true;
        let inner = self.clone();
        let interval = self.options.flush_interval_ms;
        tokio::spawn(async move {
            if interval == 0 {
                tokio::task::yield_now().await;
            } else {
                sleep(Duration::from_millis(interval)).await;
            }
            let mut emits = Vec::new();
            {
                let mut st = inner.state.lock();
                st.flush_scheduled = false;
                inner.flush_locked(&mut st, &mut emits);
            }
            deliver(emits);
        });
    }

    /// Write everything queued to the active connection, if it is open.
    fn flush_locked(&self, st: &mut State, emits: &mut Vec<Emit>) {
        let Some(active) = st.active else {
            return;
        };
        let ready = st
            .connections
            .get(&active)
            .is_some_and(|slot| slot.state == ConnectionState::Open);
        if !ready || st.outgoing.is_empty() {
            return;
        }

        let ids: Vec<OpId> = st.outgoing.drain(..).collect();
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(req) = st.pending.get_mut(id) {
                req.connection = Some(active);
                messages.push(RequestMessage::from_operation(&req.op));
            }
        }
        let Some(frame) = OutgoingFrame::from_messages(messages) else {
            return;
        };
        match frame.to_text() {
            Ok(text) => {
                debug!(conn_id = active, count = frame.len(), "flushing requests");
                if let Some(slot) = st.connections.get(&active) {
                    slot.send(Outbound::Frame(text));
                }
            }
            Err(e) => {
                warn!("failed to encode outgoing frame: {}", e);
                for id in ids {
                    if let Some(req) = st.pending.shift_remove(&id) {
                        emits.push(Emit::Error(req.observer, ClientError::from(e.clone())));
                    }
                }
            }
        }
    }

    fn on_message(self: &Arc<Self>, conn_id: ConnId, text: &str) {
        let messages = match IncomingMessage::parse(text) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conn_id, "dropping undecodable message: {}", e);
                return;
            }
        };

        let mut emits = Vec::new();
        {
            let mut st = self.state.lock();
            // Only a peer that has spoken resets the backoff.
            if st.active == Some(conn_id) {
                st.attempt = 0;
            }
            for message in messages {
                match message {
                    IncomingMessage::Pong => {}
                    IncomingMessage::Other(method) => {
                        debug!(conn_id, method, "ignoring notification");
                    }
                    IncomingMessage::Reconnect => {
                        if st.active == Some(conn_id) && !st.closed {
                            info!(conn_id, "server requested reconnect");
                            self.open_connection(&mut st);
                            Self::close_if_drained(&mut st, conn_id);
                        }
                    }
                    IncomingMessage::Failure { id: None, error } => {
                        warn!(conn_id, code = error.code, "error without id: {}", error.message);
                    }
                    IncomingMessage::Failure {
                        id: Some(id),
                        error,
                    } => {
                        if Self::owned_by(&st, id, conn_id) {
                            if let Some(req) = st.pending.shift_remove(&id) {
                                emits.push(Emit::Error(req.observer, ClientError::Server(error)));
                            }
                        }
                    }
                    IncomingMessage::Response { id, result } => {
                        if !Self::owned_by(&st, id, conn_id) {
                            continue;
                        }
                        let Some(req) = st.pending.get_mut(&id) else {
                            continue;
                        };
                        match result.kind {
                            ResultKind::Started => {
                                if !req.started && req.op.kind == OperationKind::Subscription {
                                    req.started = true;
                                    emits.push(Emit::Next(req.observer.clone(), Envelope::Started));
                                }
                            }
                            ResultKind::Data | ResultKind::Response | ResultKind::Event => {
                                emits.push(Emit::Next(
                                    req.observer.clone(),
                                    Envelope::Data(result.data),
                                ));
                                if req.op.kind.is_one_shot() {
                                    if let Some(req) = st.pending.shift_remove(&id) {
                                        emits.push(Emit::Complete(req.observer));
                                    }
                                }
                            }
                            ResultKind::Stopped => {
                                if let Some(req) = st.pending.shift_remove(&id) {
                                    emits.push(Emit::Next(req.observer.clone(), Envelope::Stopped));
                                    emits.push(Emit::Complete(req.observer));
                                }
                            }
                            ResultKind::Error => {
                                if let Some(req) = st.pending.shift_remove(&id) {
                                    let error = error_result(result.data);
                                    debug!(conn_id, op_id = %id, code = error.code(), "failed");
                                    emits.push(Emit::Error(req.observer, error));
                                }
                            }
                        }
                    }
                }
            }
            Self::close_if_drained(&mut st, conn_id);
            self.schedule_idle_close(&mut st);
        }
        deliver(emits);
    }

    /// Unknown ids and replies from a connection that no longer owns the
    /// request are dropped.
    fn owned_by(st: &State, id: OpId, conn_id: ConnId) -> bool {
        match st.pending.get(&id) {
            None => {
                warn!(conn_id, op_id = %id, "message for unknown operation id");
                false
            }
            Some(req) if req.connection != Some(conn_id) => {
                debug!(conn_id, op_id = %id, "message from a superseded connection");
                false
            }
            Some(_) => true,
        }
    }

    fn on_closed(self: &Arc<Self>, conn_id: ConnId, reason: Option<TransportError>) {
        let mut emits = Vec::new();
        {
            let mut st = self.state.lock();
            st.connections.remove(&conn_id);
            let was_active = st.active == Some(conn_id);
            if was_active {
                st.active = None;
            }
            match &reason {
                Some(e) => info!(conn_id, was_active, "connection closed: {}", e),
                None => debug!(conn_id, was_active, "connection closed"),
            }

            let failed: Vec<OpId> = st
                .pending
                .iter()
                .filter(|(_, req)| req.connection == Some(conn_id) && req.op.kind.is_one_shot())
                .map(|(id, _)| *id)
                .collect();
            for id in failed {
                if let Some(req) = st.pending.shift_remove(&id) {
                    emits.push(Emit::Error(
                        req.observer,
                        ClientError::from(TransportError::ClosedPrematurely),
                    ));
                }
            }

            if was_active && !st.closed {
                let needed = !st.pending.is_empty() || !self.options.lazy.enabled;
                if needed {
                    self.schedule_reconnect(&mut st, reason, &mut emits);
                }
            }
        }
        deliver(emits);
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        st: &mut State,
        reason: Option<TransportError>,
        emits: &mut Vec<Emit>,
    ) {
        if let Some(max) = self.options.retry.max_attempts() {
            if st.attempt >= max {
                warn!(attempts = st.attempt, "giving up reconnecting");
                let error = ClientError::from(reason.unwrap_or(TransportError::ConnectionClosed));
                st.outgoing.clear();
                for (_, req) in st.pending.drain(..) {
                    emits.push(Emit::Error(req.observer, error.clone()));
                }
                return;
            }
        }

        let delay = self.options.retry.delay(st.attempt);
        st.attempt += 1;
        debug!(attempt = st.attempt, ?delay, "scheduling reconnect");
        let inner = self.clone();
        st.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let mut st = inner.state.lock();
            st.reconnect_timer = None;
            if st.closed || st.active.is_some() {
                return;
            }
            if st.pending.is_empty() && inner.options.lazy.enabled {
                return;
            }
            inner.open_connection(&mut st);
        }));
    }

    /// A superseded connection is closed once no request references it.
    fn close_if_drained(st: &mut State, conn_id: ConnId) {
        if st.active == Some(conn_id) {
            return;
        }
        if st.pending.values().any(|req| req.connection == Some(conn_id)) {
            return;
        }
        if let Some(slot) = st.connections.get_mut(&conn_id) {
            if slot.state != ConnectionState::Closed {
                debug!(conn_id, "superseded connection drained");
                slot.state = ConnectionState::Closed;
                slot.send(Outbound::Close);
            }
        }
    }

    fn schedule_idle_close(self: &Arc<Self>, st: &mut State) {
        let lazy = &self.options.lazy;
        if !lazy.enabled || !st.pending.is_empty() || st.idle_timer.is_some() || st.closed {
            return;
        }
        let Some(active) = st.active else {
            return;
        };
        let inner = self.clone();
        let close_ms = lazy.close_ms;
        st.idle_timer = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(close_ms)).await;
            let mut st = inner.state.lock();
            st.idle_timer = None;
            if st.active != Some(active) || !st.pending.is_empty() {
                return;
            }
            debug!(conn_id = active, "closing idle connection");
            st.active = None;
            if let Some(slot) = st.connections.get_mut(&active) {
                slot.state = ConnectionState::Closed;
                slot.send(Outbound::Close);
            }
        }));
    }

    fn close(&self) {
        let mut emits = Vec::new();
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.active = None;
            for timer in [st.reconnect_timer.take(), st.idle_timer.take()]
                .into_iter()
                .flatten()
            {
                timer.abort();
            }
            st.outgoing.clear();
            for (_, req) in st.pending.drain(..) {
                if req.op.kind.is_one_shot() {
                    emits.push(Emit::Error(
                        req.observer,
                        ClientError::from(TransportError::ConnectionClosed),
                    ));
                } else {
                    emits.push(Emit::Complete(req.observer));
                }
            }
            for slot in st.connections.values_mut() {
                slot.state = ConnectionState::Closed;
                slot.send(Outbound::Close);
            }
            info!("multiplexer closed");
        }
        deliver(emits);
    }
}
