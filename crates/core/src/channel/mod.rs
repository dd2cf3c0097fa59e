//! Correlated request/response over a one-way message boundary.
//!
//! A [`MessageChannel`] talks to exactly one background context through a
//! [`WorkerLink`]. Every call gets a monotonically increasing correlation id
//! and its own deadline. Replies may arrive in any order; they are matched by
//! id, never by position.
//!
//! - A reply that arrives after its call timed out is logged and discarded.
//! - A fatal event from the context rejects every pending call at once.
//! - The channel never restarts a context on its own; after a fatal event the
//!   owner decides whether to build a new channel.

pub mod context;
pub mod process;
pub mod wire;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::Error;
pub use context::{Handler, WorkerEvent, WorkerLink, spawn_local};
pub use process::{serve, serve_stdio, spawn_process};
use wire::{ReplyEnvelope, ReplyOutcome, RequestEnvelope};

/// Message shapes spoken on one channel.
///
/// Both enums are serde adjacently tagged (`tag = "type"`, `content = "data"`).
pub trait Protocol: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static;
    type Response: Serialize + DeserializeOwned + Send + fmt::Debug + 'static;

    /// Handshake sent once while the channel becomes ready.
    fn init() -> Option<Self::Request> {
        None
    }

    /// Best-effort request sent before the context is terminated.
    fn cleanup() -> Option<Self::Request> {
        None
    }
}

struct PendingCall<T> {
    kind: String,
    reply: oneshot::Sender<Result<T, Error>>,
}

type PendingMap<T> = Arc<Mutex<HashMap<u64, PendingCall<T>>>>;

fn lock<T>(pending: &Mutex<T>) -> MutexGuard<'_, T> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject_all<T>(pending: &Mutex<HashMap<u64, PendingCall<T>>>, err: impl Fn() -> Error) -> usize {
    let drained: Vec<_> = lock(pending).drain().collect();
    let count = drained.len();
    for (_, call) in drained {
        let _ = call.reply.send(Err(err()));
    }
    count
}

/// Removes a call from the pending set when its future ends for any reason.
struct PendingGuard<'a, T> {
    pending: &'a Mutex<HashMap<u64, PendingCall<T>>>,
    id: u64,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// A live connection to a background context.
struct Connection {
    outbox: mpsc::UnboundedSender<Value>,
    context: Option<AbortHandle>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    fn terminate(&self) {
        self.dispatcher.abort();
        if let Some(context) = &self.context {
            context.abort();
        }
    }
}

async fn dispatch<P: Protocol>(mut events: mpsc::UnboundedReceiver<WorkerEvent>, pending: PendingMap<P::Response>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(raw) => {
                let reply: ReplyEnvelope = match serde_json::from_value(raw) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding reply without a correlation id");
                        continue;
                    }
                };
                let Some(call) = lock(&pending).remove(&reply.id) else {
                    tracing::warn!(id = reply.id, kind = %reply.kind, "discarding reply for unknown or expired call");
                    continue;
                };
                let result = match reply.outcome::<P::Response>() {
                    ReplyOutcome::Success(response) => Ok(response),
                    ReplyOutcome::Failure(message) => Err(Error::Worker(message)),
                    ReplyOutcome::Unrecognized(reason) => {
                        tracing::warn!(kind = %call.kind, %reason, "protocol error");
                        Err(Error::Protocol(reason))
                    }
                };
                let _ = call.reply.send(result);
            }
            WorkerEvent::Fatal(reason) => {
                let rejected = reject_all(&pending, || Error::WorkerFatal(reason.clone()));
                tracing::error!(%reason, rejected, "background context failed");
            }
        }
    }
    reject_all(&pending, || Error::WorkerFatal("background context disconnected".into()));
}

type Connect = Box<dyn Fn() -> Result<WorkerLink, Error> + Send + Sync>;

/// Correlated RPC client for one background context.
pub struct MessageChannel<P: Protocol> {
    connect: Connect,
    timeout: Duration,
    next_id: AtomicU64,
    pending: PendingMap<P::Response>,
    connection: OnceCell<Connection>,
    destroyed: AtomicBool,
}

impl<P: Protocol> fmt::Debug for MessageChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .field("connected", &self.connection.initialized())
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<P: Protocol> MessageChannel<P> {
    /// Create a channel that starts its context lazily with `connect`.
    pub fn new(connect: impl Fn() -> Result<WorkerLink, Error> + Send + Sync + 'static, timeout: Duration) -> Self {
        Self {
            connect: Box::new(connect),
            timeout,
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connection: OnceCell::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether the context has been started and the handshake completed.
    pub fn is_ready(&self) -> bool {
        self.connection.initialized() && !self.destroyed.load(Ordering::SeqCst)
    }

    /// Start the context and complete the handshake.
    ///
    /// Concurrent callers share one in-flight initialization.
    pub async fn ready(&self) -> Result<(), Error> {
        self.live_connection().await.map(|_| ())
    }

    async fn live_connection(&self) -> Result<&Connection, Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::WorkerDestroyed);
        }
        self.connection.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<Connection, Error> {
        let WorkerLink { outbox, events, abort } = (self.connect)()?;
        let dispatcher = tokio::spawn(dispatch::<P>(events, Arc::clone(&self.pending)));
        let connection = Connection { outbox, context: abort, dispatcher };

        if let Some(init) = P::init()
            && let Err(e) = self.send(&connection, init).await
        {
            tracing::error!(error = %e, "background context handshake failed");
            connection.terminate();
            return Err(e);
        }

        tracing::info!("background context ready");
        Ok(connection)
    }

    /// Issue one request and wait for its correlated reply.
    pub async fn call(&self, request: P::Request) -> Result<P::Response, Error> {
        let connection = self.live_connection().await?;
        self.send(connection, request).await
    }

    async fn send(&self, connection: &Connection, request: P::Request) -> Result<P::Response, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = RequestEnvelope::encode(id, &request)?;
        let message = serde_json::to_value(&envelope)?;
        let kind = envelope.kind;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, PendingCall { kind: kind.clone(), reply: tx });
        let _guard = PendingGuard { pending: &*self.pending, id };

        if connection.outbox.send(message).is_err() {
            return Err(Error::WorkerFatal("background context is not accepting messages".into()));
        }
        tracing::debug!(id, %kind, "request dispatched");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::WorkerDestroyed),
            Err(_) => {
                tracing::warn!(id, %kind, "call timed out");
                Err(Error::WorkerTimeout { id, kind, timeout_ms: self.timeout.as_millis() as u64 })
            }
        }
    }

    /// Tear the context down.
    ///
    /// Sends the protocol's cleanup request (failures are only logged),
    /// terminates the context, and rejects stragglers with `WORKER_DESTROYED`.
    /// Later calls fail with `WORKER_DESTROYED`.
    pub async fn destroy(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.connection.get()
            && let Some(cleanup) = P::cleanup()
            && let Err(e) = self.send(connection, cleanup).await
        {
            tracing::warn!(error = %e, "cleanup request failed during teardown");
        }

        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(connection) = self.connection.get() {
            connection.terminate();
        }
        let rejected = reject_all(&self.pending, || Error::WorkerDestroyed);
        tracing::info!(rejected, "background context destroyed");
    }
}

impl<P: Protocol> Drop for MessageChannel<P> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get() {
            connection.terminate();
        }
    }
}
