//! Background execution contexts.
//!
//! A context is reachable only through a [`WorkerLink`]: an outbox of JSON
//! requests and an inbox of [`WorkerEvent`]s. Nothing else is shared with the
//! caller. [`spawn_local`] hosts a [`Handler`] on its own tokio task.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::Protocol;
use super::wire::{ReplyEnvelope, RequestEnvelope};
use crate::Error;

/// Something the background context reports to its owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A serialized reply envelope.
    Message(Value),
    /// The context crashed or exited; no further replies will come.
    Fatal(String),
}

/// The caller's side of a background context.
#[derive(Debug)]
pub struct WorkerLink {
    pub(crate) outbox: mpsc::UnboundedSender<Value>,
    pub(crate) events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub(crate) abort: Option<AbortHandle>,
}

impl WorkerLink {
    /// Assemble a link from raw channel halves.
    ///
    /// `abort` terminates the context when the link's owner tears it down.
    pub fn from_parts(
        outbox: mpsc::UnboundedSender<Value>, events: mpsc::UnboundedReceiver<WorkerEvent>,
        abort: Option<AbortHandle>,
    ) -> Self {
        Self { outbox, events, abort }
    }
}

/// Request handler running inside a background context.
///
/// Requests are handled one at a time, in arrival order.
#[async_trait]
pub trait Handler: Send + 'static {
    type Protocol: Protocol;

    async fn handle(
        &mut self, request: <Self::Protocol as Protocol>::Request,
    ) -> Result<<Self::Protocol as Protocol>::Response, Error>;
}

/// Decode one raw request, run it, and build the reply.
///
/// Returns `None` only when the message carries no usable correlation id.
pub(crate) async fn respond<H: Handler>(handler: &mut H, message: Value) -> Option<ReplyEnvelope> {
    let envelope: RequestEnvelope = match serde_json::from_value(message) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed request");
            return None;
        }
    };
    let id = envelope.id;

    let request = match envelope.decode::<<H::Protocol as Protocol>::Request>() {
        Ok(request) => request,
        Err(e) => return Some(ReplyEnvelope::failure(id, e.to_string())),
    };

    let reply = match handler.handle(request).await {
        Ok(response) => {
            ReplyEnvelope::success(id, &response).unwrap_or_else(|e| ReplyEnvelope::failure(id, e.to_string()))
        }
        Err(e) => ReplyEnvelope::failure(id, e.to_string()),
    };
    Some(reply)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "background context panicked".to_string()
    }
}

/// Host `handler` on a dedicated tokio task.
///
/// A panic inside the handler is reported as [`WorkerEvent::Fatal`].
pub fn spawn_local<H: Handler>(mut handler: H) -> WorkerLink {
    let (outbox, mut inbox) = mpsc::unbounded_channel::<Value>();
    let (events_tx, events) = mpsc::unbounded_channel();
    let replies = events_tx.clone();

    let worker = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if let Some(reply) = respond(&mut handler, message).await {
                let Ok(value) = serde_json::to_value(&reply) else { continue };
                if replies.send(WorkerEvent::Message(value)).is_err() {
                    break;
                }
            }
        }
    });
    let abort = worker.abort_handle();

    tokio::spawn(async move {
        match worker.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                tracing::error!(%reason, "background context crashed");
                let _ = events_tx.send(WorkerEvent::Fatal(reason));
            }
            Err(_) => tracing::debug!("background context terminated"),
        }
    });

    WorkerLink::from_parts(outbox, events, Some(abort))
}
