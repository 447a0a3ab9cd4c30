//! Edge-side stream registry: one table per control channel mapping live
//! request ids to the handles that route inbound response frames back to
//! the public-facing task.
//!
//! Each side of the tunnel owns its half of the per-request state; this
//! table only ever hands frames *toward* the public client.  A dropped
//! sender is deliberately distinguishable from a clean `End` so channel
//! loss can never masquerade as a complete response.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tunnel_protocol::{HeaderList, ResponseDescriptor, WireFamily};
use uuid::Uuid;

/// Bounded per-request body queue.  A slow public client fills this, which
/// suspends the channel reader, which backpressures the agent through the
/// control socket.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// One response-side event routed to the public-facing task.
#[derive(Debug)]
pub enum BodyEvent {
    Data(Bytes),
    Trailers(HeaderList),
    End,
    Error(String),
}

/// Receiving ends handed to the dispatcher when a request is admitted.
pub struct InflightHandles {
    /// Fulfilled by `response`, or by `response-error` arriving first.
    /// A dropped sender (channel loss before headers) surfaces as `RecvError`.
    pub response: oneshot::Receiver<Result<ResponseDescriptor, String>>,
    pub body: mpsc::Receiver<BodyEvent>,
}

struct RequestEntry {
    response_tx: Option<oneshot::Sender<Result<ResponseDescriptor, String>>>,
    body_tx: mpsc::Sender<BodyEvent>,
    /// Which wire family this request speaks; an abort emitted on the
    /// public side's behalf must use the same family.
    family: WireFamily,
}

/// Outcome of routing one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The public side stopped listening; the caller must abort the
    /// request toward the agent (in the carried wire family) and the entry
    /// has been reaped.
    Gone(WireFamily),
    /// No such id (already reaped, or a peer protocol error).
    Unknown,
}

#[derive(Clone, Default)]
pub struct Inflight {
    inner: Arc<Mutex<HashMap<Uuid, RequestEntry>>>,
}

impl Inflight {
    /// Admit a request id and return the dispatcher's receiving handles.
    pub async fn insert(&self, id: Uuid, family: WireFamily) -> InflightHandles {
        let (response_tx, response_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        self.inner
            .lock()
            .await
            .insert(id, RequestEntry { response_tx: Some(response_tx), body_tx, family });
        InflightHandles { response: response_rx, body: body_rx }
    }

    /// Route a `response` or pre-response `response-error` frame.
    /// An error arriving after the response head is forwarded into the body
    /// stream instead, aborting it.
    pub async fn on_response(&self, id: Uuid, result: Result<ResponseDescriptor, String>) -> RouteOutcome {
        let mut table = self.inner.lock().await;
        let Some(entry) = table.get_mut(&id) else {
            return RouteOutcome::Unknown;
        };
        match entry.response_tx.take() {
            Some(tx) => {
                if tx.send(result).is_err() {
                    let family = entry.family;
                    table.remove(&id);
                    return RouteOutcome::Gone(family);
                }
                RouteOutcome::Delivered
            }
            None => {
                let message = match result {
                    Err(message) => message,
                    // A second `response` for the same id is a peer bug.
                    Ok(_) => "duplicate response".to_owned(),
                };
                let body_tx = entry.body_tx.clone();
                table.remove(&id);
                drop(table);
                let _ = body_tx.try_send(BodyEvent::Error(message));
                RouteOutcome::Delivered
            }
        }
    }

    /// Route a body-side frame.  Terminal events (`End`, `Error`) reap the
    /// entry after delivery.
    pub async fn on_body_event(&self, id: Uuid, event: BodyEvent) -> RouteOutcome {
        let terminal = matches!(event, BodyEvent::End | BodyEvent::Error(_));
        let (body_tx, family) = {
            let mut table = self.inner.lock().await;
            let Some(entry) = table.get(&id) else {
                return RouteOutcome::Unknown;
            };
            let handles = (entry.body_tx.clone(), entry.family);
            if terminal {
                table.remove(&id);
            }
            handles
        };
        // Send outside the lock: a full queue must suspend only this
        // channel's reader, not every table user.
        if body_tx.send(event).await.is_err() {
            if !terminal {
                self.remove(id).await;
            }
            return RouteOutcome::Gone(family);
        }
        RouteOutcome::Delivered
    }

    /// Reap an entry.  Removing an absent id is a no-op.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.inner.lock().await.remove(&id).is_some()
    }

    /// Fail every live entry with a synthetic error and clear the table
    /// (channel loss).  Waiters on the response head observe a dropped
    /// sender; body streams observe an abort.
    pub async fn fail_all(&self, message: &str) {
        let entries: Vec<RequestEntry> = {
            let mut table = self.inner.lock().await;
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.body_tx.try_send(BodyEvent::Error(message.to_owned()));
            // response_tx drops here; a pre-headers waiter sees RecvError.
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
