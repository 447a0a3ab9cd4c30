//! Agent-side stream registry: request ids currently being served against
//! the local origin, each holding the feed into its request body and the
//! abort handle of its pump task.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use uuid::Uuid;

const BODY_CHANNEL_CAPACITY: usize = 16;

/// Inbound request-body event fed to the origin request.
#[derive(Debug)]
pub enum RequestBodyEvent {
    Data(Bytes),
    End,
}

struct RequestState {
    body_tx: mpsc::Sender<RequestBodyEvent>,
    /// Absent between registration and the pump task being spawned.
    abort: Option<AbortHandle>,
}

#[derive(Clone, Default)]
pub struct Inflight {
    inner: Arc<Mutex<HashMap<Uuid, RequestState>>>,
}

impl Inflight {
    /// Create the body feed for a new request.  The state is registered
    /// with [`Inflight::register`] once the pump task exists; the channel
    /// reader handles frames strictly in order, so no body frame can
    /// arrive before registration completes.
    pub fn body_channel() -> (mpsc::Sender<RequestBodyEvent>, mpsc::Receiver<RequestBodyEvent>) {
        mpsc::channel(BODY_CHANNEL_CAPACITY)
    }

    /// Admit a request before its pump task exists, so a completion racing
    /// this registration can never resurrect a reaped entry.
    pub async fn register(&self, id: Uuid, body_tx: mpsc::Sender<RequestBodyEvent>) {
        self.inner.lock().await.insert(id, RequestState { body_tx, abort: None });
    }

    /// Attach the pump task's abort handle.  A no-op when the request
    /// already completed (the entry is gone and the task with it).
    pub async fn set_abort(&self, id: Uuid, abort: AbortHandle) {
        if let Some(state) = self.inner.lock().await.get_mut(&id) {
            state.abort = Some(abort);
        }
    }

    /// Feed a body event, suspending while the origin write side is slow
    /// (the backpressure path toward the edge).  Unknown or finished ids
    /// are dropped silently.
    pub async fn push_body(&self, id: Uuid, event: RequestBodyEvent) {
        let body_tx = {
            let table = self.inner.lock().await;
            match table.get(&id) {
                Some(state) => state.body_tx.clone(),
                None => return,
            }
        };
        let _ = body_tx.send(event).await;
    }

    /// Abort a request: the origin stream is torn down by cancelling its
    /// pump task.  Idempotent.
    pub async fn abort(&self, id: Uuid) -> bool {
        match self.inner.lock().await.remove(&id) {
            Some(state) => {
                if let Some(abort) = state.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Release a request that ran to completion (or failed and reported).
    pub async fn complete(&self, id: Uuid) {
        self.inner.lock().await.remove(&id);
    }

    /// Channel loss: every origin stream is cancelled and the table cleared.
    pub async fn abort_all(&self) {
        let mut table = self.inner.lock().await;
        for (_, state) in table.drain() {
            if let Some(abort) = state.abort {
                abort.abort();
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
