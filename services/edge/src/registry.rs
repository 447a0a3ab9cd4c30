//! Agent registry: maps public `(host, path)` to the one control channel
//! that serves it.
//!
//! At most one live registration per `(host, pathPrefix)` pair.  Resolution
//! is longest-non-empty-prefix with the empty prefix as the whole-host
//! fallback.  Registration and removal happen under one write lock, so a
//! concurrent `resolve` always sees either the old or the new world.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tunnel_protocol::{TunnelEvent, WireFamily};
use uuid::Uuid;

/// One outgoing frame queued to a channel's writer task, tagged with the
/// wire family it must be encoded as.
#[derive(Debug)]
pub struct OutboundFrame {
    pub event: TunnelEvent,
    pub family: WireFamily,
}

#[derive(Debug, thiserror::Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// A live agent control channel as seen by the dispatcher: the frame queue
/// into its writer task plus its per-request routing table.
#[derive(Clone)]
pub struct AgentChannel {
    channel_id: Uuid,
    caps_http2: bool,
    frames: mpsc::Sender<OutboundFrame>,
    inflight: crate::streams::Inflight,
}

impl AgentChannel {
    pub fn new(
        channel_id: Uuid,
        caps_http2: bool,
        frames: mpsc::Sender<OutboundFrame>,
        inflight: crate::streams::Inflight,
    ) -> Self {
        AgentChannel { channel_id, caps_http2, frames, inflight }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    /// Whether the agent advertised `supports-http2` at handshake.
    pub fn caps_http2(&self) -> bool {
        self.caps_http2
    }

    pub fn inflight(&self) -> &crate::streams::Inflight {
        &self.inflight
    }

    /// Queue a frame to the writer task.  Suspends while the queue is full
    /// (transport backpressure); errs once the channel is gone.
    pub async fn send(&self, event: TunnelEvent, family: WireFamily) -> Result<(), ChannelClosed> {
        self.frames
            .send(OutboundFrame { event, family })
            .await
            .map_err(|_| ChannelClosed)
    }
}

type RegistrationKey = (String, String);

#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<HashMap<RegistrationKey, AgentChannel>>>,
}

impl AgentRegistry {
    /// Insert a registration; refuses (returning `false`) when the
    /// `(host, pathPrefix)` pair is already live.
    pub async fn register(&self, host: &str, path_prefix: &str, channel: AgentChannel) -> bool {
        let key = (host.to_ascii_lowercase(), path_prefix.to_owned());
        let mut table = self.inner.write().await;
        if table.contains_key(&key) {
            return false;
        }
        table.insert(key, channel);
        true
    }

    /// Find the channel serving `(host, path)`: host must match, and the
    /// registered prefix must be empty (wildcard) or a prefix of `path`.
    /// The longest non-empty prefix wins; the wildcard has lowest priority.
    pub async fn resolve(&self, host: &str, path: &str) -> Option<AgentChannel> {
        let host = host.to_ascii_lowercase();
        let table = self.inner.read().await;
        table
            .iter()
            .filter(|((h, prefix), _)| {
                *h == host && (prefix.is_empty() || path.starts_with(prefix.as_str()))
            })
            .max_by_key(|((_, prefix), _)| prefix.len())
            .map(|(_, channel)| channel.clone())
    }

    /// Remove a registration, but only when it still belongs to
    /// `channel_id`; a slow teardown must not evict a successor that
    /// reused the key.  Removing an absent key is a no-op.
    pub async fn remove(&self, host: &str, path_prefix: &str, channel_id: Uuid) -> bool {
        let key = (host.to_ascii_lowercase(), path_prefix.to_owned());
        let mut table = self.inner.write().await;
        match table.get(&key) {
            Some(channel) if channel.channel_id == channel_id => {
                table.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Take every live registration (edge shutdown).
    pub async fn drain_all(&self) -> Vec<AgentChannel> {
        let mut table = self.inner.write().await;
        table.drain().map(|(_, channel)| channel).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
