//! Per-channel fan-out of job progress.
//!
//! A channel id ("room") is an opaque string picked by the client. Delivery
//! is best effort: no buffering for late subscribers, and publishing to an
//! empty channel is a no-op.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Normalized job state as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProgressEvent {
    Downloading {
        percent: String,
        speed: String,
        eta: String,
        #[serde(rename = "downloaded")]
        downloaded_bytes: Option<u64>,
        #[serde(rename = "total")]
        total_bytes: Option<u64>,
    },
    Finished,
    Ready {
        #[serde(rename = "url")]
        download_url: String,
        filename: String,
    },
    Error {
        message: String,
    },
}

type ConnectionId = u64;
type Members = HashMap<ConnectionId, mpsc::UnboundedSender<ProgressEvent>>;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Members>>,
}

/// Registry of channel memberships. Cheap to clone.
#[derive(Clone, Default)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection that can join any number of channels. Memberships
    /// end when the returned value is dropped.
    pub fn connect(&self) -> Subscriber {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        Subscriber {
            id,
            hub: self.clone(),
            tx,
            rx,
            joined: HashSet::new(),
        }
    }

    /// Deliver `event` to every current member of `channel_id`; returns how
    /// many received it. Never blocks on a slow or vanished subscriber.
    pub fn publish(&self, channel_id: &str, event: &ProgressEvent) -> usize {
        let channels = self.inner.channels.read();
        let Some(members) = channels.get(channel_id) else {
            return 0;
        };

        members
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn publisher(&self, channel_id: impl Into<String>) -> Publisher {
        Publisher {
            channel_id: channel_id.into(),
            hub: self.clone(),
        }
    }

    pub fn member_count(&self, channel_id: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(channel_id)
            .map_or(0, HashMap::len)
    }

    fn join(&self, channel_id: &str, id: ConnectionId, tx: mpsc::UnboundedSender<ProgressEvent>) {
        self.inner
            .channels
            .write()
            .entry(channel_id.to_string())
            .or_default()
            .insert(id, tx);
    }

    fn leave(&self, channel_id: &str, id: ConnectionId) {
        let mut channels = self.inner.channels.write();
        if let Some(members) = channels.get_mut(channel_id) {
            members.remove(&id);
            if members.is_empty() {
                channels.remove(channel_id);
            }
        }
    }
}

/// One client connection's view of the hub.
pub struct Subscriber {
    id: ConnectionId,
    hub: ProgressHub,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    joined: HashSet<String>,
}

impl Subscriber {
    /// Join `channel_id`. Joining the same channel twice is harmless.
    pub fn subscribe(&mut self, channel_id: &str) -> Result<()> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return Err(Error::invalid_input("missing progress_id"));
        }

        self.hub.join(channel_id, self.id, self.tx.clone());
        self.joined.insert(channel_id.to_string());
        Ok(())
    }

    /// Next event from any joined channel.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for channel_id in &self.joined {
            self.hub.leave(channel_id, self.id);
        }
    }
}

/// A job's handle for reporting into its own channel.
#[derive(Clone)]
pub struct Publisher {
    channel_id: String,
    hub: ProgressHub,
}

impl Publisher {
    pub fn publish(&self, event: ProgressEvent) {
        let delivered = self.hub.publish(&self.channel_id, &event);
        tracing::trace!(channel = %self.channel_id, delivered, "published {event:?}");
    }
}
