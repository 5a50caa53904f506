//! # sessions
//!
//! Vehicle-id → open-channel registry. Every telemetry frame rebinds its
//! vehicle id to the channel that delivered it, so a vehicle moving
//! between clients silently takes its id along. Closing a channel
//! removes every binding that points at it.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound frames queued per socket before the writer task drains them.
pub const CHANNEL_QUEUE_DEPTH: usize = 64;

/// Handle to one connected socket's outbound queue. Cheap to clone;
/// sending never blocks — a full or closed queue drops the frame.
#[derive(Clone)]
pub struct ChannelHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<String>,
}

impl ChannelHandle {
    pub fn new(conn_id: Uuid, tx: mpsc::Sender<String>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Serialize and enqueue one frame. Returns false when the frame was
    /// dropped (closed socket or saturated queue) — callers treat that as
    /// a no-op, never an error.
    pub fn send_json<T: Serialize>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(e) => {
                warn!("unserializable outbound frame: {e}");
                return false;
            }
        };
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.conn_id, "outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn = %self.conn_id, "send to closed channel ignored");
                false
            }
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: DashMap<String, ChannelHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a vehicle id to a channel, overriding any prior binding.
    pub fn bind(&self, id: &str, handle: ChannelHandle) {
        self.inner.insert(id.to_string(), handle);
    }

    pub fn lookup(&self, id: &str) -> Option<ChannelHandle> {
        self.inner.get(id).map(|h| h.clone())
    }

    /// Remove every binding pointing at the given connection.
    pub fn remove_conn(&self, conn_id: Uuid) {
        self.inner.retain(|_, h| h.conn_id != conn_id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ChannelHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        (ChannelHandle::new(Uuid::new_v4(), tx), rx)
    }

    #[tokio::test]
    async fn bind_overrides_prior_binding() {
        let reg = SessionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, mut rx2) = handle();
        reg.bind("veh", h1);
        reg.bind("veh", h2);

        assert!(reg.lookup("veh").unwrap().send_json(&"ping"));
        assert_eq!(rx2.recv().await.unwrap(), "\"ping\"");
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn remove_conn_drops_all_bindings_for_that_channel() {
        let reg = SessionRegistry::new();
        let (h, _rx) = handle();
        let (other, _rx2) = handle();
        reg.bind("veh-1", h.clone());
        reg.bind("veh-2", h.clone());
        reg.bind("veh-3", other.clone());

        reg.remove_conn(h.conn_id());
        assert!(reg.lookup("veh-1").is_none());
        assert!(reg.lookup("veh-2").is_none());
        assert!(reg.lookup("veh-3").is_some());
    }

    #[tokio::test]
    async fn send_to_closed_channel_is_a_noop() {
        let (h, rx) = handle();
        drop(rx);
        assert!(!h.send_json(&"anything"));
    }

    #[tokio::test]
    async fn send_drops_when_queue_saturated() {
        let (tx, _rx) = mpsc::channel(1);
        let h = ChannelHandle::new(Uuid::new_v4(), tx);
        assert!(h.send_json(&1));
        assert!(!h.send_json(&2));
    }
}
