//! Bus connection holder.
//!
//! Owns the one upstream sink. Every send goes through a single async mutex,
//! so at most one write is in flight. With no connection, envelopes are
//! dropped: there is no buffering or retry on the bus path.

use futures_util::{Sink, SinkExt};
use im_core::{Envelope, ImError, ImResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Write half of an upstream bus connection.
pub type BusSink = Pin<Box<dyn Sink<Envelope, Error = ImError> + Send>>;

struct BusLink {
    generation: u64,
    sink: BusSink,
}

/// Holds the active upstream bus connection, if any.
pub struct BusHolder {
    link: Mutex<Option<BusLink>>,
    next_generation: AtomicU64,
    /// Mirrors `link.is_some()`; updated while `link` is locked.
    connected: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Default for BusHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHolder {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            connected: watch::channel(false).0,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Whether an upstream connection is currently established.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Install a newly accepted upstream connection, retiring any previous one.
    ///
    /// Returns the connection's generation, which must be passed back to
    /// [`on_closed`](Self::on_closed) when its stream ends.
    pub async fn accept(&self, sink: BusSink) -> ImResult<u64> {
        let mut link = self.link.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ImError::Bus("gateway is shutting down".into()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = link.replace(BusLink { generation, sink }) {
            info!(
                retired = old.generation,
                generation, "replacing bus connection"
            );
            let mut old_sink = old.sink;
            tokio::spawn(async move {
                if let Err(e) = old_sink.close().await {
                    debug!(error = %e, "closing retired bus connection failed");
                }
            });
        }
        self.connected.send_replace(true);
        Ok(generation)
    }

    /// Clear the connection if `generation` is still the active one.
    pub async fn on_closed(&self, generation: u64) {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
            self.connected.send_replace(false);
            info!(generation, "bus connection cleared");
        } else {
            debug!(generation, "stale bus connection ended");
        }
    }

    /// Send one envelope upstream.
    ///
    /// Failures are logged here; callers usually ignore the result.
    pub async fn send(&self, envelope: Envelope) -> ImResult<()> {
        let mut link = self.link.lock().await;
        let Some(active) = link.as_mut() else {
            warn!(
                event = %envelope.event,
                session_id = %envelope.session_id,
                "bus not connected, dropping envelope"
            );
            return Err(ImError::Bus("not connected".into()));
        };

        let event = envelope.event;
        active.sink.send(envelope).await.map_err(|e| {
            warn!(event = %event, error = %e, "bus send failed");
            e
        })
    }

    /// Wait up to `timeout` for a connection. Returns `true` once connected.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let ready = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await;
        matches!(ready, Ok(Ok(_)))
    }

    /// Flush and close the active connection and refuse new ones.
    ///
    /// Takes the send lock, so any in-flight send completes first.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut link = self.link.lock().await;
        if let Some(mut active) = link.take() {
            if let Err(e) = active.sink.close().await {
                warn!(error = %e, "closing bus connection failed");
            }
            info!(generation = active.generation, "bus connection closed for shutdown");
        }
        self.connected.send_replace(false);
    }
}
