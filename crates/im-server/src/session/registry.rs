//! Session registry: session id → client connection handle.
//!
//! The registry is the only authoritative record of which sessions exist.
//! Entries are inserted once at admission and removed once at teardown;
//! whichever side (client read loop or bus dispatch) removes first wins and
//! the other finds nothing to do. Removal is keyed on the connection as well
//! as the id, so a stale teardown never evicts a newer session that reused
//! the id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use im_core::{FrameKind, ImError, ImResult};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Default depth of a session's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Commands drained by a session's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(FrameKind, Vec<u8>),
    Close,
}

/// Handle to one client connection.
///
/// Writes go through an ordered queue owned by the connection's writer task,
/// so every delivery for a session keeps the order it was dispatched in.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<Notify>,
}

impl ClientHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Queue a frame without waiting for room in the queue.
    ///
    /// Fails if the queue is full or the writer is gone.
    pub fn try_send(&self, kind: FrameKind, payload: Vec<u8>) -> ImResult<()> {
        self.tx
            .try_send(Outbound::Frame(kind, payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ImError::Transport("client queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ImError::Transport("client writer closed".into())
                }
            })
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    /// Ask the connection to close. Non-blocking and safe to call twice.
    pub fn close(&self) {
        // A full queue still closes: the writer exits once every handle is dropped.
        let _ = self.tx.try_send(Outbound::Close);
        self.closed.notify_one();
    }

    /// Resolves once `close` has been called on any clone of this handle.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

/// Concurrency-safe map of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, ClientHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns `false` if the id is already taken.
    pub fn put(&self, session_id: String, handle: ClientHandle) -> bool {
        match self.sessions.entry(session_id) {
            Entry::Occupied(e) => {
                debug!(session_id = %e.key(), "session id already registered");
                false
            }
            Entry::Vacant(e) => {
                e.insert(handle);
                true
            }
        }
    }

    /// Look up a session's connection handle.
    pub fn get(&self, session_id: &str) -> Option<ClientHandle> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Remove a session only if it is still registered to `handle`.
    ///
    /// Returns `false` when the entry is gone or belongs to a newer
    /// connection that reused the id.
    pub fn delete_if_owner(&self, session_id: &str, handle: &ClientHandle) -> bool {
        self.sessions
            .remove_if(session_id, |_, current| current.same_connection(handle))
            .is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every registered connection. Entries are removed by each
    /// session's own teardown.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ClientHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_if_owner() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = ClientHandle::new(4);

        assert!(registry.put("s1".into(), handle.clone()));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("s1").is_some());
        assert!(registry.contains("s1"));

        assert!(registry.delete_if_owner("s1", &handle));
        assert!(!registry.delete_if_owner("s1", &handle));
        assert_eq!(registry.count(), 0);
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn duplicate_id_refused() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = ClientHandle::new(4);
        let (second, _rx2) = ClientHandle::new(4);

        assert!(registry.put("s1".into(), first));
        assert!(!registry.put("s1".into(), second));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn handle_queues_in_order() {
        let (handle, mut rx) = ClientHandle::new(4);
        handle.try_send(FrameKind::Text, b"a".to_vec()).unwrap();
        handle.try_send(FrameKind::Binary, vec![1]).unwrap();
        handle.close();

        assert_eq!(rx.recv().await, Some(Outbound::Frame(FrameKind::Text, b"a".to_vec())));
        assert_eq!(rx.recv().await, Some(Outbound::Frame(FrameKind::Binary, vec![1])));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        handle.closed().await;
    }

    #[test]
    fn send_after_writer_gone_fails() {
        let (handle, rx) = ClientHandle::new(4);
        drop(rx);
        assert!(handle.try_send(FrameKind::Text, vec![]).is_err());
    }

    #[test]
    fn delete_if_owner_ignores_reused_id() {
        let registry = SessionRegistry::new();
        let (old, _rx_old) = ClientHandle::new(4);
        let (new, _rx_new) = ClientHandle::new(4);

        assert!(registry.put("s1".into(), old.clone()));
        assert!(registry.delete_if_owner("s1", &old));
        assert!(!registry.delete_if_owner("s1", &old));

        assert!(registry.put("s1".into(), new.clone()));
        assert!(!registry.delete_if_owner("s1", &old));
        assert!(registry.get("s1").is_some_and(|h| h.same_connection(&new)));
        assert!(registry.delete_if_owner("s1", &new));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn try_send_reports_full_queue() {
        let (handle, mut rx) = ClientHandle::new(1);
        handle.try_send(FrameKind::Text, b"a".to_vec()).unwrap();
        assert!(handle.try_send(FrameKind::Text, b"b".to_vec()).is_err());

        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(FrameKind::Text, b"a".to_vec()));
        handle.try_send(FrameKind::Text, b"c".to_vec()).unwrap();
    }

    #[test]
    fn close_all_signals_every_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = ClientHandle::new(4);
        let (b, mut rx_b) = ClientHandle::new(4);
        registry.put("a".into(), a);
        registry.put("b".into(), b);

        assert_eq!(registry.close_all(), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Close);
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Close);
        // Teardown, not close_all, removes entries.
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn concurrent_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("s{i}");
                let (handle, _rx) = ClientHandle::new(1);
                assert!(registry.put(id.clone(), handle.clone()));
                tokio::task::yield_now().await;
                assert!(registry.delete_if_owner(&id, &handle));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(registry.count(), 0);
    }
}
