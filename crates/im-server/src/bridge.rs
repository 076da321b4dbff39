//! Forwarding engine between client sessions and the bus.
//!
//! Two directions per session:
//!
//! - **client → bus**: one loop per session ([`Bridge::run_session`]) wraps
//!   every client frame in a `data` envelope. When the loop exits the client
//!   is closed; if the session still owns its id it is deregistered and
//!   `session_close` goes upstream.
//! - **bus → client**: one loop per bus stream ([`Bridge::run_bus`]) routes
//!   envelopes by session id through the registry ([`Bridge::dispatch`]).
//!
//! The two loops share nothing but the [`SessionRegistry`] and the
//! [`BusHolder`].

use crate::bus::{BusHolder, BusSink};
use crate::session::{ClientHandle, SessionRegistry};
use futures_util::{Stream, StreamExt};
use im_core::{Envelope, EventType, FrameKind, ImError, ImResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Routes traffic between registered sessions and the upstream bus.
pub struct Bridge {
    sessions: Arc<SessionRegistry>,
    bus: Arc<BusHolder>,
    /// Session loops that have registered and not finished teardown.
    live: AtomicUsize,
}

impl Bridge {
    pub fn new(sessions: Arc<SessionRegistry>, bus: Arc<BusHolder>) -> Self {
        Self {
            sessions,
            bus,
            live: AtomicUsize::new(0),
        }
    }

    /// Number of session loops still running, including ones mid-teardown.
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn bus(&self) -> &BusHolder {
        &self.bus
    }

    // ── Client → Bus ──────────────────────────────────────────────────

    /// Drive one admitted session until either side closes it.
    ///
    /// `inbound` yields client frames and ends when the client disconnects.
    /// Fails only if the session id is already registered; in that case
    /// nothing was registered or sent.
    pub async fn run_session<S>(
        &self,
        session_id: String,
        headers: HashMap<String, String>,
        handle: ClientHandle,
        mut inbound: S,
    ) -> ImResult<()>
    where
        S: Stream<Item = ImResult<(FrameKind, Vec<u8>)>> + Unpin,
    {
        self.open_session(&session_id, headers, handle.clone()).await?;

        loop {
            tokio::select! {
                _ = handle.closed() => {
                    debug!(session_id = %session_id, "session closed by gateway");
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok((kind, payload))) => {
                        let _ = self.bus.send(Envelope::data(&session_id, kind, payload)).await;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "client connection closed abnormally");
                        break;
                    }
                    None => {
                        debug!(session_id = %session_id, "client disconnected");
                        break;
                    }
                },
            }
        }

        self.close_session(&session_id, &handle).await;
        Ok(())
    }

    /// Register a session and announce it upstream.
    ///
    /// Registration happens first so a reply to `session_open` always finds
    /// the session.
    async fn open_session(
        &self,
        session_id: &str,
        headers: HashMap<String, String>,
        handle: ClientHandle,
    ) -> ImResult<()> {
        if !self.sessions.put(session_id.to_string(), handle) {
            return Err(ImError::Other(format!(
                "session id already in use: {session_id}"
            )));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        info!(
            session_id = %session_id,
            device_id = %headers.get(im_core::envelope::headers::DEVICE_ID).map(String::as_str).unwrap_or(""),
            sessions = self.sessions.count(),
            "session opened"
        );
        let _ = self.bus.send(Envelope::session_open(session_id, headers)).await;
        Ok(())
    }

    /// Teardown run exactly once when a session loop exits.
    ///
    /// `session_close` goes upstream only if this connection still owned the
    /// id. After a bus-initiated close the id may already belong to a newer
    /// connection, which must be left alone.
    async fn close_session(&self, session_id: &str, handle: &ClientHandle) {
        handle.close();
        if self.sessions.delete_if_owner(session_id, handle) {
            let _ = self.bus.send(Envelope::session_close(session_id)).await;
            info!(session_id = %session_id, sessions = self.sessions.count(), "session closed");
        } else {
            debug!(session_id = %session_id, "session already removed");
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    // ── Bus → Client ──────────────────────────────────────────────────

    /// Install a bus connection and dispatch everything it delivers.
    ///
    /// Returns when the stream ends. A graceful close returns `Ok`; a read
    /// error is returned. Either way connectivity is cleared for this stream.
    pub async fn run_bus<S>(&self, sink: BusSink, mut stream: S) -> ImResult<()>
    where
        S: Stream<Item = ImResult<Envelope>> + Unpin,
    {
        let generation = self.bus.accept(sink).await?;
        info!(generation, "bus connection established");

        let result = loop {
            match stream.next().await {
                Some(Ok(envelope)) => self.dispatch(envelope).await,
                Some(Err(e)) => {
                    error!(generation, error = %e, "reading bus envelope failed");
                    break Err(e);
                }
                None => {
                    warn!(generation, "bus connection closed");
                    break Ok(());
                }
            }
        };

        self.bus.on_closed(generation).await;
        result
    }

    /// Route one envelope from the bus to its session.
    pub async fn dispatch(&self, envelope: Envelope) {
        if envelope.session_id.is_empty() {
            debug!(event = %envelope.event, "dropping bus envelope without session id");
            return;
        }

        let Some(client) = self.sessions.get(&envelope.session_id) else {
            warn!(
                session_id = %envelope.session_id,
                event = %envelope.event,
                "bus envelope for unknown session"
            );
            return;
        };

        match envelope.event {
            EventType::SessionClose => {
                client.close();
                if self.sessions.delete_if_owner(&envelope.session_id, &client) {
                    info!(session_id = %envelope.session_id, "session closed by bus");
                }
            }
            EventType::Data => {
                let Some(kind) = envelope.frame_kind() else {
                    warn!(
                        session_id = %envelope.session_id,
                        message_type = envelope.message_type,
                        "unsupported message type, dropping"
                    );
                    return;
                };
                // A full client queue drops the frame instead of stalling dispatch.
                if let Err(e) = client.try_send(kind, envelope.payload) {
                    warn!(session_id = %envelope.session_id, error = %e, "write to session failed, dropping");
                }
            }
            EventType::SessionOpen | EventType::Unknown => {
                debug!(
                    session_id = %envelope.session_id,
                    event = %envelope.event,
                    "ignoring bus envelope"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::holder::tests::{drain, memory_sink};
    use crate::session::Outbound;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        bridge: Arc<Bridge>,
        bus_rx: mpsc::Receiver<Envelope>,
    }

    /// Adapt a channel receiver into the stream shape the bridge reads.
    fn channel_stream<T>(mut rx: mpsc::UnboundedReceiver<T>) -> impl Stream<Item = T> + Unpin {
        stream::poll_fn(move |cx| rx.poll_recv(cx))
    }

    async fn harness() -> Harness {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(BusHolder::new()),
        ));
        let (sink, bus_rx) = memory_sink();
        bridge.bus.accept(sink).await.unwrap();
        Harness { bridge, bus_rx }
    }

    type ClientTx = mpsc::UnboundedSender<ImResult<(FrameKind, Vec<u8>)>>;

    /// Start a session; returns the client-frame sender, the writer queue
    /// and the session task.
    fn spawn_session(
        bridge: &Arc<Bridge>,
        id: &str,
        headers: HashMap<String, String>,
    ) -> (
        ClientTx,
        mpsc::Receiver<Outbound>,
        tokio::task::JoinHandle<ImResult<()>>,
    ) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (handle, out_rx) = ClientHandle::new(16);
        let bridge = bridge.clone();
        let id = id.to_string();
        let task = tokio::spawn(async move {
            bridge
                .run_session(id, headers, handle, channel_stream(client_rx))
                .await
        });
        (client_tx, out_rx, task)
    }

    async fn next_sent(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for bus envelope")
            .expect("bus sink closed")
    }

    async fn wait_registered(bridge: &Bridge, id: &str) {
        for _ in 0..200 {
            if bridge.sessions.contains(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {id} never registered");
    }

    #[tokio::test]
    async fn open_sends_headers_and_registers() {
        let mut h = harness().await;
        let headers: HashMap<String, String> = [
            ("Device-Id", "dev-1"),
            ("User-Id", "7"),
            ("Session-Id", "S1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let before = h.bridge.sessions.count();
        let (_client_tx, _out, _task) = spawn_session(&h.bridge, "S1", headers);

        let open = next_sent(&mut h.bus_rx).await;
        assert_eq!(open.event, EventType::SessionOpen);
        assert_eq!(open.session_id, "S1");
        assert_eq!(open.headers["User-Id"], "7");
        assert_eq!(open.headers["Device-Id"], "dev-1");
        assert_eq!(h.bridge.sessions.count(), before + 1);
    }

    #[tokio::test]
    async fn client_frames_become_data_envelopes_in_order() {
        let mut h = harness().await;
        let (client_tx, _out, _task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        client_tx
            .send(Ok((FrameKind::Text, b"hello".to_vec())))
            .unwrap();
        client_tx
            .send(Ok((FrameKind::Binary, vec![9, 8])))
            .unwrap();

        let first = next_sent(&mut h.bus_rx).await;
        assert_eq!(first.event, EventType::Data);
        assert_eq!(first.session_id, "S1");
        assert_eq!(first.message_type, 1);
        assert_eq!(first.payload, b"hello");

        let second = next_sent(&mut h.bus_rx).await;
        assert_eq!(second.message_type, 2);
        assert_eq!(second.payload, vec![9, 8]);
    }

    #[tokio::test]
    async fn client_close_deregisters_and_sends_one_close() {
        let mut h = harness().await;
        let (client_tx, mut out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        drop(client_tx);
        task.await.unwrap().unwrap();

        assert!(!h.bridge.sessions.contains("S1"));
        assert_eq!(out.recv().await, Some(Outbound::Close));

        h.bridge.bus.shutdown().await;
        let rest = drain(&mut h.bus_rx).await;
        let closes = rest
            .iter()
            .filter(|e| e.event == EventType::SessionClose && e.session_id == "S1")
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn client_read_error_tears_down() {
        let mut h = harness().await;
        let (client_tx, _out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        client_tx
            .send(Err(ImError::Transport("reset".into())))
            .unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(h.bridge.sessions.count(), 0);
        let close = next_sent(&mut h.bus_rx).await;
        assert_eq!(close.event, EventType::SessionClose);
    }

    #[tokio::test]
    async fn bus_close_closes_client_and_deregisters() {
        let mut h = harness().await;
        let (_client_tx, mut out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        h.bridge.dispatch(Envelope::session_close("S1")).await;

        assert!(!h.bridge.sessions.contains("S1"));
        assert_eq!(out.recv().await, Some(Outbound::Close));
        // The session loop notices the close and finishes its own teardown.
        task.await.unwrap().unwrap();
        assert_eq!(h.bridge.sessions.count(), 0);
    }

    #[tokio::test]
    async fn bus_close_after_client_close_is_noop() {
        let mut h = harness().await;
        let (client_tx, _out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        drop(client_tx);
        task.await.unwrap().unwrap();
        h.bridge.dispatch(Envelope::session_close("S1")).await;

        assert!(!h.bridge.sessions.contains("S1"));
        assert_eq!(h.bridge.sessions.count(), 0);
    }

    #[tokio::test]
    async fn data_reaches_registered_client() {
        let h = harness().await;
        let (handle, mut out) = ClientHandle::new(4);
        h.bridge.sessions.put("S1".into(), handle);

        h.bridge
            .dispatch(Envelope::data("S1", FrameKind::Binary, vec![0x01, 0x02]))
            .await;
        assert_eq!(
            out.recv().await,
            Some(Outbound::Frame(FrameKind::Binary, vec![0x01, 0x02]))
        );
    }

    #[tokio::test]
    async fn data_defaults_to_text_framing() {
        let h = harness().await;
        let (handle, mut out) = ClientHandle::new(4);
        h.bridge.sessions.put("S1".into(), handle);

        let mut envelope = Envelope::data("S1", FrameKind::Text, vec![0x01, 0x02]);
        envelope.message_type = 0;
        h.bridge.dispatch(envelope).await;
        assert_eq!(
            out.recv().await,
            Some(Outbound::Frame(FrameKind::Text, vec![0x01, 0x02]))
        );
    }

    #[tokio::test]
    async fn unknown_session_is_dropped() {
        let h = harness().await;
        let (handle, mut out) = ClientHandle::new(4);
        h.bridge.sessions.put("S1".into(), handle);

        h.bridge
            .dispatch(Envelope::data("ghost", FrameKind::Text, b"x".to_vec()))
            .await;
        h.bridge.dispatch(Envelope::session_close("ghost")).await;

        assert_eq!(h.bridge.sessions.count(), 1);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_session_id_and_unsupported_type_dropped() {
        let h = harness().await;
        let (handle, mut out) = ClientHandle::new(4);
        h.bridge.sessions.put("S1".into(), handle);

        h.bridge
            .dispatch(Envelope::data("", FrameKind::Text, b"x".to_vec()))
            .await;
        let mut odd = Envelope::data("S1", FrameKind::Text, b"x".to_vec());
        odd.message_type = 9;
        h.bridge.dispatch(odd).await;

        assert!(out.try_recv().is_err());
        assert_eq!(h.bridge.sessions.count(), 1);
    }

    #[tokio::test]
    async fn write_failure_keeps_session() {
        let h = harness().await;
        let (handle, out) = ClientHandle::new(4);
        h.bridge.sessions.put("S1".into(), handle);
        drop(out);

        h.bridge
            .dispatch(Envelope::data("S1", FrameKind::Text, b"x".to_vec()))
            .await;
        assert!(h.bridge.sessions.contains("S1"));
    }

    #[tokio::test]
    async fn full_client_queue_does_not_stall_other_sessions() {
        let h = harness().await;
        let (stalled, _stalled_out) = ClientHandle::new(1);
        let (healthy, mut healthy_out) = ClientHandle::new(4);
        h.bridge.sessions.put("slow".into(), stalled);
        h.bridge.sessions.put("fast".into(), healthy);

        tokio::time::timeout(Duration::from_secs(1), async {
            for i in 0..3u8 {
                h.bridge
                    .dispatch(Envelope::data("slow", FrameKind::Binary, vec![i]))
                    .await;
            }
            h.bridge
                .dispatch(Envelope::data("fast", FrameKind::Text, b"ok".to_vec()))
                .await;
        })
        .await
        .expect("dispatch blocked on a full client queue");

        assert_eq!(
            healthy_out.try_recv().unwrap(),
            Outbound::Frame(FrameKind::Text, b"ok".to_vec())
        );
        assert!(h.bridge.sessions.contains("slow"));
    }

    #[tokio::test]
    async fn stale_teardown_keeps_session_that_reused_id() {
        let mut h = harness().await;
        let (_client_tx, _out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        h.bridge.dispatch(Envelope::session_close("S1")).await;
        let (newer, _newer_out) = ClientHandle::new(4);
        assert!(h.bridge.sessions.put("S1".into(), newer.clone()));

        task.await.unwrap().unwrap();

        assert!(h
            .bridge
            .sessions
            .get("S1")
            .is_some_and(|current| current.same_connection(&newer)));
        assert_eq!(h.bridge.live_sessions(), 0);

        // The bus closed S1 itself; the old connection's teardown reports nothing.
        h.bridge.bus.shutdown().await;
        let rest = drain(&mut h.bus_rx).await;
        assert!(rest.iter().all(|e| e.event != EventType::SessionClose));
    }

    #[tokio::test]
    async fn live_count_tracks_running_sessions() {
        let mut h = harness().await;
        let (client_tx, _out, task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);
        assert_eq!(h.bridge.live_sessions(), 1);

        drop(client_tx);
        task.await.unwrap().unwrap();
        assert_eq!(h.bridge.live_sessions(), 0);
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let mut h = harness().await;
        let (_tx, _out, _task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);

        let (_tx2, _out2, task2) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert!(task2.await.unwrap().is_err());
        assert_eq!(h.bridge.sessions.count(), 1);
    }

    #[tokio::test]
    async fn run_bus_dispatches_and_clears_on_end() {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(BusHolder::new()),
        ));
        let (handle, mut out) = ClientHandle::new(4);
        bridge.sessions.put("S1".into(), handle);

        let (sink, _bus_rx) = memory_sink();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel::<ImResult<Envelope>>();
        let task = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.run_bus(sink, channel_stream(bus_rx)).await })
        };

        bus_tx
            .send(Ok(Envelope::data("S1", FrameKind::Text, b"hi".to_vec())))
            .unwrap();
        assert_eq!(
            out.recv().await,
            Some(Outbound::Frame(FrameKind::Text, b"hi".to_vec()))
        );
        assert!(bridge.bus.is_connected());

        drop(bus_tx);
        task.await.unwrap().unwrap();
        assert!(!bridge.bus.is_connected());
        // Sessions stay registered when the bus goes away.
        assert!(bridge.sessions.contains("S1"));
    }

    #[tokio::test]
    async fn run_bus_read_error_clears_connectivity() {
        let bridge = Bridge::new(Arc::new(SessionRegistry::new()), Arc::new(BusHolder::new()));
        let (sink, _bus_rx) = memory_sink();
        let (bus_tx, bus_rx) = mpsc::unbounded_channel::<ImResult<Envelope>>();
        bus_tx
            .send(Err(ImError::Transport("reset".into())))
            .unwrap();

        assert!(bridge.run_bus(sink, channel_stream(bus_rx)).await.is_err());
        assert!(!bridge.bus.is_connected());
    }

    #[tokio::test]
    async fn sessions_survive_bus_loss_with_dropped_sends() {
        let mut h = harness().await;
        let (client_tx, _out, _task) = spawn_session(&h.bridge, "S1", HashMap::new());
        assert_eq!(next_sent(&mut h.bus_rx).await.event, EventType::SessionOpen);
        wait_registered(&h.bridge, "S1").await;

        h.bridge.bus.on_closed(1).await;
        assert!(!h.bridge.bus.is_connected());

        client_tx
            .send(Ok((FrameKind::Text, b"lost".to_vec())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.bridge.sessions.contains("S1"));
    }
}
