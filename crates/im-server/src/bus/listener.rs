//! Bus listener using tokio-tungstenite.
//!
//! The upstream business-logic peer connects here and exchanges one JSON
//! envelope per WebSocket frame. Each accepted stream is handed to the
//! bridge, which installs it as the active bus connection.

use super::holder::BusSink;
use crate::bridge::Bridge;
use futures_util::{future, SinkExt, Stream, StreamExt};
use im_core::{decode_envelope, encode_envelope, Envelope, ImError, ImResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Bind the bus listener.
pub async fn bind(addr: SocketAddr) -> ImResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ImError::Transport(format!("bus bind failed: {e}")))?;
    info!(addr = %addr, "bus listener started");
    Ok(listener)
}

/// Accept bus connections until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    bridge: Arc<Bridge>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("bus listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, bridge).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "bus TCP accept failed");
                }
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, bridge: Arc<Bridge>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %addr, error = %e, "bus WebSocket handshake failed");
            return;
        }
    };
    debug!(remote = %addr, "bus peer connected");

    let (sink, stream) = split(ws_stream);
    if let Err(e) = bridge.run_bus(sink, stream).await {
        warn!(remote = %addr, error = %e, "bus connection ended with error");
    }
}

/// Split a WebSocket into an envelope sink and an envelope stream.
pub fn split<S>(ws: WebSocketStream<S>) -> (BusSink, impl Stream<Item = ImResult<Envelope>> + Unpin)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sink, ws_stream) = ws.split();

    let sink = ws_sink
        .sink_map_err(|e| ImError::Transport(format!("bus write failed: {e}")))
        .with(|envelope: Envelope| {
            future::ready(encode_envelope(&envelope).map(|json| Message::Text(json.into())))
        });

    let stream = ws_stream
        .take_while(|msg| {
            future::ready(!matches!(
                msg,
                Ok(Message::Close(_)) | Err(WsError::ConnectionClosed)
            ))
        })
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => decode_frame(text.as_bytes()),
                Ok(Message::Binary(data)) => decode_frame(&data),
                Ok(_) => None,
                Err(e) => Some(Err(ImError::Transport(format!("bus read failed: {e}")))),
            })
        });

    (Box::pin(sink), stream)
}

/// Malformed envelopes are logged and skipped rather than ending the stream.
fn decode_frame(data: &[u8]) -> Option<ImResult<Envelope>> {
    match decode_envelope(data) {
        Ok(envelope) => Some(Ok(envelope)),
        Err(e) => {
            warn!(error = %e, len = data.len(), "dropping undecodable bus frame");
            None
        }
    }
}
