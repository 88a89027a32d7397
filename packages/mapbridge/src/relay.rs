//! Relay session: one task per upgraded socket, pumping frames to the
//! counterpart side of the same user.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use mapbridge_proto::{PeerStatus, is_heartbeat};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionRegistry, PeerHandle, Side};

/// Outbound queue depth per socket.
const OUTBOUND_QUEUE: usize = 100;

/// Drive one relay socket until it closes, fails, or is replaced.
pub async fn run_relay(
    socket: WebSocket,
    user: String,
    side: Side,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
) {
    info!(user = %user, side = %side, "Relay connection opened");
    metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();
    let me = PeerHandle::new(tx, cancel.clone());

    // Single writer per socket keeps per-direction order.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if ws_sender.send(frame).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Some(previous) = registry.register(&user, side, me.clone()).await {
        info!(user = %user, side = %side, "Replacing existing connection");
        metrics.connection_replaced();
        previous.close();
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(user = %user, side = %side, "Connection superseded");
                break;
            }
            frame = ws_receiver.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(user = %user, side = %side, "WebSocket read failed: {}", e);
                metrics.websocket_error();
                break;
            }
            None => break,
        };

        match &frame {
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
            WsMessage::Text(text) if side == Side::App && is_heartbeat(text.as_str()) => {
                metrics.heartbeat_dropped();
                continue;
            }
            _ => {}
        }

        match registry.get(&user, side.counterpart()).await {
            Some(peer) => {
                if peer.send(frame).await.is_err() {
                    warn!(user = %user, side = %side, "Forwarding to {} failed", side.counterpart());
                    break;
                }
                metrics.frame_relayed();
            }
            None => {
                metrics.frame_unrouted();
                let reply = side.counterpart().presence(PeerStatus::Disconnected);
                if me.send_message(&reply).await.is_err() {
                    break;
                }
            }
        }
    }

    registry.unregister(&user, side, me.id()).await;

    let _ = me.send(WsMessage::Close(None)).await;
    drop(me);
    let _ = writer.await;

    metrics.connection_closed();
    info!(user = %user, side = %side, "Relay connection closed");
}
