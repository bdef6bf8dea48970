use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::SinkExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::broker::{Broker, Incoming};
use crate::peer::OutboundFrame;
use crate::protocol::ProtoError;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<Arc<Broker>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, broker))
}

async fn handle_socket(mut socket: WebSocket, broker: Arc<Broker>) {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    let peer_id = match broker.register_peer(outbox_tx).await {
        Ok(peer_id) => peer_id,
        Err(err) => {
            warn!(reason = err.reason, "connection refused");
            close_with(&mut socket, err).await;
            return;
        }
    };

    let span = info_span!("conn", peer_id);
    run_session(socket, broker, peer_id, outbox_rx)
        .instrument(span)
        .await;
}

// Per-connection counters, logged once on disconnect.
#[derive(Default)]
struct ConnStats {
    msgs_in: u64,
    msgs_out: u64,
    bytes_in: u64,
    bytes_out: u64,
}

async fn run_session(
    mut socket: WebSocket,
    broker: Arc<Broker>,
    peer_id: u32,
    mut outbox_rx: UnboundedReceiver<OutboundFrame>,
) {
    info!("client connected");
    let mut stats = ConnStats::default();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        stats.msgs_in += 1;
                        stats.bytes_in += text.len() as u64;
                        let message = Incoming::Text(text.to_string());
                        if let Err(err) = broker.handle_message(peer_id, message).await {
                            warn!(reason = err.reason, "protocol error; closing");
                            close_with(&mut socket, err).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        stats.msgs_in += 1;
                        stats.bytes_in += data.len() as u64;
                        let message = Incoming::Binary(data.to_vec());
                        if let Err(err) = broker.handle_message(peer_id, message).await {
                            warn!(reason = err.reason, "protocol error; closing");
                            close_with(&mut socket, err).await;
                            break;
                        }
                    }
                    // The transport layer answers pings on its own.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket recv error");
                        break;
                    }
                    None => break,
                }
            }

            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(OutboundFrame::Envelope(envelope)) => {
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize envelope; dropping");
                                continue;
                            }
                        };
                        stats.msgs_out += 1;
                        stats.bytes_out += text.len() as u64;
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Binary(blob)) => {
                        stats.msgs_out += 1;
                        stats.bytes_out += blob.len() as u64;
                        if socket.send(Message::Binary(blob.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Ping) => {
                        if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { code, reason }) => {
                        close_with(&mut socket, ProtoError::new(code, reason)).await;
                        break;
                    }
                    // The broker dropped this peer's outbox.
                    None => break,
                }
            }
        }
    }

    broker.disconnect(peer_id).await;
    debug!(
        msgs_in = stats.msgs_in,
        msgs_out = stats.msgs_out,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "connection stats"
    );
    info!("client disconnected");
}

async fn close_with(socket: &mut WebSocket, err: ProtoError) {
    let frame = CloseFrame {
        code: err.code,
        reason: err.reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
    let _ = socket.close().await;
}
