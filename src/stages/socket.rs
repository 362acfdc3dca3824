use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use stage_bus::StageQueue;

use crate::{
    auth::Credential,
    connection::{CloseReason, ConnectionHandle, ConnectionId, ConnectionRegistry, Outbound},
    media::{Frame, FrameDecoder},
    params::{ParameterSnapshot, ParameterStore},
    protocol::{AuthAttempt, CLOSE_POLICY, ClientMessage, REASON_INVALID_AUTH, ServerMessage},
};

const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a connection task needs, shared by all connections of one receiver.
#[derive(Clone)]
pub(crate) struct SocketState {
    pub credential: Credential,
    pub registry: Arc<ConnectionRegistry>,
    pub store: ParameterStore,
    pub decoder: Arc<dyn FrameDecoder>,
    pub intake: Arc<StageQueue<(Frame, ParameterSnapshot)>>,
    pub cancel: CancellationToken,
    pub frame_interval: Duration,
    pub auth_timeout: Duration,
    pub outbound_buffer: usize,
}

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SocketState) {
    let (mut sink, mut stream) = socket.split();

    match authenticate(&mut stream, &state).await {
        Ok(()) => {}
        Err(Some(reason)) => {
            log::info!("rejecting connection: {}", reason);
            send_close(&mut sink, CLOSE_POLICY, reason).await;
            return;
        }
        Err(None) => {
            log::debug!("connection went away before authenticating");
            return;
        }
    }

    let (tx, rx) = mpsc::channel(state.outbound_buffer);
    let conn = state
        .registry
        .register(tx.clone(), &state.cancel, Instant::now());
    let writer = tokio::spawn(write_loop(sink, rx, conn.clone()));

    if read_loop(stream, &state, &conn, tx).await {
        conn.close(CloseReason::NORMAL);
    } else {
        conn.cancel.cancel();
    }
    state.registry.remove(conn.id);
    if let Err(e) = writer.await {
        log::warn!("connection {} writer ended abnormally: {}", conn.id, e);
    }
}

/// Wait for the first data message and check it. `Err(None)` means the peer
/// left or the stage is stopping; `Err(Some(reason))` is a rejection.
async fn authenticate(
    stream: &mut SplitStream<WebSocket>,
    state: &SocketState,
) -> Result<(), Option<&'static str>> {
    let first = tokio::select! {
        _ = state.cancel.cancelled() => return Err(None),
        first = tokio::time::timeout(state.auth_timeout, first_data_message(stream)) => first,
    };
    let attempt = match first {
        Ok(Some(Message::Text(text))) => AuthAttempt::parse(text.as_str()),
        Ok(Some(_)) => AuthAttempt::Malformed,
        Ok(None) => return Err(None),
        Err(_) => {
            log::info!("no auth message within {:?}", state.auth_timeout);
            return Err(Some(REASON_INVALID_AUTH));
        }
    };

    let AuthAttempt::Password(password) = attempt else {
        return Err(Some(attempt.rejection_reason()));
    };
    let credential = state.credential.clone();
    let verified = tokio::task::spawn_blocking(move || credential.verify(&password))
        .await
        .unwrap_or(false);
    if verified {
        Ok(())
    } else {
        Err(Some(REASON_INVALID_AUTH))
    }
}

/// Skip protocol-level ping/pong until the client says something.
async fn first_data_message(stream: &mut SplitStream<WebSocket>) -> Option<Message> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(msg) => return Some(msg),
        }
    }
    None
}

/// Serve an authenticated connection. Returns true when the peer went away,
/// false when the connection was closed from this side.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &SocketState,
    conn: &ConnectionHandle,
    tx: mpsc::Sender<Outbound>,
) -> bool {
    loop {
        let msg = tokio::select! {
            _ = conn.cancel.cancelled() => return false,
            msg = stream.next() => msg,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                log::debug!("connection {} read error: {}", conn.id, e);
                return true;
            }
            None => return true,
        };

        match msg {
            Message::Binary(payload) => accept_frame(state, conn.id, payload),
            Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                Some(ClientMessage::Ping) => {
                    state.registry.touch(conn.id, Instant::now());
                    let pong = Outbound::Text(ServerMessage::Pong.to_text());
                    if tx.try_send(pong).is_err() {
                        log::debug!("connection {} outbound full, pong skipped", conn.id);
                    }
                }
                Some(ClientMessage::Pong) => {
                    state.registry.touch(conn.id, Instant::now());
                }
                Some(ClientMessage::Auth { .. }) => {
                    log::debug!("connection {} sent auth twice, ignored", conn.id);
                }
                None => log::debug!("connection {} sent unknown text message", conn.id),
            },
            Message::Ping(_) | Message::Pong(_) => {
                state.registry.touch(conn.id, Instant::now());
            }
            Message::Close(_) => return true,
        }
    }
}

/// Rate limit, decode and hand a frame to the batcher.
fn accept_frame(state: &SocketState, id: ConnectionId, payload: Bytes) {
    let now = Instant::now();
    if !state.registry.admit_frame(id, now, state.frame_interval) {
        log::trace!("connection {} over frame rate, dropped", id);
        return;
    }

    let image = match state.decoder.decode(payload) {
        Ok(image) => image,
        Err(e) => {
            log::warn!("connection {} sent undecodable frame: {:#}", id, e);
            return;
        }
    };
    let frame = Frame {
        connection: id,
        received_at: now,
        image,
    };
    if let Some((stale, _)) = state.intake.push((frame, state.store.snapshot())) {
        log::debug!("intake full, dropped oldest {}", stale);
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    conn: ConnectionHandle,
) {
    loop {
        tokio::select! {
            biased;
            out = rx.recv() => {
                let msg = match out {
                    Some(Outbound::Frame(data)) => Message::Binary(data),
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    None => break,
                };
                if let Err(e) = sink.send(msg).await {
                    log::debug!("connection {} send failed: {}", conn.id, e);
                    break;
                }
            },
            _ = conn.cancel.cancelled() => {
                let close = conn.close_reason();
                send_close(&mut sink, close.code, close.reason).await;
                break;
            },
        }
    }
    // a dead writer takes the reader down with it
    conn.cancel.cancel();
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    match tokio::time::timeout(CLOSE_SEND_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("close frame not delivered: {}", e),
        Err(_) => log::debug!("close frame timed out"),
    }
}
