//! The relay's single WebSocket endpoint: role is inferred from the first
//! control message, then the connection is routed as either an agent or a
//! browser for its whole lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use terminal_remote_protocol::{self as protocol, ControlMessage, ErrorKind};

use crate::registry::{
    JoinOutcome, OutboundFrame, Registry, AGENT_QUEUE_CAPACITY, BROWSER_QUEUE_CAPACITY,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

type Sender = SplitSink<WebSocket, Message>;
type Receiver = SplitStream<WebSocket>;

pub async fn ws_handler(ws: WebSocketUpgrade, State(registry): State<Registry>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Registry) {
    let (mut sender, mut receiver) = socket.split();

    let Some(Ok(first_msg)) = receiver.next().await else {
        debug!("client disconnected before sending a first message");
        return;
    };

    let Message::Text(text) = first_msg else {
        close_with_error(&mut sender, ErrorKind::InvalidMessage, "first message must be JSON").await;
        return;
    };

    match protocol::decode(&text) {
        Ok(ControlMessage::Register { client_id }) => {
            handle_agent(sender, receiver, registry, client_id).await;
        }
        Ok(ControlMessage::Auth { session_code }) => {
            handle_browser(sender, receiver, registry, session_code).await;
        }
        Ok(other) => {
            warn!(?other, "unexpected first message variant");
            close_with_error(&mut sender, ErrorKind::InvalidMessage, "first message must be register or auth")
                .await;
        }
        Err(e) => {
            warn!(error = %e, "invalid first message");
            close_with_error(&mut sender, ErrorKind::InvalidMessage, &e.to_string()).await;
        }
    }
}

/// Shared writer loop for both agent and browser connections: drains the
/// outbound data queue, sends periodic protocol-level pings, and tears the
/// connection down on a forced-close signal (SLOW_CONSUMER, UPSTREAM_GONE)
/// or two consecutive missed pongs.
async fn run_writer(
    mut sender: Sender,
    mut data_rx: mpsc::Receiver<OutboundFrame>,
    mut kick_rx: mpsc::Receiver<ErrorKind>,
    pong_seen: Arc<AtomicBool>,
) {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            frame = data_rx.recv() => {
                let Some(frame) = frame else { break };
                let sent = match frame {
                    OutboundFrame::Binary(data) => sender.send(Message::Binary(data.into())).await,
                    OutboundFrame::Text(text) => sender.send(Message::Text(text.into())).await,
                };
                if sent.is_err() {
                    break;
                }
            }
            reason = kick_rx.recv() => {
                let reason = reason.unwrap_or(ErrorKind::Internal);
                send_error_frame(&mut sender, reason, reason.as_code()).await;
                break;
            }
            _ = heartbeat.tick() => {
                if !pong_seen.swap(false, Ordering::SeqCst) {
                    missed_pongs += 1;
                    if missed_pongs >= MAX_MISSED_PONGS {
                        debug!("missed {} consecutive pongs, closing", missed_pongs);
                        break;
                    }
                } else {
                    missed_pongs = 0;
                }
                let ping = protocol::encode(&ControlMessage::Ping { ts: now_ms() });
                if sender.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn handle_agent(sender: Sender, mut receiver: Receiver, registry: Registry, client_id: String) {
    let (data_tx, data_rx) = mpsc::channel::<OutboundFrame>(AGENT_QUEUE_CAPACITY);
    let (kick_tx, kick_rx) = mpsc::channel::<ErrorKind>(1);
    let pong_seen = Arc::new(AtomicBool::new(true));

    let (code, expires_at) = registry.allocate(data_tx.clone());
    info!(code = %code, client_id = %client_id, "agent registered");

    let registered = protocol::encode(&ControlMessage::Registered { code: code.clone(), expires_at });
    if data_tx.try_send(OutboundFrame::Text(registered)).is_err() {
        registry.drop_agent(&code);
        return;
    }

    let writer = tokio::spawn(run_writer(sender, data_rx, kick_rx, Arc::clone(&pong_seen)));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if let Err(e) = protocol::decode_binary(&data) {
                    warn!(code = %code, error = %e, "invalid binary frame from agent");
                    let _ = kick_tx.try_send(ErrorKind::InvalidMessage);
                    break;
                }
                let slow = registry.fan_out_to_browsers(&code, OutboundFrame::Binary(data.to_vec()));
                for browser_id in slow {
                    warn!(code = %code, browser_id = %browser_id, "browser queue full, disconnecting");
                    registry.drop_browser(&code, &browser_id);
                }
            }
            Ok(Message::Text(text)) => {
                handle_agent_text(&code, &text, &registry, &data_tx, &pong_seen);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(code = %code, error = %e, "agent websocket error");
                break;
            }
        }
    }

    let browser_kicks = registry.drop_agent(&code);
    for kick in browser_kicks {
        let _ = kick.send(ErrorKind::UpstreamGone).await;
    }
    writer.abort();
    info!(code = %code, "agent disconnected");
}

fn handle_agent_text(
    code: &str,
    text: &str,
    registry: &Registry,
    self_tx: &mpsc::Sender<OutboundFrame>,
    pong_seen: &Arc<AtomicBool>,
) {
    match protocol::decode(text) {
        Ok(ControlMessage::SessionConnected { session_id, name }) => {
            registry.record_shell_connected(code, session_id, name);
            registry.fan_out_to_browsers(code, OutboundFrame::Text(text.to_string()));
        }
        Ok(ControlMessage::SessionDisconnected { session_id }) => {
            registry.record_shell_disconnected(code, &session_id);
            registry.fan_out_to_browsers(code, OutboundFrame::Text(text.to_string()));
        }
        Ok(ControlMessage::Ping { ts }) => {
            let pong = protocol::encode(&ControlMessage::Pong { ts });
            let _ = self_tx.try_send(OutboundFrame::Text(pong));
        }
        Ok(ControlMessage::Pong { .. }) => {
            pong_seen.store(true, Ordering::SeqCst);
        }
        Ok(other) => {
            debug!(code = %code, ?other, "ignoring unexpected control message from agent");
        }
        Err(e) => {
            warn!(code = %code, error = %e, "malformed control message from agent");
        }
    }
}

async fn handle_browser(
    mut sender: Sender,
    mut receiver: Receiver,
    registry: Registry,
    session_code: String,
) {
    let code = session_code.to_uppercase();

    if !registry.validate(&code) {
        let msg = protocol::encode(&ControlMessage::AuthFailed { reason: ErrorKind::InvalidCode.as_code().into() });
        let _ = sender.send(Message::Text(msg.into())).await;
        info!(code = %code, "browser auth failed: invalid code");
        return;
    }

    let (data_tx, data_rx) = mpsc::channel::<OutboundFrame>(BROWSER_QUEUE_CAPACITY);
    let (kick_tx, kick_rx) = mpsc::channel::<ErrorKind>(1);
    let pong_seen = Arc::new(AtomicBool::new(true));
    let browser_id = uuid::Uuid::new_v4().to_string();

    let session_id = match registry.join(&code, browser_id.clone(), data_tx.clone(), kick_tx.clone()) {
        JoinOutcome::Joined { session_id } => session_id,
        JoinOutcome::InvalidCode => {
            let msg = protocol::encode(&ControlMessage::AuthFailed { reason: ErrorKind::InvalidCode.as_code().into() });
            let _ = sender.send(Message::Text(msg.into())).await;
            return;
        }
        JoinOutcome::ExpiredCode => {
            let msg = protocol::encode(&ControlMessage::AuthFailed { reason: ErrorKind::ExpiredCode.as_code().into() });
            let _ = sender.send(Message::Text(msg.into())).await;
            info!(code = %code, "browser auth failed: expired code");
            return;
        }
    };

    let auth_success = protocol::encode(&ControlMessage::AuthSuccess);
    if sender.send(Message::Text(auth_success.into())).await.is_err() {
        registry.drop_browser(&code, &browser_id);
        return;
    }

    info!(code = %code, browser_id = %browser_id, session_id = %session_id, "browser joined");

    // Populate the browser's tab list with shells that already exist.
    for (shell_id, name) in registry.snapshot_shells(&code) {
        let msg = protocol::encode(&ControlMessage::SessionConnected { session_id: shell_id, name });
        let _ = data_tx.try_send(OutboundFrame::Text(msg));
    }

    registry.send_to_agent(
        &code,
        OutboundFrame::Text(protocol::encode(&ControlMessage::BrowserConnected { browser_id: browser_id.clone() })),
    );

    let writer = tokio::spawn(run_writer(sender, data_rx, kick_rx, Arc::clone(&pong_seen)));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if let Err(e) = protocol::decode_binary(&data) {
                    warn!(code = %code, browser_id = %browser_id, error = %e, "invalid binary frame from browser");
                    let _ = kick_tx.try_send(ErrorKind::InvalidMessage);
                    break;
                }
                registry.send_to_agent(&code, OutboundFrame::Binary(data.to_vec()));
            }
            Ok(Message::Text(text)) => {
                handle_browser_text(&code, &text, &registry, &data_tx, &pong_seen, &kick_tx);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(code = %code, browser_id = %browser_id, error = %e, "browser websocket error");
                break;
            }
        }
    }

    registry.drop_browser(&code, &browser_id);
    registry.send_to_agent(
        &code,
        OutboundFrame::Text(protocol::encode(&ControlMessage::BrowserDisconnected { browser_id: browser_id.clone() })),
    );
    writer.abort();
    info!(code = %code, browser_id = %browser_id, "browser disconnected");
}

fn handle_browser_text(
    code: &str,
    text: &str,
    registry: &Registry,
    self_tx: &mpsc::Sender<OutboundFrame>,
    pong_seen: &Arc<AtomicBool>,
    kick_tx: &mpsc::Sender<ErrorKind>,
) {
    match protocol::decode(text) {
        Ok(ControlMessage::TerminalResize { .. }) => {
            registry.send_to_agent(code, OutboundFrame::Text(text.to_string()));
        }
        Ok(ControlMessage::Ping { ts }) => {
            let pong = protocol::encode(&ControlMessage::Pong { ts });
            let _ = self_tx.try_send(OutboundFrame::Text(pong));
        }
        Ok(ControlMessage::Pong { .. }) => {
            pong_seen.store(true, Ordering::SeqCst);
        }
        Ok(other) => {
            debug!(code = %code, ?other, "unexpected control message from browser");
            let _ = kick_tx.try_send(ErrorKind::InvalidMessage);
        }
        Err(e) => {
            warn!(code = %code, error = %e, "malformed control message from browser");
            let _ = kick_tx.try_send(ErrorKind::InvalidMessage);
        }
    }
}

async fn close_with_error(sender: &mut Sender, kind: ErrorKind, message: &str) {
    send_error_frame(sender, kind, message).await;
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_error_frame(sender: &mut Sender, kind: ErrorKind, message: &str) {
    let err = protocol::encode(&ControlMessage::Error { code: kind.as_code().into(), message: message.into() });
    let _ = sender.send(Message::Text(err.into())).await;
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis() as i64
}
