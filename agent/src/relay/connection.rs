use std::error::Error;
use std::sync::mpsc::Sender;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use terminal_remote_protocol::{decode, decode_binary, encode, encode_binary, ControlMessage};
use tokio::sync::mpsc as tokio_mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::relay::frame::RelayFrame;
use crate::shell_table::{ShellDirective, ShellTable};

const INITIAL_BACKOFF_SECS: f64 = 1.0;
const MAX_BACKOFF_SECS: f64 = 32.0;

/// States of the agent's reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
}

/// Events surfaced from the relay client to the supervisor/UI layer.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    StateChanged(ReconnectState),
    SessionCode { code: String, expires_at: i64 },
    BrowserConnected(String),
    BrowserDisconnected(String),
    Error(String),
}

/// Owns the single WebSocket connection to the relay, multiplexing every
/// registered shell's bytes onto it and demultiplexing relay frames back
/// out to the shell table.
pub struct RelayClient {
    relay_url: String,
    client_id: String,
    event_tx: Sender<RelayEvent>,
    frame_rx: tokio_mpsc::Receiver<RelayFrame>,
    shell_table: ShellTable,
    attempt: u32,
}

impl RelayClient {
    pub fn new(
        relay_url: String,
        event_tx: Sender<RelayEvent>,
        frame_rx: tokio_mpsc::Receiver<RelayFrame>,
        shell_table: ShellTable,
    ) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("relay client created with client_id {client_id}");
        Self {
            relay_url,
            client_id,
            event_tx,
            frame_rx,
            shell_table,
            attempt: 0,
        }
    }

    fn enter(&self, state: ReconnectState) {
        let _ = self.event_tx.send(RelayEvent::StateChanged(state));
    }

    /// Runs forever, reconnecting with jittered exponential backoff
    /// whenever the relay link drops.
    pub async fn run(&mut self) {
        loop {
            self.enter(ReconnectState::Connecting);
            match self.connect_and_run().await {
                Ok(()) => tracing::info!("relay connection closed cleanly"),
                Err(e) => {
                    tracing::error!("relay connection error: {e}");
                    let _ = self.event_tx.send(RelayEvent::Error(e.to_string()));
                }
            }

            self.enter(ReconnectState::Reconnecting);
            let delay = backoff_delay(self.attempt);
            tracing::info!("reconnecting to relay in {delay:?} (attempt {})", self.attempt);
            tokio::time::sleep(delay).await;
            self.attempt += 1;
        }
    }

    async fn connect_and_run(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::info!("connecting to relay: {}", self.relay_url);
        let (ws_stream, _response) = connect_async(&self.relay_url).await?;
        self.enter(ReconnectState::Authenticating);

        let (mut write, mut read) = ws_stream.split();

        let register = ControlMessage::Register { client_id: self.client_id.clone() };
        write.send(Message::Text(encode(&register).into())).await?;

        let (code, expires_at) = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match decode(&text) {
                    Ok(ControlMessage::Registered { code, expires_at }) => break (code, expires_at),
                    Ok(other) => tracing::warn!("unexpected message while authenticating: {other:?}"),
                    Err(e) => return Err(Box::new(e)),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Err(format!("relay closed before registering: {frame:?}").into());
                }
                None => return Err("relay stream ended before registering".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Box::new(e)),
            }
        };

        self.attempt = 0;
        self.enter(ReconnectState::Connected);
        let _ = self.event_tx.send(RelayEvent::SessionCode { code, expires_at });

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_control(&text) {
                                write.send(Message::Text(encode(&reply).into())).await?;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!("relay sent close: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => {}
                        None => break,
                        Some(Err(e)) => return Err(Box::new(e)),
                    }
                }
                frame = self.frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.send_frame(&mut write, frame).await?,
                        None => {
                            tracing::info!("shell frame channel closed, disconnecting from relay");
                            break;
                        }
                    }
                }
            }
        }

        self.enter(ReconnectState::Disconnected);
        Ok(())
    }

    /// Forward a frame from the IPC side up to the relay.
    async fn send_frame<S>(&self, write: &mut S, frame: RelayFrame) -> Result<(), Box<dyn Error + Send + Sync>>
    where
        S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match frame {
            RelayFrame::ShellOutput { shell_id, data } => match encode_binary(&shell_id, &data) {
                Ok(bytes) => write.send(Message::Binary(bytes.into())).await?,
                Err(e) => tracing::warn!("dropping oversized shell frame for {shell_id}: {e}"),
            },
            RelayFrame::ShellConnected { shell_id, name } => {
                let msg = ControlMessage::SessionConnected { session_id: shell_id, name };
                write.send(Message::Text(encode(&msg).into())).await?;
            }
            RelayFrame::ShellDisconnected { shell_id } => {
                let msg = ControlMessage::SessionDisconnected { session_id: shell_id };
                write.send(Message::Text(encode(&msg).into())).await?;
            }
        }
        Ok(())
    }

    /// Handle a control frame from the relay. Returns a reply to send, if any.
    fn handle_control(&self, text: &str) -> Option<ControlMessage> {
        let msg = match decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("malformed control frame from relay: {e}");
                return None;
            }
        };

        match msg {
            ControlMessage::BrowserConnected { browser_id } => {
                let _ = self.event_tx.send(RelayEvent::BrowserConnected(browser_id));
                None
            }
            ControlMessage::BrowserDisconnected { browser_id } => {
                let _ = self.event_tx.send(RelayEvent::BrowserDisconnected(browser_id));
                None
            }
            ControlMessage::TerminalResize { session_id, cols, rows } => {
                self.shell_table.dispatch(&session_id, ShellDirective::Resize { cols, rows });
                None
            }
            ControlMessage::Ping { ts } => Some(ControlMessage::Pong { ts }),
            ControlMessage::Pong { .. } => None,
            ControlMessage::Error { code, message } => {
                let _ = self.event_tx.send(RelayEvent::Error(format!("{code}: {message}")));
                None
            }
            other => {
                tracing::warn!("unexpected message on established connection: {other:?}");
                None
            }
        }
    }

    /// Handle a binary frame from the relay: browser keystrokes bound for a shell.
    fn handle_binary(&self, data: &[u8]) {
        match decode_binary(data) {
            Ok((shell_id, payload)) => {
                if !self.shell_table.dispatch(&shell_id, ShellDirective::Input(payload.to_vec())) {
                    tracing::debug!("input for unknown or closed shell {shell_id}");
                }
            }
            Err(e) => tracing::warn!("malformed binary frame from relay: {e}"),
        }
    }
}

/// `min(INITIAL * 2^attempt, MAX)` with ±10% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = (INITIAL_BACKOFF_SECS * 2f64.powi(attempt as i32)).min(MAX_BACKOFF_SECS);
    let jitter = rand::rng().random_range(0.9..=1.1);
    Duration::from_secs_f64(base * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_documented_envelope() {
        let expected_bases = [1.0, 2.0, 4.0, 8.0, 16.0];
        for (attempt, base) in expected_bases.iter().enumerate() {
            let delay = backoff_delay(attempt as u32).as_secs_f64();
            assert!(delay >= base * 0.9 - 1e-9, "attempt {attempt}: {delay} too small");
            assert!(delay <= base * 1.1 + 1e-9, "attempt {attempt}: {delay} too large");
        }
    }

    #[test]
    fn backoff_caps_at_max() {
        for attempt in [6, 10, 100] {
            let delay = backoff_delay(attempt).as_secs_f64();
            assert!(delay <= MAX_BACKOFF_SECS * 1.1 + 1e-9);
        }
    }

    #[test]
    fn relay_client_creation_assigns_uuid_client_id() {
        let (tx, _rx) = std::sync::mpsc::channel();
        let (_frame_tx, frame_rx) = tokio_mpsc::channel(8);
        let client = RelayClient::new(
            "ws://localhost:3000/ws".into(),
            tx,
            frame_rx,
            ShellTable::new(),
        );
        assert!(uuid::Uuid::parse_str(&client.client_id).is_ok());
        assert_eq!(client.attempt, 0);
    }
}
