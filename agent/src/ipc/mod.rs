//! IPC server for shell-wrapper connections.
//!
//! Shell-wrappers connect over a local Unix domain socket, register with a
//! single JSON line, and then stream PTY output as 4-byte-length-prefixed
//! binary frames. The agent multiplexes every registered shell's bytes onto
//! the single relay WebSocket; directives travelling the other way (browser
//! input, resize) arrive through the shared [`ShellTable`].

mod session;

pub use session::{RegisteredReply, Session, ShellRegistration};

use std::sync::mpsc::Sender;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::relay::RelayFrame;
use crate::shell_table::{ShellHandle, ShellTable};

/// Deadline for receiving and parsing the registration line.
const REGISTRATION_TIMEOUT: Duration = Duration::from_millis(500);
/// Registration line must parse within this many bytes.
const REGISTRATION_MAX_BYTES: usize = 4096;

/// Events sent from the IPC server to the UI thread.
#[derive(Debug, Clone)]
pub enum IpcEvent {
    SessionConnected { shell_id: String, name: String },
    SessionDisconnected { shell_id: String },
    SessionCountChanged(usize),
    Error(String),
}

/// Accepts shell-wrapper connections on a local stream socket.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: String,
    shell_table: ShellTable,
    relay_frame_tx: mpsc::Sender<RelayFrame>,
    event_tx: Sender<IpcEvent>,
}

impl IpcServer {
    /// Bind to `socket_path`, unlinking any stale socket file first.
    pub async fn new(
        socket_path: String,
        shell_table: ShellTable,
        relay_frame_tx: mpsc::Sender<RelayFrame>,
        event_tx: Sender<IpcEvent>,
    ) -> std::io::Result<Self> {
        if std::path::Path::new(&socket_path).exists() {
            warn!("removing stale socket file at {socket_path}");
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!("IPC server listening on {socket_path}");

        Ok(Self {
            listener,
            socket_path,
            shell_table,
            relay_frame_tx,
            event_tx,
        })
    }

    /// Accept connections forever, one task per shell-wrapper.
    pub async fn run(&mut self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("new IPC connection accepted");
                    let shell_table = self.shell_table.clone();
                    let relay_frame_tx = self.relay_frame_tx.clone();
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, shell_table, relay_frame_tx, event_tx).await;
                    });
                }
                Err(e) => {
                    error!("failed to accept IPC connection: {e}");
                    let _ = self.event_tx.send(IpcEvent::Error(format!("accept error: {e}")));
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        info!("IPC server shutting down, removing socket file");
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove socket file: {e}");
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    shell_table: ShellTable,
    relay_frame_tx: mpsc::Sender<RelayFrame>,
    event_tx: Sender<IpcEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let read_result = tokio::time::timeout(REGISTRATION_TIMEOUT, reader.read_line(&mut line)).await;

    let registration = match read_result {
        Ok(Ok(0)) => {
            debug!("IPC connection closed before registration");
            return;
        }
        Ok(Ok(_)) if line.len() > REGISTRATION_MAX_BYTES => {
            warn!("registration line exceeded {REGISTRATION_MAX_BYTES} bytes, closing");
            return;
        }
        Ok(Ok(_)) => match serde_json::from_str::<ShellRegistration>(&line) {
            Ok(reg) => reg,
            Err(e) => {
                warn!("invalid registration message: {} ({e})", line.trim());
                return;
            }
        },
        Ok(Err(e)) => {
            error!("failed to read registration: {e}");
            return;
        }
        Err(_) => {
            warn!("registration did not arrive within {REGISTRATION_TIMEOUT:?}, closing");
            return;
        }
    };

    let shell_id = Uuid::new_v4().to_string();
    info!(
        "shell registered: {} (id={}, shell={}, pid={}, tty={})",
        registration.name, shell_id, registration.shell, registration.pid, registration.tty
    );

    let mut session = Session::new(shell_id.clone(), registration.clone(), write_half);
    if let Err(e) = send_registered_reply(&mut session, &shell_id).await {
        warn!("failed to send registration reply to {shell_id}: {e}");
        return;
    }

    let (directive_tx, mut directive_rx) = mpsc::unbounded_channel();
    shell_table.insert(shell_id.clone(), ShellHandle::new(registration.name.clone(), directive_tx));

    let _ = event_tx.send(IpcEvent::SessionConnected {
        shell_id: shell_id.clone(),
        name: registration.name.clone(),
    });
    let _ = event_tx.send(IpcEvent::SessionCountChanged(shell_table.len()));
    if relay_frame_tx
        .try_send(RelayFrame::ShellConnected {
            shell_id: shell_id.clone(),
            name: registration.name.clone(),
        })
        .is_err()
    {
        warn!("relay queue full, dropped shell_connected notice for {shell_id}");
    }

    let writer_shell_id = shell_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(directive) = directive_rx.recv().await {
            if let Err(e) = session.write_directive(&directive).await {
                debug!("shell {writer_shell_id} write error: {e}");
                break;
            }
        }
    });

    read_output_frames(&mut reader, &shell_id, &relay_frame_tx).await;

    shell_table.remove(&shell_id);
    writer.abort();

    let _ = event_tx.send(IpcEvent::SessionDisconnected { shell_id: shell_id.clone() });
    let _ = event_tx.send(IpcEvent::SessionCountChanged(shell_table.len()));
    if relay_frame_tx
        .try_send(RelayFrame::ShellDisconnected { shell_id: shell_id.clone() })
        .is_err()
    {
        warn!("relay queue full, dropped shell_disconnected notice for {shell_id}");
    }

    info!("shell {shell_id} disconnected");
}

async fn send_registered_reply(session: &mut Session, shell_id: &str) -> std::io::Result<()> {
    let reply = RegisteredReply { shell_id };
    let mut line = serde_json::to_string(&reply).expect("reply always serializes");
    line.push('\n');
    session.write_raw(line.as_bytes()).await
}

/// Read 4-byte-length-prefixed PTY output frames until EOF or error,
/// forwarding each payload to the relay. Never blocks the relay link: a full
/// queue drops the frame rather than stalling the read loop.
async fn read_output_frames<R>(reader: &mut R, shell_id: &str, relay_frame_tx: &mpsc::Sender<RelayFrame>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    loop {
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                debug!("shell {shell_id} read error: {e}");
            }
            break;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            debug!("shell {shell_id} payload read error: {e}");
            break;
        }

        match relay_frame_tx.try_send(RelayFrame::ShellOutput {
            shell_id: shell_id.to_string(),
            data: payload,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("relay queue full, dropping shell output frame for {shell_id}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("relay frame channel closed, stopping shell {shell_id} reader");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_event_debug_contains_shell_id() {
        let event = IpcEvent::SessionConnected { shell_id: "sh1".into(), name: "work".into() };
        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("sh1"));
        assert!(debug_str.contains("work"));
    }

    #[tokio::test]
    async fn read_output_frames_forwards_payload_and_stops_at_eof() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(b"AB\r\n");

        let mut cursor = std::io::Cursor::new(payload);
        let (tx, mut rx) = mpsc::channel(4);

        read_output_frames(&mut cursor, "sh1", &tx).await;

        match rx.try_recv().unwrap() {
            RelayFrame::ShellOutput { shell_id, data } => {
                assert_eq!(shell_id, "sh1");
                assert_eq!(data, b"AB\r\n");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
