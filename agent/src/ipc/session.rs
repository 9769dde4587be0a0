//! Per-connection state for a shell-wrapper attached over the IPC socket.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;

use crate::shell_table::ShellDirective;

/// First-line registration frame sent by a shell-wrapper on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRegistration {
    pub shell: String,
    pub pid: u32,
    pub tty: String,
    pub name: String,
}

/// Reply sent back to the shell-wrapper once registration is accepted.
#[derive(Debug, Serialize)]
pub struct RegisteredReply<'a> {
    pub shell_id: &'a str,
}

/// Wire shape of an outbound directive, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundDirective {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// A connected shell-wrapper's write half plus its registration metadata.
pub struct Session {
    pub shell_id: String,
    pub registration: ShellRegistration,
    write_half: OwnedWriteHalf,
}

impl Session {
    pub fn new(shell_id: String, registration: ShellRegistration, write_half: OwnedWriteHalf) -> Self {
        Self { shell_id, registration, write_half }
    }

    /// Serialize and write one directive, terminated by `\n`.
    pub async fn write_directive(&mut self, directive: &ShellDirective) -> std::io::Result<()> {
        let wire = match directive {
            ShellDirective::Input(data) => OutboundDirective::Input { data: STANDARD.encode(data) },
            ShellDirective::Resize { cols, rows } => OutboundDirective::Resize { cols: *cols, rows: *rows },
        };
        let mut line = serde_json::to_string(&wire).expect("directive always serializes");
        line.push('\n');
        self.write_half.write_all(line.as_bytes()).await
    }

    /// Write pre-formatted bytes directly (used for the one-off registration reply).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_registration_deserializes_with_tty() {
        let json = r#"{"shell":"zsh","pid":999,"tty":"/dev/ttys001","name":"work"}"#;
        let reg: ShellRegistration = serde_json::from_str(json).unwrap();
        assert_eq!(reg.shell, "zsh");
        assert_eq!(reg.pid, 999);
        assert_eq!(reg.tty, "/dev/ttys001");
        assert_eq!(reg.name, "work");
    }

    #[test]
    fn registered_reply_serializes_shell_id() {
        let reply = RegisteredReply { shell_id: "sh1" };
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"shell_id":"sh1"}"#);
    }

    #[test]
    fn outbound_input_directive_base64_encodes_data() {
        let encoded = STANDARD.encode(b"AB\r\n");
        let wire = OutboundDirective::Input { data: encoded.clone() };
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, format!(r#"{{"type":"input","data":"{encoded}"}}"#));
    }

    #[test]
    fn outbound_resize_directive_serializes() {
        let wire = OutboundDirective::Resize { cols: 80, rows: 24 };
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":80,"rows":24}"#);
    }
}
