//! Units of work handed from the IPC side to the relay client for delivery
//! upstream.

/// A message destined for the relay, originating from the IPC side.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// Raw PTY output from a shell, to be sent as a binary `(shell_id, payload)` frame.
    ShellOutput { shell_id: String, data: Vec<u8> },
    /// A shell-wrapper just registered.
    ShellConnected { shell_id: String, name: String },
    /// A shell-wrapper's connection closed.
    ShellDisconnected { shell_id: String },
}

/// Bound on the queue feeding the relay client from the IPC side.
///
/// The specification calls for a 64 KiB ring buffer per shell while the
/// relay link is down; a single shared bounded queue approximates that at
/// whole-agent granularity rather than per-shell (see DESIGN.md).
pub const RELAY_QUEUE_CAPACITY: usize = 256;
