//! Environment-derived configuration for the agent process.

/// WebSocket endpoint of the relay server.
pub fn relay_url() -> String {
    std::env::var("RELAY_URL").unwrap_or_else(|_| "ws://localhost:3000/ws".to_string())
}

/// Local stream-socket path the IPC server binds to.
pub fn ipc_path() -> String {
    std::env::var("IPC_PATH").unwrap_or_else(|_| "/tmp/terminal-remote.sock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_defaults_when_unset() {
        std::env::remove_var("RELAY_URL");
        assert_eq!(relay_url(), "ws://localhost:3000/ws");
    }

    #[test]
    fn ipc_path_defaults_when_unset() {
        std::env::remove_var("IPC_PATH");
        assert_eq!(ipc_path(), "/tmp/terminal-remote.sock");
    }
}
