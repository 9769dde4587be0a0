//! Subprocess lifecycle for the co-located relay and tunnel processes.
//!
//! The supervisor is deliberately dumb: it starts both children, captures
//! their output into a log file, scrapes the tunnel's stdout for its public
//! URL, and tears both down on shutdown. Everything else about what those
//! processes do is out of the core contract.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default command line for the co-located relay-server process.
pub const DEFAULT_RELAY_COMMAND: &str = "relay";
/// Default command line for the tunnel process that publishes the relay's
/// public URL (a cloudflared quick tunnel, by default).
pub const DEFAULT_TUNNEL_COMMAND: &str = "cloudflared tunnel --url http://localhost:3000";
/// Default combined stdout/stderr log file for both children.
pub const DEFAULT_LOG_PATH: &str = "/tmp/terminal-remote-supervisor.log";

/// Observable state the supervisor exposes to the menu-bar UI.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStatus {
    pub tunnel_url: Option<String>,
}

/// Owns the relay and tunnel child processes.
pub struct Supervisor {
    relay: Option<Child>,
    tunnel: Option<Child>,
}

impl Supervisor {
    /// Spawn the relay binary and the tunnel binary, piping both children's
    /// stdout/stderr into `log_path`. Returns once both are spawned; the
    /// tunnel's stdout is scanned in the background for its public URL.
    pub async fn spawn(
        relay_command: &str,
        tunnel_command: &str,
        log_path: &str,
        status_tx: tokio::sync::mpsc::UnboundedSender<SupervisorStatus>,
    ) -> std::io::Result<Self> {
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        let mut relay_child = spawn_piped(relay_command)?;
        pipe_to_log(&mut relay_child, "relay", log_path).await?;

        let mut tunnel_child = spawn_piped(tunnel_command)?;
        let tunnel_stdout = tunnel_child.stdout.take();
        pipe_to_log(&mut tunnel_child, "tunnel", log_path).await?;

        log_file
            .write_all(format!("[supervisor] spawned relay={relay_command} tunnel={tunnel_command}\n").as_bytes())
            .await?;

        if let Some(stdout) = tunnel_stdout {
            tokio::spawn(scan_for_tunnel_url(stdout, status_tx));
        }

        Ok(Self {
            relay: Some(relay_child),
            tunnel: Some(tunnel_child),
        })
    }

    /// Terminate both children: SIGTERM, then SIGKILL after a grace period
    /// if either hasn't exited.
    pub async fn shutdown(&mut self) {
        for (name, child) in [("relay", &mut self.relay), ("tunnel", &mut self.tunnel)] {
            if let Some(child) = child.take() {
                terminate_child(name, child).await;
            }
        }
    }
}

fn spawn_piped(command: &str) -> std::io::Result<Child> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    Command::new(program)
        .args(parts)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Redirect a child's stdout/stderr into the shared log file, tagging each
/// line with the child's name.
async fn pipe_to_log(child: &mut Child, name: &'static str, log_path: &str) -> std::io::Result<()> {
    let log_path = log_path.to_string();
    if let Some(stdout) = child.stdout.take() {
        let path = log_path.clone();
        tokio::spawn(async move {
            forward_lines(stdout, name, &path).await;
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            forward_lines(stderr, name, &log_path).await;
        });
    }
    Ok(())
}

async fn forward_lines<R: tokio::io::AsyncRead + Unpin>(reader: R, name: &'static str, log_path: &str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Ok(mut log_file) = tokio::fs::OpenOptions::new().create(true).append(true).open(log_path).await {
                    let _ = log_file.write_all(format!("[{name}] {line}\n").as_bytes()).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("{name} log forwarding stopped: {e}");
                break;
            }
        }
    }
}

/// Watch the tunnel's stdout for a line containing a public URL and surface
/// it via `status_tx`.
async fn scan_for_tunnel_url<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    status_tx: tokio::sync::mpsc::UnboundedSender<SupervisorStatus>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(start) = line.find("https://") {
            let url = line[start..]
                .split_whitespace()
                .next()
                .unwrap_or(&line[start..])
                .to_string();
            info!("tunnel URL detected: {url}");
            let _ = status_tx.send(SupervisorStatus { tunnel_url: Some(url) });
        }
    }
}

async fn terminate_child(name: &str, mut child: Child) {
    let pid = child.id();
    info!("stopping {name} (pid={pid:?})");

    if let Some(pid) = pid {
        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!("failed to send SIGTERM to {name}: {e}");
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(_) => info!("{name} exited cleanly"),
        Err(_) => {
            warn!("{name} did not exit within grace period, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_piped_rejects_empty_command() {
        let result = spawn_piped("");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn scan_for_tunnel_url_extracts_first_url() {
        let input = b"starting up\nyour tunnel is ready at https://abc123.example.dev now\nmore noise\n".to_vec();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scan_for_tunnel_url(std::io::Cursor::new(input), tx).await;

        let status = rx.recv().await.unwrap();
        assert_eq!(status.tunnel_url.as_deref(), Some("https://abc123.example.dev"));
    }
}
