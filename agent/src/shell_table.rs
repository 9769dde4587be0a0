//! Shared table of connected shell-wrapper processes, keyed by `shell_id`.
//!
//! The IPC accept loop inserts an entry when a shell-wrapper registers; the
//! relay client looks entries up by `shell_id` to dispatch inbound browser
//! input and resize requests. Tasks hold only a cloneable channel half, never
//! a reference into the table itself, so the IPC and relay sides never need
//! to share lifetimes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A directive delivered to a connected shell-wrapper.
#[derive(Debug, Clone)]
pub enum ShellDirective {
    /// Keystrokes to write into the shell's PTY.
    Input(Vec<u8>),
    /// A terminal window resize.
    Resize { cols: u16, rows: u16 },
}

/// A live entry in the table: the shell's display name plus a send-half
/// feeding its IPC write task.
#[derive(Clone)]
pub struct ShellHandle {
    pub name: String,
    directive_tx: mpsc::UnboundedSender<ShellDirective>,
}

impl ShellHandle {
    pub fn new(name: String, directive_tx: mpsc::UnboundedSender<ShellDirective>) -> Self {
        Self { name, directive_tx }
    }
}

#[derive(Clone, Default)]
pub struct ShellTable {
    inner: Arc<Mutex<HashMap<String, ShellHandle>>>,
}

impl ShellTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, shell_id: String, handle: ShellHandle) {
        self.inner.lock().expect("shell table poisoned").insert(shell_id, handle);
    }

    pub fn remove(&self, shell_id: &str) -> Option<ShellHandle> {
        self.inner.lock().expect("shell table poisoned").remove(shell_id)
    }

    /// Deliver a directive to the named shell. Returns `false` if the shell
    /// is unknown or its write task has gone away.
    pub fn dispatch(&self, shell_id: &str, directive: ShellDirective) -> bool {
        let handle = self.inner.lock().expect("shell table poisoned").get(shell_id).cloned();
        match handle {
            Some(handle) => handle.directive_tx.send(directive).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("shell table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_to_unknown_shell_returns_false() {
        let table = ShellTable::new();
        assert!(!table.dispatch("nope", ShellDirective::Input(vec![1, 2, 3])));
    }

    #[test]
    fn dispatch_delivers_to_registered_shell() {
        let table = ShellTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert("sh1".into(), ShellHandle::new("work".into(), tx));

        assert!(table.dispatch("sh1", ShellDirective::Resize { cols: 80, rows: 24 }));
        match rx.try_recv().unwrap() {
            ShellDirective::Resize { cols, rows } => {
                assert_eq!(cols, 80);
                assert_eq!(rows, 24);
            }
            other => panic!("unexpected directive: {other:?}"),
        }
    }

    #[test]
    fn remove_drops_entry() {
        let table = ShellTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        table.insert("sh1".into(), ShellHandle::new("work".into(), tx));
        assert_eq!(table.len(), 1);
        assert!(table.remove("sh1").is_some());
        assert_eq!(table.len(), 0);
        assert!(!table.dispatch("sh1", ShellDirective::Input(vec![])));
    }
}
