//! Session registry: session-code allocation, lookup, expiry, and
//! agent/browser membership.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use terminal_remote_protocol::session_code::{self, DEFAULT_LENGTH, WIDENED_LENGTH};
use terminal_remote_protocol::ErrorKind;

/// Default unpaired-session expiry window.
pub const UNPAIRED_EXPIRY: Duration = Duration::from_secs(5 * 60);
/// How long a destroyed session's code is withheld from reuse.
pub const CODE_RELEASE_GRACE: Duration = Duration::from_secs(10);
/// Collision retries at the default length before widening to 7 chars.
const ALLOCATE_RETRY_BUDGET: usize = 32;

/// Outbound frames queued for an agent or browser write-half.
pub type OutboundTx = mpsc::Sender<OutboundFrame>;
pub type OutboundRx = mpsc::Receiver<OutboundFrame>;

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Bound on the agent-bound (browser -> agent) outbound queue, smaller
/// since it only ever carries keystrokes/resizes.
pub const AGENT_QUEUE_CAPACITY: usize = 256;
/// Bound on the browser-bound (agent -> browser) outbound queue.
pub const BROWSER_QUEUE_CAPACITY: usize = 1024;

/// A joined browser's write-half plus the channel used to force it closed
/// with a specific error (`SLOW_CONSUMER`, `UPSTREAM_GONE`) from outside its
/// own connection task.
#[derive(Clone)]
pub struct BrowserHandle {
    pub data_tx: OutboundTx,
    pub kick_tx: mpsc::Sender<ErrorKind>,
}

pub struct Session {
    pub code: String,
    pub session_id: String,
    pub agent_tx: OutboundTx,
    pub browsers: DashMap<String, BrowserHandle>,
    /// Currently-attached shells (shell `session_id` -> `name`), so a
    /// newly-joining browser can be replayed a `session_connected` per
    /// shell that already exists.
    pub shells: DashMap<String, String>,
    /// Milliseconds since epoch; meaningful only while `browsers` is empty.
    expires_at_ms: AtomicI64,
    pub created_at_ms: i64,
}

impl Session {
    /// `expires_at` in epoch milliseconds, or `None` once paired.
    pub fn expires_at(&self) -> Option<i64> {
        let v = self.expires_at_ms.load(Ordering::Relaxed);
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    fn clear_expiry(&self) {
        self.expires_at_ms.store(-1, Ordering::Relaxed);
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        match self.expires_at() {
            Some(deadline) => self.browsers.is_empty() && deadline < now_ms,
            None => false,
        }
    }
}

pub enum JoinOutcome {
    Joined { session_id: String },
    InvalidCode,
    ExpiredCode,
}

/// Process-wide session registry, safe to share behind an `Arc`/`Clone`.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, Session>,
    /// Codes freed by `drop_agent`, held back from reallocation until their
    /// grace window elapses (Invariant 5).
    released: DashMap<String, i64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                released: DashMap::new(),
            }),
        }
    }

    /// Allocate a fresh session code and register the agent's write-half.
    /// Retries on collision; widens to a 7-character code if the retry
    /// budget at the default length is exhausted.
    pub fn allocate(&self, agent_tx: OutboundTx) -> (String, i64) {
        let now = now_ms();
        let code = self.next_free_code();

        let session = Session {
            code: code.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_tx,
            browsers: DashMap::new(),
            shells: DashMap::new(),
            expires_at_ms: AtomicI64::new(now + UNPAIRED_EXPIRY.as_millis() as i64),
            created_at_ms: now,
        };
        let expires_at = session.expires_at().expect("freshly allocated session has a deadline");
        self.inner.sessions.insert(code.clone(), session);
        (code, expires_at)
    }

    fn next_free_code(&self) -> String {
        for _ in 0..ALLOCATE_RETRY_BUDGET {
            let candidate = session_code::generate(DEFAULT_LENGTH);
            if self.is_free(&candidate) {
                return candidate;
            }
            tracing::debug!(code = %candidate, "session code collision, regenerating");
        }

        tracing::warn!("exhausted 6-char code retry budget, widening to 7 chars");
        loop {
            let candidate = session_code::generate(WIDENED_LENGTH);
            if self.is_free(&candidate) {
                return candidate;
            }
        }
    }

    fn is_free(&self, code: &str) -> bool {
        if self.inner.sessions.contains_key(code) {
            return false;
        }
        match self.inner.released.get(code) {
            Some(released_at) => now_ms() - *released_at >= CODE_RELEASE_GRACE.as_millis() as i64,
            None => true,
        }
    }

    /// Join an existing session as a browser. Lifts the unpaired-expiry
    /// deadline on first join; subsequent browsers are simply added (policy
    /// permits multiples). A code whose unpaired deadline has already
    /// passed is reported as expired rather than silently revived.
    pub fn join(
        &self,
        code: &str,
        browser_id: String,
        browser_tx: OutboundTx,
        kick_tx: mpsc::Sender<ErrorKind>,
    ) -> JoinOutcome {
        let Some(session) = self.inner.sessions.get(code) else {
            return JoinOutcome::InvalidCode;
        };
        if session.is_expired(now_ms()) {
            return JoinOutcome::ExpiredCode;
        }
        session.clear_expiry();
        session.browsers.insert(browser_id, BrowserHandle { data_tx: browser_tx, kick_tx });
        JoinOutcome::Joined { session_id: session.session_id.clone() }
    }

    pub fn drop_browser(&self, code: &str, browser_id: &str) {
        if let Some(session) = self.inner.sessions.get(code) {
            session.browsers.remove(browser_id);
        }
    }

    /// Destroy a session after the agent link closes. Returns each
    /// browser's kick handle so the caller can force it closed with
    /// `UPSTREAM_GONE` (Invariant 2).
    pub fn drop_agent(&self, code: &str) -> Vec<mpsc::Sender<ErrorKind>> {
        let Some((_, session)) = self.inner.sessions.remove(code) else {
            return Vec::new();
        };
        self.inner.released.insert(code.to_string(), now_ms());
        session.browsers.into_iter().map(|(_, handle)| handle.kick_tx).collect()
    }

    /// Record that a shell appeared, so it can be replayed to browsers that
    /// join later.
    pub fn record_shell_connected(&self, code: &str, session_id: String, name: String) {
        if let Some(session) = self.inner.sessions.get(code) {
            session.shells.insert(session_id, name);
        }
    }

    pub fn record_shell_disconnected(&self, code: &str, session_id: &str) {
        if let Some(session) = self.inner.sessions.get(code) {
            session.shells.remove(session_id);
        }
    }

    /// Snapshot of currently-attached shells, used to replay
    /// `session_connected` to a browser that just joined.
    pub fn snapshot_shells(&self, code: &str) -> Vec<(String, String)> {
        match self.inner.sessions.get(code) {
            Some(session) => session.shells.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            None => Vec::new(),
        }
    }

    pub fn validate(&self, code: &str) -> bool {
        self.inner.sessions.contains_key(code)
    }

    pub fn agent_sender(&self, code: &str) -> Option<OutboundTx> {
        self.inner.sessions.get(code).map(|s| s.agent_tx.clone())
    }

    /// Fan out a frame to every browser attached to `code`. `try_send` is
    /// used deliberately: a browser whose queue is full is kicked with
    /// `SLOW_CONSUMER` over its own channel (which makes its writer task
    /// emit the error frame and close) rather than blocking fan-out to the
    /// others. Slow browser ids are also returned so the caller can drop
    /// them from the session immediately.
    pub fn fan_out_to_browsers(&self, code: &str, frame: OutboundFrame) -> Vec<String> {
        let mut slow = Vec::new();
        if let Some(session) = self.inner.sessions.get(code) {
            for entry in session.browsers.iter() {
                let handle = entry.value();
                if handle.data_tx.try_send(frame.clone()).is_err() {
                    let _ = handle.kick_tx.try_send(ErrorKind::SlowConsumer);
                    slow.push(entry.key().clone());
                }
            }
        }
        slow
    }

    pub fn send_to_agent(&self, code: &str, frame: OutboundFrame) {
        if let Some(session) = self.inner.sessions.get(code) {
            let _ = session.agent_tx.try_send(frame);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Periodic sweep: remove unpaired sessions past their deadline.
    /// Returns the codes removed, for logging.
    pub fn reap(&self) -> Vec<String> {
        let now = now_ms();
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for code in &expired {
            self.inner.sessions.remove(code);
            self.inner.released.insert(code.clone(), now);
        }

        self.inner.released.retain(|_, released_at| {
            now - *released_at < CODE_RELEASE_GRACE.as_millis() as i64 * 10
        });

        expired
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (OutboundTx, OutboundRx) {
        mpsc::channel(AGENT_QUEUE_CAPACITY)
    }

    fn kick_sender() -> (mpsc::Sender<ErrorKind>, mpsc::Receiver<ErrorKind>) {
        mpsc::channel(1)
    }

    #[test]
    fn allocate_returns_six_char_code_with_future_deadline() {
        let registry = Registry::new();
        let (tx, _rx) = sender();
        let (code, expires_at) = registry.allocate(tx);
        assert_eq!(code.len(), 6);
        assert!(expires_at > now_ms());
    }

    #[test]
    fn at_most_one_session_per_code() {
        let registry = Registry::new();
        let (tx, _rx) = sender();
        let (code, _) = registry.allocate(tx);
        assert!(registry.validate(&code));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn join_unknown_code_is_invalid() {
        let registry = Registry::new();
        let (tx, _rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        matches!(registry.join("ZZZZZZ", "b1".into(), tx, kick_tx), JoinOutcome::InvalidCode);
    }

    #[test]
    fn join_lifts_expiry_and_returns_session_id() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);

        let (browser_tx, _browser_rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        let outcome = registry.join(&code, "b1".into(), browser_tx, kick_tx);
        let JoinOutcome::Joined { session_id } = outcome else {
            panic!("expected Joined");
        };
        assert!(!session_id.is_empty());

        // Paired session no longer carries an expiry deadline.
        let session = registry.inner.sessions.get(&code).unwrap();
        assert!(session.expires_at().is_none());
    }

    #[test]
    fn join_after_unpaired_deadline_is_expired_not_revived() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);

        {
            let session = registry.inner.sessions.get(&code).unwrap();
            session.expires_at_ms.store(now_ms() - 1, Ordering::Relaxed);
        }

        let (browser_tx, _browser_rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        let outcome = registry.join(&code, "b1".into(), browser_tx, kick_tx);
        assert!(matches!(outcome, JoinOutcome::ExpiredCode));

        // Rejecting the join must not have revived the session.
        let session = registry.inner.sessions.get(&code).unwrap();
        assert!(session.expires_at().is_some());
        assert!(session.browsers.is_empty());
    }

    #[test]
    fn drop_browser_does_not_reinstate_expiry() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);
        let (browser_tx, _browser_rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        registry.join(&code, "b1".into(), browser_tx, kick_tx);

        registry.drop_browser(&code, "b1");

        let session = registry.inner.sessions.get(&code).unwrap();
        assert!(session.expires_at().is_none(), "paired session must stay alive with no browsers");
    }

    #[test]
    fn drop_agent_destroys_session_and_returns_browser_kick_handles() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);
        let (browser_tx, _browser_rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        registry.join(&code, "b1".into(), browser_tx, kick_tx);

        let handles = registry.drop_agent(&code);
        assert_eq!(handles.len(), 1);
        assert!(!registry.validate(&code));
    }

    #[test]
    fn fan_out_kicks_slow_consumer_and_reports_its_id() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);

        // A single-slot queue that's never drained looks "full" after one send.
        let (browser_tx, _browser_rx) = mpsc::channel(1);
        let (kick_tx, mut kick_rx) = kick_sender();
        registry.join(&code, "b1".into(), browser_tx, kick_tx);

        registry.fan_out_to_browsers(&code, OutboundFrame::Binary(vec![1]));
        let slow = registry.fan_out_to_browsers(&code, OutboundFrame::Binary(vec![2]));

        assert_eq!(slow, vec!["b1".to_string()]);
        assert_eq!(kick_rx.try_recv().unwrap(), ErrorKind::SlowConsumer);
    }

    #[test]
    fn released_code_is_not_reallocated_within_grace_window() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);
        registry.drop_agent(&code);

        assert!(!registry.is_free(&code), "code must stay withheld inside the grace window");
    }

    #[test]
    fn reap_removes_only_expired_unpaired_sessions() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);

        // Force expiry into the past.
        {
            let session = registry.inner.sessions.get(&code).unwrap();
            session.expires_at_ms.store(now_ms() - 1, Ordering::Relaxed);
        }

        let reaped = registry.reap();
        assert_eq!(reaped, vec![code.clone()]);
        assert!(!registry.validate(&code));
    }

    #[test]
    fn snapshot_shells_reflects_connect_and_disconnect() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);

        registry.record_shell_connected(&code, "sh1".into(), "work".into());
        assert_eq!(registry.snapshot_shells(&code), vec![("sh1".to_string(), "work".to_string())]);

        registry.record_shell_disconnected(&code, "sh1");
        assert!(registry.snapshot_shells(&code).is_empty());
    }

    #[test]
    fn reap_leaves_paired_sessions_alone() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = sender();
        let (code, _) = registry.allocate(agent_tx);
        let (browser_tx, _browser_rx) = sender();
        let (kick_tx, _kick_rx) = kick_sender();
        registry.join(&code, "b1".into(), browser_tx, kick_tx);

        let reaped = registry.reap();
        assert!(reaped.is_empty());
        assert!(registry.validate(&code));
    }
}
