//! Process-wide session registry.
//!
//! Maps session ids to live sessions and tracks aggregate and per-source
//! counts. The registry is created once at service start and passed as an
//! `Arc` to every component that needs it — never accessed as a global.
//! Entries are created on transport connect and removed only by the
//! cleanup coordinator.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use ks_core::ServerMessage;

use super::buffer::OutputBuffer;
use crate::shell::{RemoteShellHandle, ShellChannel};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, no remote-shell attempt yet.
    Idle,
    /// Remote-shell connect in flight.
    Connecting,
    /// Shell channel open, data may flow.
    Active,
    /// Cleanup in progress; all further events are ignored.
    Closing,
    /// Terminal; the registry entry is gone.
    Closed,
}

/// One end-to-end binding between a browser peer and a remote shell.
pub struct Session {
    /// Registry key, assigned at transport-connect time.
    pub id: String,
    /// Peer address, for per-source counting.
    pub source: String,
    pub created_at: Instant,
    /// Updated on every inbound or outbound data event.
    pub last_activity: Instant,
    pub state: SessionState,
    /// Remote-shell connection, present once the shell is ready.
    pub remote: Option<Box<dyn RemoteShellHandle>>,
    /// Open shell channel, present once the shell is ready.
    pub shell: Option<Box<dyn ShellChannel>>,
    pub buffer: OutputBuffer,
    /// Out-of-band notices to this session's connection loop (reaper
    /// timeouts, shutdown). Dropping the entry closes the loop.
    pub peer_tx: mpsc::Sender<ServerMessage>,
}

/// Handles extracted from a session by [`SessionRegistry::claim_for_cleanup`].
pub struct ClaimedSession {
    pub remote: Option<Box<dyn RemoteShellHandle>>,
    pub shell: Option<Box<dyn ShellChannel>>,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    count_by_source: HashMap<String, usize>,
    total_active: usize,
}

/// Registry of live sessions, shared by the relay, the reaper, the memory
/// governor, and the cleanup coordinator.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    buffer_limit: usize,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions buffer at most
    /// `buffer_limit` bytes of output each.
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                count_by_source: HashMap::new(),
                total_active: 0,
            }),
            buffer_limit,
        }
    }

    /// Register a new idle session for a transport peer and return its id.
    pub async fn create(&self, source: &str, peer_tx: mpsc::Sender<ServerMessage>) -> String {
        let id = generate_session_id();
        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            source: source.to_string(),
            created_at: now,
            last_activity: now,
            state: SessionState::Idle,
            remote: None,
            shell: None,
            buffer: OutputBuffer::new(self.buffer_limit),
            peer_tx,
        };

        let mut inner = self.inner.write().await;
        inner.sessions.insert(id.clone(), session);
        inner.total_active += 1;
        *inner.count_by_source.entry(source.to_string()).or_insert(0) += 1;
        info!(session_id = %id, remote = %source, active = inner.total_active, "session created");
        id
    }

    /// Access a session immutably via a callback. `None` if the id is gone.
    pub async fn with_session<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let inner = self.inner.read().await;
        inner.sessions.get(id).map(f)
    }

    /// Access a session mutably via a callback. `None` if the id is gone.
    pub async fn with_session_mut<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut inner = self.inner.write().await;
        inner.sessions.get_mut(id).map(f)
    }

    /// Install the remote-shell handles on a connecting session and mark it
    /// active. Returns the handles unconsumed if the session is gone or no
    /// longer connecting, so the caller can close them.
    #[allow(clippy::type_complexity)]
    pub async fn install_shell(
        &self,
        id: &str,
        remote: Box<dyn RemoteShellHandle>,
        shell: Box<dyn ShellChannel>,
    ) -> Result<(), (Box<dyn RemoteShellHandle>, Box<dyn ShellChannel>)> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(id) {
            Some(session) if session.state == SessionState::Connecting => {
                session.remote = Some(remote);
                session.shell = Some(shell);
                session.state = SessionState::Active;
                session.last_activity = Instant::now();
                Ok(())
            }
            _ => Err((remote, shell)),
        }
    }

    /// Claim a session for teardown: flip it to `Closing`, extract the
    /// owned handles, and release the output buffer. Returns `None` when
    /// the entry is missing or teardown has already been claimed — this is
    /// what makes cleanup idempotent under overlapping triggers.
    pub async fn claim_for_cleanup(&self, id: &str) -> Option<ClaimedSession> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(id)?;
        if matches!(session.state, SessionState::Closing | SessionState::Closed) {
            return None;
        }
        session.state = SessionState::Closing;
        let claimed = ClaimedSession {
            remote: session.remote.take(),
            shell: session.shell.take(),
        };
        session.buffer.clear();
        Some(claimed)
    }

    /// Remove a session entry and decrement the counters, floored at zero.
    /// A no-op on unknown ids, which keeps cleanup idempotent.
    pub async fn remove(&self, id: &str) {
        let mut inner = self.inner.write().await;
        let Some(mut session) = inner.sessions.remove(id) else {
            return;
        };
        session.state = SessionState::Closed;
        inner.total_active = inner.total_active.saturating_sub(1);
        match inner.count_by_source.get_mut(&session.source) {
            Some(count) if *count <= 1 => {
                inner.count_by_source.remove(&session.source);
            }
            Some(count) => *count -= 1,
            None => {}
        }
        debug!(session_id = %id, active = inner.total_active, "session removed");
    }

    /// Sessions idle longer than `idle_for`, with their notice senders.
    /// Sessions already in teardown are skipped.
    pub async fn stale_sessions(
        &self,
        idle_for: std::time::Duration,
    ) -> Vec<(String, mpsc::Sender<ServerMessage>)> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|s| {
                !matches!(s.state, SessionState::Closing | SessionState::Closed)
                    && now.duration_since(s.last_activity) > idle_for
            })
            .map(|s| (s.id.clone(), s.peer_tx.clone()))
            .collect()
    }

    /// All live sessions with their notice senders, for the shutdown sweep.
    pub async fn all_sessions(&self) -> Vec<(String, mpsc::Sender<ServerMessage>)> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .map(|s| (s.id.clone(), s.peer_tx.clone()))
            .collect()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.inner.read().await.total_active
    }

    /// Number of live sessions for one source address.
    pub async fn count_for_source(&self, source: &str) -> usize {
        let inner = self.inner.read().await;
        inner.count_by_source.get(source).copied().unwrap_or(0)
    }

    /// Shrink the backing maps. Called by the memory governor as an
    /// opportunistic reclamation hint; never load-bearing.
    pub async fn compact(&self) {
        let mut inner = self.inner.write().await;
        inner.sessions.shrink_to_fit();
        inner.count_by_source.shrink_to_fit();
    }

    /// Test hook: age a session's activity timestamp backwards.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &str, by: std::time::Duration) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            session.last_activity -= by;
        }
    }
}

/// Generate a random session id (16 bytes, hex-encoded).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
