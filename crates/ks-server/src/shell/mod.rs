//! Remote-shell seam.
//!
//! The relay never speaks the SSH protocol itself; it drives these traits.
//! The production implementation lives in [`ssh`]; tests substitute fakes
//! that record calls.

pub mod ssh;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ks_core::KsResult;

/// Parameters for one remote-shell attempt, taken from a connect request.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

/// Events produced by a remote shell after (or instead of) becoming ready.
///
/// `Connected`/`ConnectFailed` are emitted by the relay's connect wrapper;
/// the rest stream from the channel pump for the life of the shell.
pub enum ShellEvent {
    Connected {
        remote: Box<dyn RemoteShellHandle>,
        shell: Box<dyn ShellChannel>,
    },
    ConnectFailed(String),
    Data(String),
    StderrData(String),
    Error(String),
    Closed,
}

/// The open shell byte-stream channel. Operations are non-blocking:
/// failures mean the channel is gone, which the caller treats as a
/// teardown trigger rather than an error to retry.
pub trait ShellChannel: Send + Sync {
    fn write(&self, text: &str) -> KsResult<()>;
    fn resize(&self, rows: u16, cols: u16) -> KsResult<()>;
    /// Request channel close. Idempotent; tolerant of an already-gone peer.
    fn close(&mut self) -> KsResult<()>;
}

/// The authenticated remote-shell connection owning the channel.
pub trait RemoteShellHandle: Send + Sync {
    /// Disconnect from the remote host. Idempotent.
    fn close(&mut self) -> KsResult<()>;
}

/// Opens remote shells. Resolving `Ok` means the connection is ready and
/// the shell channel is open; from then on events arrive on `events`.
#[async_trait]
pub trait RemoteShellConnector: Send + Sync {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::Sender<ShellEvent>,
    ) -> KsResult<(Box<dyn RemoteShellHandle>, Box<dyn ShellChannel>)>;
}
