//! SSH-backed remote shell using russh.
//!
//! `connect` runs the whole setup — TCP connect, key exchange, auth, PTY
//! and shell requests — and hands back two small handles. A pump task owns
//! the russh channel afterwards: it translates `ChannelMsg`s into
//! [`ShellEvent`]s and applies write/resize/close commands, so the relay
//! side never touches russh types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ks_core::{KsError, KsResult};

use super::{ConnectParams, RemoteShellConnector, RemoteShellHandle, ShellChannel, ShellEvent};

/// Terminal type requested for the PTY.
const TERM: &str = "xterm-color";
/// Initial window size; the browser sends a resize right after connecting.
const INITIAL_COLS: u32 = 80;
const INITIAL_ROWS: u32 = 24;
/// Command backlog between the relay and the channel pump.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Opens SSH shells for connect requests.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl RemoteShellConnector for SshConnector {
    async fn connect(
        &self,
        params: ConnectParams,
        events: mpsc::Sender<ShellEvent>,
    ) -> KsResult<(Box<dyn RemoteShellHandle>, Box<dyn ShellChannel>)> {
        let config = Arc::new(Config::default());

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (params.host.as_str(), params.port), ClientHandler),
        )
        .await
        .map_err(|_| KsError::RemoteShell("connection timed out".into()))?
        .map_err(|e| {
            KsError::RemoteShell(format!(
                "connect to {}:{} failed: {e}",
                params.host, params.port
            ))
        })?;

        let authenticated = if let Some(password) = params.password.as_deref() {
            handle
                .authenticate_password(&params.username, password)
                .await
        } else if let Some(pem) = params.private_key.as_deref() {
            let key = russh_keys::decode_secret_key(pem, None)
                .map_err(|e| KsError::RemoteShell(format!("invalid private key: {e}")))?;
            handle
                .authenticate_publickey(&params.username, Arc::new(key))
                .await
        } else {
            handle.authenticate_none(&params.username).await
        }
        .map_err(|e| KsError::RemoteShell(format!("authentication error: {e}")))?;

        if !authenticated {
            return Err(KsError::RemoteShell("authentication rejected".into()));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| KsError::RemoteShell(format!("failed to open shell channel: {e}")))?;
        channel
            .request_pty(false, TERM, INITIAL_COLS, INITIAL_ROWS, 0, 0, &[])
            .await
            .map_err(|e| KsError::RemoteShell(format!("pty request failed: {e}")))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| KsError::RemoteShell(format!("shell request failed: {e}")))?;

        debug!(host = %params.host, port = params.port, username = %params.username, "shell channel open");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(pump_channel(channel, cmd_rx, events));

        Ok((
            Box::new(SshHandle {
                handle: Some(handle),
            }),
            Box::new(SshShellChannel { cmd_tx }),
        ))
    }
}

/// Client handler for russh. Host keys are accepted as presented: the
/// browser peer chose the host and performs no independent verification,
/// matching the trust model of a relay.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(fingerprint = %key.fingerprint(), "accepting server host key");
        Ok(true)
    }
}

enum ShellCommand {
    Write(String),
    Resize { rows: u16, cols: u16 },
    Close,
}

/// Shell channel facade over the pump's command queue. `try_send` keeps
/// these non-blocking; a full or closed queue surfaces as a channel error
/// that routes the session into teardown.
struct SshShellChannel {
    cmd_tx: mpsc::Sender<ShellCommand>,
}

impl ShellChannel for SshShellChannel {
    fn write(&self, text: &str) -> KsResult<()> {
        self.cmd_tx
            .try_send(ShellCommand::Write(text.to_string()))
            .map_err(|e| KsError::Channel(e.to_string()))
    }

    fn resize(&self, rows: u16, cols: u16) -> KsResult<()> {
        self.cmd_tx
            .try_send(ShellCommand::Resize { rows, cols })
            .map_err(|e| KsError::Channel(e.to_string()))
    }

    fn close(&mut self) -> KsResult<()> {
        // The pump may already be gone if the remote closed first.
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
        Ok(())
    }
}

struct SshHandle {
    handle: Option<Handle<ClientHandler>>,
}

impl RemoteShellHandle for SshHandle {
    fn close(&mut self) -> KsResult<()> {
        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                if let Err(e) = handle
                    .disconnect(Disconnect::ByApplication, "session closed", "en")
                    .await
                {
                    debug!(error = %e, "ssh disconnect failed");
                }
            });
        }
        Ok(())
    }
}

enum PumpStep {
    Channel(Option<ChannelMsg>),
    Command(Option<ShellCommand>),
}

/// Own the russh channel: forward its messages as shell events and apply
/// relay commands. Exits when either side goes away; the event receiver
/// being dropped (session already torn down) also ends the pump.
async fn pump_channel(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    events: mpsc::Sender<ShellEvent>,
) {
    loop {
        let step = tokio::select! {
            msg = channel.wait() => PumpStep::Channel(msg),
            cmd = cmd_rx.recv() => PumpStep::Command(cmd),
        };

        match step {
            PumpStep::Channel(Some(ChannelMsg::Data { data })) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if events.send(ShellEvent::Data(text)).await.is_err() {
                    break;
                }
            }
            PumpStep::Channel(Some(ChannelMsg::ExtendedData { data, .. })) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if events.send(ShellEvent::StderrData(text)).await.is_err() {
                    break;
                }
            }
            PumpStep::Channel(Some(ChannelMsg::ExitStatus { exit_status })) => {
                debug!(exit_status, "shell exited");
            }
            PumpStep::Channel(Some(ChannelMsg::Close)) | PumpStep::Channel(None) => {
                let _ = events.send(ShellEvent::Closed).await;
                break;
            }
            PumpStep::Channel(Some(_)) => {}
            PumpStep::Command(Some(ShellCommand::Write(text))) => {
                if let Err(e) = channel.data(text.as_bytes()).await {
                    warn!(error = %e, "shell write failed");
                    let _ = events.send(ShellEvent::Error(e.to_string())).await;
                    break;
                }
            }
            PumpStep::Command(Some(ShellCommand::Resize { rows, cols })) => {
                if let Err(e) = channel
                    .window_change(cols as u32, rows as u32, 0, 0)
                    .await
                {
                    warn!(error = %e, "window change failed");
                }
            }
            PumpStep::Command(Some(ShellCommand::Close)) | PumpStep::Command(None) => {
                let _ = channel.eof().await;
                break;
            }
        }
    }
}
