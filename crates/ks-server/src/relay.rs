//! Per-connection relay loop.
//!
//! One task per browser peer drives a `select!` over three sources: the
//! transport, the shell event stream, and the session's notice channel.
//! Every session mutation happens through the registry inside one handler
//! invocation, and every handler re-checks the session's state first —
//! cleanup may have been claimed by another path (reaper, shutdown)
//! between two events. The loop exits when its registry entry disappears:
//! removing the entry drops the notice sender, which closes `peer_rx`.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ks_core::{ClientMessage, ServerMessage};

use crate::session::cleanup::cleanup;
use crate::session::registry::{SessionRegistry, SessionState};
use crate::shell::{ConnectParams, RemoteShellConnector, ShellEvent};
use crate::transport::ClientTransport;

/// Backlog for out-of-band notices (reaper timeouts, shutdown notices).
const NOTICE_CHANNEL_CAPACITY: usize = 64;
/// Backlog for shell output events before backpressure on the pump.
const SHELL_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resize dimensions outside this range are ignored.
const MAX_TERMINAL_DIM: u16 = 999;

/// Wires transport and remote-shell events to the session state machine.
#[derive(Clone)]
pub struct RelayService {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn RemoteShellConnector>,
    /// Inbound text payloads above this many bytes are dropped whole.
    input_max_bytes: usize,
}

enum ConnectVerdict {
    Proceed,
    AlreadyConnected,
    Invalid,
    Ignore,
}

impl RelayService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn RemoteShellConnector>,
        input_max_bytes: usize,
    ) -> Self {
        Self {
            registry,
            connector,
            input_max_bytes,
        }
    }

    /// Run one session to completion. Registers the session, relays in both
    /// directions, and guarantees cleanup ran by the time this returns —
    /// regardless of which side ended the session.
    pub async fn run_session<T: ClientTransport>(&self, mut transport: T, source: String) {
        let (peer_tx, mut peer_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        let (shell_tx, mut shell_rx) = mpsc::channel(SHELL_EVENT_CHANNEL_CAPACITY);

        let id = self.registry.create(&source, peer_tx).await;
        info!(session_id = %id, remote = %source, "client connected");

        loop {
            let flow = tokio::select! {
                res = transport.recv() => match res {
                    Ok(Some(msg)) => {
                        self.handle_client_message(&id, msg, &mut transport, &shell_tx)
                            .await
                    }
                    Ok(None) => {
                        debug!(session_id = %id, "transport disconnected");
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "transport error");
                        ControlFlow::Break(())
                    }
                },
                Some(ev) = shell_rx.recv() => {
                    self.handle_shell_event(&id, ev, &mut transport).await
                }
                notice = peer_rx.recv() => match notice {
                    Some(msg) => {
                        let _ = transport.send(&msg).await;
                        ControlFlow::Continue(())
                    }
                    None => {
                        // Registry entry removed by another teardown path.
                        debug!(session_id = %id, "session closed externally");
                        ControlFlow::Break(())
                    }
                },
            };
            if flow.is_break() {
                break;
            }
        }

        // Idempotent: a no-op when a handler or another trigger already
        // released the session.
        cleanup(&self.registry, &id).await;
        let _ = transport.close().await;
        let active = self.registry.count().await;
        info!(session_id = %id, active, "client disconnected");
    }

    async fn handle_client_message<T: ClientTransport>(
        &self,
        id: &str,
        msg: ClientMessage,
        transport: &mut T,
        shell_tx: &mpsc::Sender<ShellEvent>,
    ) -> ControlFlow<()> {
        match msg {
            ClientMessage::Connect {
                host,
                port,
                username,
                password,
                private_key,
            } => {
                let verdict = self
                    .registry
                    .with_session_mut(id, |s| {
                        if matches!(s.state, SessionState::Closing | SessionState::Closed) {
                            return ConnectVerdict::Ignore;
                        }
                        if s.state != SessionState::Idle || s.remote.is_some() {
                            return ConnectVerdict::AlreadyConnected;
                        }
                        if host.trim().is_empty() || username.trim().is_empty() {
                            return ConnectVerdict::Invalid;
                        }
                        s.state = SessionState::Connecting;
                        s.last_activity = Instant::now();
                        ConnectVerdict::Proceed
                    })
                    .await;

                match verdict {
                    Some(ConnectVerdict::Proceed) => {
                        info!(session_id = %id, host = %host, port, "remote shell requested");
                        let params = ConnectParams {
                            host,
                            port,
                            username,
                            password,
                            private_key,
                        };
                        let connector = self.connector.clone();
                        let events = shell_tx.clone();
                        tokio::spawn(async move {
                            match connector.connect(params, events.clone()).await {
                                Ok((remote, shell)) => {
                                    if let Err(mpsc::error::SendError(ev)) = events
                                        .send(ShellEvent::Connected { remote, shell })
                                        .await
                                    {
                                        // The session loop is gone; the handles
                                        // have no owner left, so release them here.
                                        debug!("session ended before shell became ready");
                                        if let ShellEvent::Connected {
                                            mut remote,
                                            mut shell,
                                        } = ev
                                        {
                                            let _ = shell.close();
                                            let _ = remote.close();
                                        }
                                    }
                                }
                                Err(e) => {
                                    let _ = events
                                        .send(ShellEvent::ConnectFailed(e.to_string()))
                                        .await;
                                }
                            }
                        });
                    }
                    Some(ConnectVerdict::AlreadyConnected) => {
                        let _ = transport
                            .send(&ServerMessage::error("Already connected to SSH server"))
                            .await;
                    }
                    Some(ConnectVerdict::Invalid) => {
                        let _ = transport
                            .send(&ServerMessage::error("Invalid connection configuration"))
                            .await;
                    }
                    Some(ConnectVerdict::Ignore) | None => {}
                }
                ControlFlow::Continue(())
            }

            ClientMessage::Input { text } => {
                if text.len() > self.input_max_bytes {
                    // Dropped whole, without counting as activity.
                    debug!(session_id = %id, len = text.len(), "dropping oversized input");
                    return ControlFlow::Continue(());
                }
                let result = self
                    .registry
                    .with_session_mut(id, |s| {
                        if s.state != SessionState::Active {
                            return Ok(());
                        }
                        s.last_activity = Instant::now();
                        match s.shell.as_ref() {
                            Some(shell) => shell.write(&text),
                            None => Ok(()),
                        }
                    })
                    .await;
                if let Some(Err(e)) = result {
                    warn!(session_id = %id, error = %e, "shell write failed");
                }
                ControlFlow::Continue(())
            }

            ClientMessage::Resize { rows, cols } => {
                if !(1..=MAX_TERMINAL_DIM).contains(&rows) || !(1..=MAX_TERMINAL_DIM).contains(&cols)
                {
                    debug!(session_id = %id, rows, cols, "ignoring invalid resize");
                    return ControlFlow::Continue(());
                }
                let result = self
                    .registry
                    .with_session_mut(id, |s| {
                        if s.state != SessionState::Active {
                            return Ok(());
                        }
                        s.last_activity = Instant::now();
                        match s.shell.as_ref() {
                            Some(shell) => shell.resize(rows, cols),
                            None => Ok(()),
                        }
                    })
                    .await;
                if let Some(Err(e)) = result {
                    warn!(session_id = %id, error = %e, "window change failed");
                }
                ControlFlow::Continue(())
            }

            ClientMessage::Disconnect => {
                info!(session_id = %id, "disconnect requested");
                let _ = transport
                    .send(&ServerMessage::disconnected("Disconnected"))
                    .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn handle_shell_event<T: ClientTransport>(
        &self,
        id: &str,
        ev: ShellEvent,
        transport: &mut T,
    ) -> ControlFlow<()> {
        match ev {
            ShellEvent::Connected { remote, shell } => {
                match self.registry.install_shell(id, remote, shell).await {
                    Ok(()) => {
                        info!(session_id = %id, "remote shell established");
                        let _ = transport
                            .send(&ServerMessage::connected("Connected to server"))
                            .await;
                        ControlFlow::Continue(())
                    }
                    Err((mut remote, mut shell)) => {
                        // The session was torn down while the handshake was
                        // in flight; release the late-arriving handles.
                        debug!(session_id = %id, "session closed before shell became ready");
                        let _ = shell.close();
                        let _ = remote.close();
                        ControlFlow::Break(())
                    }
                }
            }

            ShellEvent::ConnectFailed(message) => {
                warn!(session_id = %id, error = %message, "remote shell connect failed");
                let _ = transport.send(&ServerMessage::error(&message)).await;
                ControlFlow::Break(())
            }

            ShellEvent::Data(text) | ShellEvent::StderrData(text) => {
                let forward = self
                    .registry
                    .with_session_mut(id, |s| {
                        if s.state != SessionState::Active {
                            return false;
                        }
                        s.last_activity = Instant::now();
                        s.buffer.append(&text);
                        true
                    })
                    .await
                    .unwrap_or(false);
                if forward && transport.send(&ServerMessage::output(text)).await.is_err() {
                    debug!(session_id = %id, "peer unreachable, dropping session");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }

            ShellEvent::Error(message) => {
                warn!(session_id = %id, error = %message, "remote shell error");
                let _ = transport.send(&ServerMessage::error(&message)).await;
                ControlFlow::Break(())
            }

            ShellEvent::Closed => {
                info!(session_id = %id, "shell channel closed");
                let _ = transport
                    .send(&ServerMessage::disconnected("Connection closed"))
                    .await;
                ControlFlow::Break(())
            }
        }
    }
}
