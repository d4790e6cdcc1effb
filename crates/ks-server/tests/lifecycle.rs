//! End-to-end session lifecycle tests over an in-memory transport and a
//! fake remote-shell connector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use ks_core::{ClientMessage, KsError, KsResult, ServerMessage};
use ks_server::config::ServerConfig;
use ks_server::reaper::sweep_once;
use ks_server::server::RelayServer;
use ks_server::shell::{
    ConnectParams, RemoteShellConnector, RemoteShellHandle, ShellChannel, ShellEvent,
};
use ks_server::transport::ClientTransport;
use ks_server::{cleanup, RelayService, SessionRegistry, SessionState};

// ---------------------------------------------------------------------------
// Fakes

#[derive(Clone, Default)]
struct Probes {
    writes: Arc<Mutex<Vec<String>>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    shell_closes: Arc<AtomicUsize>,
    remote_closes: Arc<AtomicUsize>,
    connect_calls: Arc<AtomicUsize>,
    events: Arc<Mutex<Option<mpsc::Sender<ShellEvent>>>>,
}

impl Probes {
    fn shell(&self) -> Box<dyn ShellChannel> {
        Box::new(FakeShell {
            probes: self.clone(),
        })
    }

    fn remote(&self) -> Box<dyn RemoteShellHandle> {
        Box::new(FakeRemote {
            probes: self.clone(),
        })
    }

    fn event_sender(&self) -> mpsc::Sender<ShellEvent> {
        self.events.lock().unwrap().clone().expect("no connect yet")
    }
}

struct FakeShell {
    probes: Probes,
}

impl ShellChannel for FakeShell {
    fn write(&self, text: &str) -> KsResult<()> {
        self.probes.writes.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> KsResult<()> {
        self.probes.resizes.lock().unwrap().push((rows, cols));
        Ok(())
    }

    fn close(&mut self) -> KsResult<()> {
        self.probes.shell_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeRemote {
    probes: Probes,
}

impl RemoteShellHandle for FakeRemote {
    fn close(&mut self) -> KsResult<()> {
        self.probes.remote_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
enum Outcome {
    Success,
    Fail(String),
}

struct FakeConnector {
    outcome: Outcome,
    probes: Probes,
    /// When set, `connect` stalls here until the test releases it.
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl RemoteShellConnector for FakeConnector {
    async fn connect(
        &self,
        _params: ConnectParams,
        events: mpsc::Sender<ShellEvent>,
    ) -> KsResult<(Box<dyn RemoteShellHandle>, Box<dyn ShellChannel>)> {
        self.probes.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.probes.events.lock().unwrap() = Some(events);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.outcome {
            Outcome::Fail(message) => Err(KsError::RemoteShell(message.clone())),
            Outcome::Success => Ok((self.probes.remote(), self.probes.shell())),
        }
    }
}

struct ChannelTransport {
    rx: mpsc::Receiver<ClientMessage>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send(&mut self, msg: &ServerMessage) -> KsResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| KsError::Transport("peer gone".into()))
    }

    async fn recv(&mut self) -> KsResult<Option<ClientMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> KsResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    registry: Arc<SessionRegistry>,
    probes: Probes,
    client_tx: mpsc::Sender<ClientMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    task: tokio::task::JoinHandle<()>,
}

fn start(outcome: Outcome) -> Harness {
    let registry = Arc::new(SessionRegistry::new(8192));
    let probes = Probes::default();
    let connector = Arc::new(FakeConnector {
        outcome,
        probes: probes.clone(),
        gate: None,
    });
    let relay = RelayService::new(registry.clone(), connector, 1000);

    let (client_tx, client_rx) = mpsc::channel(16);
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        rx: client_rx,
        tx: server_tx,
    };
    let task = tokio::spawn(async move {
        relay.run_session(transport, "10.1.2.3".to_string()).await;
    });

    Harness {
        registry,
        probes,
        client_tx,
        server_rx,
        task,
    }
}

impl Harness {
    async fn session_id(&self) -> String {
        for _ in 0..200 {
            if let Some((id, _)) = self.registry.all_sessions().await.into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never registered");
    }

    async fn connect(&mut self) -> String {
        let id = self.session_id().await;
        self.client_tx.send(connect_msg()).await.unwrap();
        assert_eq!(
            recv_msg(&mut self.server_rx).await,
            ServerMessage::connected("Connected to server")
        );
        id
    }
}

fn connect_msg() -> ClientMessage {
    ClientMessage::Connect {
        host: "h".into(),
        port: 22,
        username: "u".into(),
        password: Some("p".into()),
        private_key: None,
    }
}

async fn recv_msg(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for server message")
        .expect("server channel closed")
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn connect_flow_reaches_active_and_relays_both_directions() {
    let mut h = start(Outcome::Success);
    let id = h.connect().await;

    let state = h.registry.with_session(&id, |s| s.state).await.unwrap();
    assert_eq!(state, SessionState::Active);
    assert_eq!(h.registry.count().await, 1);
    assert_eq!(h.registry.count_for_source("10.1.2.3").await, 1);

    h.client_tx
        .send(ClientMessage::Input { text: "ls\n".into() })
        .await
        .unwrap();
    let probes = h.probes.clone();
    wait_for(move || probes.writes.lock().unwrap().contains(&"ls\n".to_string())).await;

    h.probes
        .event_sender()
        .send(ShellEvent::Data("file1\n".into()))
        .await
        .unwrap();
    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::output("file1\n")
    );

    // The fragment is also retained in the session's output buffer.
    let buffered = h
        .registry
        .with_session(&id, |s| s.buffer.snapshot().to_vec())
        .await
        .unwrap();
    assert_eq!(buffered, vec!["file1\n".to_string()]);
}

#[tokio::test]
async fn resize_reaches_the_shell_channel() {
    let mut h = start(Outcome::Success);
    h.connect().await;

    h.client_tx
        .send(ClientMessage::Resize { rows: 40, cols: 120 })
        .await
        .unwrap();
    let probes = h.probes.clone();
    wait_for(move || probes.resizes.lock().unwrap().contains(&(40, 120))).await;

    // Out-of-range dimensions are ignored.
    h.client_tx
        .send(ClientMessage::Resize { rows: 0, cols: 120 })
        .await
        .unwrap();
    h.client_tx
        .send(ClientMessage::Resize {
            rows: 24,
            cols: 5000,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.probes.resizes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn connect_with_empty_host_is_rejected_and_stays_idle() {
    let mut h = start(Outcome::Success);
    let id = h.session_id().await;

    h.client_tx
        .send(ClientMessage::Connect {
            host: "".into(),
            port: 22,
            username: "u".into(),
            password: Some("p".into()),
            private_key: None,
        })
        .await
        .unwrap();

    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::error("Invalid connection configuration")
    );
    let state = h.registry.with_session(&id, |s| s.state).await.unwrap();
    assert_eq!(state, SessionState::Idle);
    assert_eq!(h.probes.connect_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_connect_is_rejected_without_touching_the_shell() {
    let mut h = start(Outcome::Success);
    h.connect().await;

    h.client_tx.send(connect_msg()).await.unwrap();
    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::error("Already connected to SSH server")
    );
    assert_eq!(h.probes.connect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.probes.shell_closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_failure_surfaces_error_and_removes_the_session() {
    let mut h = start(Outcome::Fail("auth failed".into()));
    h.session_id().await;
    h.client_tx.send(connect_msg()).await.unwrap();

    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::error("auth failed")
    );
    h.task.await.unwrap();
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn transport_loss_cleans_up_without_messaging_the_peer() {
    let mut h = start(Outcome::Success);
    h.connect().await;

    drop(h.client_tx);
    h.task.await.unwrap();

    assert_eq!(h.probes.shell_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.probes.remote_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.count().await, 0);
    assert_eq!(h.registry.count_for_source("10.1.2.3").await, 0);
    // No terminal status was sent to the (already gone) peer.
    assert!(h.server_rx.recv().await.is_none());
}

#[tokio::test]
async fn oversized_input_is_dropped_and_does_not_count_as_activity() {
    let mut h = start(Outcome::Success);
    let id = h.connect().await;

    let before: Instant = h
        .registry
        .with_session(&id, |s| s.last_activity)
        .await
        .unwrap();

    h.client_tx
        .send(ClientMessage::Input {
            text: "x".repeat(10_000),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.probes.writes.lock().unwrap().is_empty());
    let after = h
        .registry
        .with_session(&id, |s| s.last_activity)
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn explicit_disconnect_tears_down_exactly_once() {
    let mut h = start(Outcome::Success);
    h.connect().await;

    h.client_tx.send(ClientMessage::Disconnect).await.unwrap();
    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::disconnected("Disconnected")
    );
    h.task.await.unwrap();

    assert_eq!(h.probes.shell_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.probes.remote_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn shell_close_event_reports_disconnected_and_cleans_up() {
    let mut h = start(Outcome::Success);
    h.connect().await;

    h.probes
        .event_sender()
        .send(ShellEvent::Closed)
        .await
        .unwrap();
    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::disconnected("Connection closed")
    );
    h.task.await.unwrap();
    assert_eq!(h.probes.shell_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn reaper_times_out_idle_session_and_ends_its_loop() {
    let mut h = start(Outcome::Success);
    h.connect().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reaped = sweep_once(&h.registry, Duration::ZERO).await;
    assert_eq!(reaped, 1);

    assert_eq!(
        recv_msg(&mut h.server_rx).await,
        ServerMessage::error("Session timeout due to inactivity")
    );
    h.task.await.unwrap();
    assert_eq!(h.probes.shell_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.probes.remote_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn late_connect_completion_closes_handles_when_session_is_gone() {
    let registry = Arc::new(SessionRegistry::new(8192));
    let probes = Probes::default();
    let gate = Arc::new(Notify::new());
    let connector = Arc::new(FakeConnector {
        outcome: Outcome::Success,
        probes: probes.clone(),
        gate: Some(gate.clone()),
    });
    let relay = RelayService::new(registry.clone(), connector, 1000);

    let (client_tx, client_rx) = mpsc::channel(16);
    let (server_tx, _server_rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        rx: client_rx,
        tx: server_tx,
    };
    let task = tokio::spawn(async move {
        relay.run_session(transport, "10.1.2.3".to_string()).await;
    });

    client_tx.send(connect_msg()).await.unwrap();
    let p = probes.clone();
    wait_for(move || p.connect_calls.load(Ordering::SeqCst) == 1).await;

    // The peer disappears while the handshake is still stalled.
    drop(client_tx);
    task.await.unwrap();
    assert_eq!(registry.count().await, 0);
    assert_eq!(probes.shell_closes.load(Ordering::SeqCst), 0);

    // Let the handshake finish into a dead session: the handles must be
    // released rather than silently dropped.
    gate.notify_one();
    let p = probes.clone();
    wait_for(move || {
        p.shell_closes.load(Ordering::SeqCst) == 1 && p.remote_closes.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn concurrent_cleanup_triggers_release_resources_exactly_once() {
    let registry = Arc::new(SessionRegistry::new(8192));
    let probes = Probes::default();
    let (peer_tx, _peer_rx) = mpsc::channel(8);
    let id = registry.create("10.9.9.9", peer_tx).await;
    registry
        .with_session_mut(&id, |s| s.state = SessionState::Connecting)
        .await;
    assert!(registry
        .install_shell(&id, probes.remote(), probes.shell())
        .await
        .is_ok());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(
            async move { cleanup(&registry, &id).await },
        ));
    }
    let mut performed = 0;
    for task in tasks {
        if task.await.unwrap() {
            performed += 1;
        }
    }

    assert_eq!(performed, 1);
    assert_eq!(probes.shell_closes.load(Ordering::SeqCst), 1);
    assert_eq!(probes.remote_closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.count().await, 0);
    assert_eq!(registry.count_for_source("10.9.9.9").await, 0);
}

#[tokio::test]
async fn shutdown_sweep_notifies_and_closes_every_session() {
    let probes = Probes::default();
    let connector = Arc::new(FakeConnector {
        outcome: Outcome::Success,
        probes: probes.clone(),
        gate: None,
    });
    let server = RelayServer::with_connector(ServerConfig::default(), connector.clone());
    let registry = server.registry();
    let relay = RelayService::new(registry.clone(), connector, 1000);

    let mut peers = Vec::new();
    for _ in 0..2 {
        let (client_tx, client_rx) = mpsc::channel(16);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            rx: client_rx,
            tx: server_tx,
        };
        let relay = relay.clone();
        let task = tokio::spawn(async move {
            relay.run_session(transport, "10.0.0.5".to_string()).await;
        });
        let _ = client_tx.send(connect_msg()).await;
        assert_eq!(
            recv_msg(&mut server_rx).await,
            ServerMessage::connected("Connected to server")
        );
        peers.push((client_tx, server_rx, task));
    }
    assert_eq!(registry.count().await, 2);

    server.shutdown_sweep().await;

    for (_tx, mut rx, task) in peers {
        assert_eq!(
            recv_msg(&mut rx).await,
            ServerMessage::disconnected("Server shutting down")
        );
        task.await.unwrap();
    }
    assert_eq!(registry.count().await, 0);
    assert_eq!(probes.shell_closes.load(Ordering::SeqCst), 2);
    assert_eq!(probes.remote_closes.load(Ordering::SeqCst), 2);
}
