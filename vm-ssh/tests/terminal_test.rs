mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{instance, ssh_settings, StaticLookup, WS};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vm_orchestrator::test_utils::create_test_db;
use vm_orchestrator::{ApiKeyVerifier, OrchestratorError, SqliteAccessDirectory};
use vm_ssh::fake::{FakeSsh, ShellOp};
use vm_ssh::{ClientEvent, ServerEvent, ShellEvent, SshError, TerminalProxy, TerminalRequest};

struct Fixture {
    ssh: FakeSsh,
    proxy: TerminalProxy,
    _key: NamedTempFile,
}

async fn fixture() -> Fixture {
    let pool = create_test_db().await;
    let directory = SqliteAccessDirectory::new(pool);
    directory.add_workspace(WS, "org-1").await.unwrap();
    directory.add_workspace("ws-2", "org-2").await.unwrap();
    directory.add_member("org-1", "alice").await.unwrap();

    let verifier = ApiKeyVerifier::from_pairs("alice-token=alice,bob-token=bob").unwrap();
    let ssh = FakeSsh::new();
    let (settings, key) = ssh_settings();

    let proxy = TerminalProxy::new(
        Arc::new(verifier),
        Arc::new(directory),
        StaticLookup::with(vec![
            instance("inst-1", Some("203.0.113.10")),
            instance("no-ip", None),
        ]),
        Arc::new(ssh.clone()),
        settings,
    );

    Fixture {
        ssh,
        proxy,
        _key: key,
    }
}

struct Session {
    client_tx: mpsc::Sender<ClientEvent>,
    server_rx: mpsc::Receiver<ServerEvent>,
    task: JoinHandle<()>,
}

async fn start(fixture: &Fixture, connection_id: &str, instance_id: &str) -> Session {
    let request = fixture
        .proxy
        .handshake(Some("alice-token"), Some(WS), Some(instance_id))
        .await
        .unwrap();

    let (client_tx, client_rx) = mpsc::channel(16);
    let (server_tx, server_rx) = mpsc::channel(16);
    let proxy = fixture.proxy.clone();
    let connection_id = connection_id.to_string();
    let task = tokio::spawn(async move {
        proxy
            .run(&connection_id, &request, client_rx, server_tx)
            .await;
    });

    Session {
        client_tx,
        server_rx,
        task,
    }
}

async fn next_event(session: &mut Session) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), session.server_rx.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server channel closed")
}

async fn wait_for_ops(ssh: &FakeSsh, count: usize) -> Vec<ShellOp> {
    for _ in 0..100 {
        let ops = ssh.shell_ops();
        if ops.len() >= count {
            return ops;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} shell operations, saw {:?}", count, ssh.shell_ops());
}

// ---- Handshake ----

#[tokio::test]
async fn test_handshake_accepts_member() {
    let fixture = fixture().await;

    let request = fixture
        .proxy
        .handshake(Some("alice-token"), Some(WS), Some("inst-1"))
        .await
        .unwrap();
    assert_eq!(
        request,
        TerminalRequest {
            user: vm_orchestrator::UserIdentity {
                user_id: "alice".to_string()
            },
            workspace_id: WS.to_string(),
            instance_id: "inst-1".to_string(),
        }
    );
}

#[tokio::test]
async fn test_handshake_rejections() {
    let fixture = fixture().await;
    let proxy = &fixture.proxy;

    assert!(matches!(
        proxy.handshake(None, Some(WS), Some("inst-1")).await,
        Err(SshError::Orchestrator(OrchestratorError::Unauthorized(_)))
    ));
    assert!(matches!(
        proxy.handshake(Some("forged"), Some(WS), Some("inst-1")).await,
        Err(SshError::Orchestrator(OrchestratorError::Unauthorized(_)))
    ));
    assert!(matches!(
        proxy.handshake(Some("alice-token"), Some(WS), None).await,
        Err(SshError::BadRequest(_))
    ));
    assert!(matches!(
        proxy.handshake(Some("alice-token"), Some("ws-missing"), Some("inst-1")).await,
        Err(SshError::Orchestrator(OrchestratorError::NotFound(_)))
    ));
    assert!(matches!(
        proxy.handshake(Some("bob-token"), Some(WS), Some("inst-1")).await,
        Err(SshError::Orchestrator(OrchestratorError::Forbidden(_)))
    ));
    assert!(matches!(
        proxy.handshake(Some("alice-token"), Some("ws-2"), Some("inst-1")).await,
        Err(SshError::Orchestrator(OrchestratorError::Forbidden(_)))
    ));
}

// ---- Session ----

#[tokio::test]
async fn test_resize_then_input_in_order() {
    let fixture = fixture().await;
    let mut session = start(&fixture, "conn-1", "inst-1").await;
    assert_eq!(next_event(&mut session).await, ServerEvent::Connected);
    assert!(fixture.proxy.registry().contains("conn-1"));

    session
        .client_tx
        .send(ClientEvent::Resize { cols: 120, rows: 40 })
        .await
        .unwrap();
    session
        .client_tx
        .send(ClientEvent::Input {
            data: "ls\n".to_string(),
        })
        .await
        .unwrap();

    let ops = wait_for_ops(&fixture.ssh, 2).await;
    assert_eq!(
        ops,
        vec![ShellOp::Resize(120, 40), ShellOp::Write(b"ls\n".to_vec())]
    );

    // Client goes away
    drop(session.client_tx);
    session.task.await.unwrap();

    assert_eq!(
        fixture.ssh.shell_ops(),
        vec![
            ShellOp::Resize(120, 40),
            ShellOp::Write(b"ls\n".to_vec()),
            ShellOp::Close
        ]
    );
    assert_eq!(fixture.ssh.open_connections(), 0);
    assert!(fixture.proxy.registry().is_empty());
}

#[tokio::test]
async fn test_shell_output_and_remote_close() {
    let fixture = fixture().await;
    let mut session = start(&fixture, "conn-1", "inst-1").await;
    assert_eq!(next_event(&mut session).await, ServerEvent::Connected);

    fixture
        .ssh
        .emit(ShellEvent::Output(b"ubuntu@ip:~$ ".to_vec()))
        .await;
    assert_eq!(
        next_event(&mut session).await,
        ServerEvent::Output {
            data: "ubuntu@ip:~$ ".to_string()
        }
    );

    fixture.ssh.emit(ShellEvent::Closed).await;
    assert_eq!(next_event(&mut session).await, ServerEvent::Disconnected);

    session.task.await.unwrap();
    assert_eq!(fixture.ssh.open_connections(), 0);
    assert!(fixture.proxy.registry().is_empty());
}

#[tokio::test]
async fn test_shell_error_reaches_client() {
    let fixture = fixture().await;
    let mut session = start(&fixture, "conn-1", "inst-1").await;
    assert_eq!(next_event(&mut session).await, ServerEvent::Connected);

    fixture
        .ssh
        .emit(ShellEvent::Error("connection reset".to_string()))
        .await;
    assert_eq!(
        next_event(&mut session).await,
        ServerEvent::Error {
            message: "connection reset".to_string()
        }
    );

    session.task.await.unwrap();
    assert!(fixture.proxy.registry().is_empty());
}

#[tokio::test]
async fn test_unreachable_instance_reports_error() {
    let fixture = fixture().await;

    let mut session = start(&fixture, "conn-1", "no-ip").await;
    assert!(matches!(
        next_event(&mut session).await,
        ServerEvent::Error { .. }
    ));
    session.task.await.unwrap();

    fixture.ssh.fail_connect("connection refused");
    let mut session = start(&fixture, "conn-2", "inst-1").await;
    match next_event(&mut session).await {
        ServerEvent::Error { message } => assert!(message.contains("connection refused")),
        other => panic!("unexpected event: {:?}", other),
    }
    session.task.await.unwrap();

    assert!(fixture.proxy.registry().is_empty());
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let fixture = fixture().await;
    let mut session = start(&fixture, "conn-1", "inst-1").await;
    assert_eq!(next_event(&mut session).await, ServerEvent::Connected);

    fixture.proxy.registry().teardown("conn-1").await;
    fixture.proxy.registry().teardown("conn-1").await;

    assert_eq!(fixture.ssh.open_connections(), 0);
    let closes = fixture
        .ssh
        .shell_ops()
        .into_iter()
        .filter(|op| *op == ShellOp::Close)
        .count();
    assert_eq!(closes, 1);

    // The session loop ends once the shell channel is gone
    assert_eq!(next_event(&mut session).await, ServerEvent::Disconnected);
    session.task.await.unwrap();
    assert_eq!(
        fixture
            .ssh
            .shell_ops()
            .iter()
            .filter(|op| **op == ShellOp::Close)
            .count(),
        1
    );
}
