mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{instance, ssh_settings, StaticLookup, WS};
use tokio::time::Instant;
use vm_ssh::fake::FakeSsh;
use vm_ssh::{RemoteCommandExecutor, SshError, SshSettings, UpdateService, UpdateSettings};

fn executor(ssh: &FakeSsh, settings: SshSettings) -> RemoteCommandExecutor {
    RemoteCommandExecutor::new(Arc::new(ssh.clone()), settings)
}

#[tokio::test]
async fn test_successful_command_returns_stdout() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond("uname -a", 0, "Linux ip-10-0-0-1\n", "");

    let output = executor(&ssh, settings)
        .execute(&instance("inst-1", Some("203.0.113.10")), "uname -a", None)
        .await
        .unwrap();

    assert_eq!(output, "Linux ip-10-0-0-1\n");
    let target = &ssh.targets()[0];
    assert_eq!(target.host, "203.0.113.10");
    assert_eq!(target.user, "ubuntu");
    assert_eq!(ssh.open_connections(), 0);
}

#[tokio::test]
async fn test_non_zero_exit_fails_with_combined_output() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond("false", 2, "partial\n", "boom\n");

    let err = executor(&ssh, settings)
        .execute(&instance("inst-1", Some("203.0.113.10")), "false", None)
        .await
        .unwrap_err();

    match err {
        SshError::RemoteExecution { exit_code, output } => {
            assert_eq!(exit_code, Some(2));
            assert_eq!(output, "boom\npartial");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(ssh.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_closes_connection() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.hang_on("tail -f /dev/null");

    let started = Instant::now();
    let err = executor(&ssh, settings)
        .execute(
            &instance("inst-1", Some("203.0.113.10")),
            "tail -f /dev/null",
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SshError::Timeout(d) if d == Duration::from_secs(2)));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(ssh.open_connections(), 0);
}

#[tokio::test]
async fn test_requires_public_address_and_key() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();

    let err = executor(&ssh, settings.clone())
        .execute(&instance("inst-1", None), "true", None)
        .await
        .unwrap_err();
    assert!(matches!(err, SshError::BadRequest(_)));

    let missing_key = SshSettings {
        key_path: PathBuf::from("/nonexistent/vm_api_ed25519"),
        ..settings
    };
    let err = executor(&ssh, missing_key)
        .execute(&instance("inst-1", Some("203.0.113.10")), "true", None)
        .await
        .unwrap_err();
    assert!(matches!(err, SshError::BadRequest(_)));

    assert!(ssh.targets().is_empty());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.fail_connect("connection refused");

    let err = executor(&ssh, settings)
        .execute(&instance("inst-1", Some("203.0.113.10")), "true", None)
        .await
        .unwrap_err();
    assert!(matches!(err, SshError::Connect(_)));
}

// ---- Updates ----

fn update_service(ssh: &FakeSsh, settings: SshSettings) -> UpdateService {
    UpdateService::new(
        StaticLookup::with(vec![
            instance("inst-1", Some("203.0.113.10")),
            instance("no-ip", None),
        ]),
        executor(ssh, settings),
        UpdateSettings {
            target_version: "1.4.0".to_string(),
            version_command: "devbox-agent --version".to_string(),
            update_command: "sudo npm install -g devbox-agent@{version}".to_string(),
        },
    )
}

#[tokio::test]
async fn test_check_for_updates() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond("devbox-agent --version", 0, "1.3.2\n", "");

    let status = update_service(&ssh, settings)
        .check_for_updates(WS, "inst-1")
        .await
        .unwrap();

    assert_eq!(status.current_version, "1.3.2");
    assert_eq!(status.latest_version, "1.4.0");
    assert!(status.update_available);
}

#[tokio::test]
async fn test_up_to_date_agent() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond("devbox-agent --version", 0, "devbox-agent v1.4.0\n", "");

    let status = update_service(&ssh, settings)
        .check_for_updates(WS, "inst-1")
        .await
        .unwrap();
    assert!(!status.update_available);
}

#[tokio::test]
async fn test_apply_update_reprobes_version() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond("devbox-agent --version", 0, "1.4.0\n", "");

    let result = update_service(&ssh, settings)
        .apply_update(WS, "inst-1")
        .await;

    assert!(result.success);
    assert_eq!(result.new_version, "1.4.0");
    assert!(result.error.is_none());
    assert_eq!(
        ssh.commands(),
        vec![
            "sudo npm install -g devbox-agent@'1.4.0'".to_string(),
            "devbox-agent --version".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_apply_update_never_fails() {
    let ssh = FakeSsh::new();
    let (settings, _key) = ssh_settings();
    ssh.respond(
        "sudo npm install -g devbox-agent@'1.4.0'",
        1,
        "",
        "npm ERR! network",
    );
    let service = update_service(&ssh, settings);

    let result = service.apply_update(WS, "inst-1").await;
    assert!(!result.success);
    assert_eq!(result.new_version, "");
    assert!(result.error.unwrap().contains("npm ERR! network"));

    let result = service.apply_update(WS, "no-ip").await;
    assert!(!result.success);
    assert!(result.error.is_some());

    let result = service.apply_update(WS, "missing").await;
    assert!(!result.success);
}
