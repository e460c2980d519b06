//! SSH transport built on `russh`

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SshError};
use crate::transport::{ExecOutput, ShellControl, ShellEvent, SshClient, SshConnector, SshTarget};

/// Buffered shell commands and output events per session
const SHELL_CHANNEL_CAPACITY: usize = 256;

/// Extended-data stream id of stderr
const STDERR_STREAM: u32 = 1;

/// Instances are short-lived and get fresh host keys on every launch,
/// so server keys are accepted without a known-hosts check.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn SshClient>> {
        let key = load_secret_key(&target.key_path, None)
            .map_err(|e| SshError::KeyFile(format!("{}: {}", target.key_path.display(), e)))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), AcceptingHandler),
        )
        .await
        .map_err(|_| SshError::Connect(format!("timed out connecting to {}", target.host)))?
        .map_err(|e| SshError::Connect(format!("{}: {}", target.host, e)))?;

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                target.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;
        if !auth.success() {
            return Err(SshError::Authentication(target.user.clone()));
        }

        debug!(host = %target.host, user = %target.user, "SSH session established");
        Ok(Arc::new(RusshClient { handle }))
    }
}

struct RusshClient {
    handle: Handle<AcceptingHandler>,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn open_shell(
        &self,
        cols: u32,
        rows: u32,
    ) -> Result<(Arc<dyn ShellControl>, mpsc::Receiver<ShellEvent>)> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;

        let (command_tx, command_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        tokio::spawn(pump_shell(channel, command_rx, event_tx));

        Ok((Arc::new(RusshShell { commands: command_tx }), event_rx))
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

enum ShellCommand {
    Write(Vec<u8>),
    Resize(u32, u32),
    Close,
}

struct RusshShell {
    commands: mpsc::Sender<ShellCommand>,
}

impl RusshShell {
    async fn send(&self, command: ShellCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SshError::Channel("shell is closed".to_string()))
    }
}

#[async_trait]
impl ShellControl for RusshShell {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.send(ShellCommand::Write(data.to_vec())).await
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.send(ShellCommand::Resize(cols, rows)).await
    }

    async fn close(&self) {
        let _ = self.send(ShellCommand::Close).await;
    }
}

/// Owns the shell channel: applies commands in order and forwards output
async fn pump_shell(
    mut channel: Channel<client::Msg>,
    mut commands: mpsc::Receiver<ShellCommand>,
    events: mpsc::Sender<ShellEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShellCommand::Write(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        let _ = events.send(ShellEvent::Error(e.to_string())).await;
                        break;
                    }
                }
                Some(ShellCommand::Resize(cols, rows)) => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("Terminal resize failed: {}", e);
                    }
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    if events.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = events.send(ShellEvent::Closed).await;
                    break;
                }
                Some(_) => {}
            },
        }
    }
}
