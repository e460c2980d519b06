//! In-memory SSH connector for tests. Records connections, commands and
//! shell operations; command results are scripted per command string.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::{Result, SshError};
use crate::transport::{ExecOutput, ShellControl, ShellEvent, SshClient, SshConnector, SshTarget};

/// Operation observed on a fake shell, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOp {
    Write(Vec<u8>),
    Resize(u32, u32),
    Close,
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(ExecOutput),
    Hang,
}

#[derive(Default)]
struct FakeState {
    targets: Vec<SshTarget>,
    commands: Vec<String>,
    scripts: HashMap<String, Scripted>,
    open_connections: usize,
    connect_error: Option<String>,
    shell_ops: Vec<ShellOp>,
    shell_events: Option<mpsc::Sender<ShellEvent>>,
}

#[derive(Clone, Default)]
pub struct FakeSsh {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSsh {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script the result of `command`; unscripted commands exit 0 with no output
    pub fn respond(&self, command: &str, exit_code: u32, stdout: &str, stderr: &str) {
        self.lock().scripts.insert(
            command.to_string(),
            Scripted::Output(ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code: Some(exit_code),
            }),
        );
    }

    /// Make `command` never finish
    pub fn hang_on(&self, command: &str) {
        self.lock()
            .scripts
            .insert(command.to_string(), Scripted::Hang);
    }

    pub fn fail_connect(&self, message: &str) {
        self.lock().connect_error = Some(message.to_string());
    }

    pub fn targets(&self) -> Vec<SshTarget> {
        self.lock().targets.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn shell_ops(&self) -> Vec<ShellOp> {
        self.lock().shell_ops.clone()
    }

    /// Emit an event from the remote side of the open shell
    pub async fn emit(&self, event: ShellEvent) {
        let sender = self.lock().shell_events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl SshConnector for FakeSsh {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn SshClient>> {
        let mut state = self.lock();
        state.targets.push(target.clone());
        if let Some(message) = &state.connect_error {
            return Err(SshError::Connect(message.clone()));
        }
        state.open_connections += 1;

        Ok(Arc::new(FakeClient {
            ssh: self.clone(),
            connected: Mutex::new(true),
        }))
    }
}

struct FakeClient {
    ssh: FakeSsh,
    connected: Mutex<bool>,
}

#[async_trait]
impl SshClient for FakeClient {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let scripted = {
            let mut state = self.ssh.lock();
            state.commands.push(command.to_string());
            state.scripts.get(command).cloned()
        };

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Ok(ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            }),
        }
    }

    async fn open_shell(
        &self,
        _cols: u32,
        _rows: u32,
    ) -> Result<(Arc<dyn ShellControl>, mpsc::Receiver<ShellEvent>)> {
        let (tx, rx) = mpsc::channel(64);
        self.ssh.lock().shell_events = Some(tx);
        Ok((Arc::new(FakeShell { ssh: self.ssh.clone() }), rx))
    }

    async fn disconnect(&self) {
        let mut connected = self
            .connected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *connected {
            *connected = false;
            self.ssh.lock().open_connections -= 1;
        }
    }
}

struct FakeShell {
    ssh: FakeSsh,
}

#[async_trait]
impl ShellControl for FakeShell {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.ssh.lock().shell_ops.push(ShellOp::Write(data.to_vec()));
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.ssh.lock().shell_ops.push(ShellOp::Resize(cols, rows));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.ssh.lock();
        state.shell_ops.push(ShellOp::Close);
        state.shell_events = None;
    }
}
