//! Seams between the SSH services and the SSH implementation.
//!
//! [`crate::russh_client::RusshConnector`] is the production connector; tests
//! plug in fakes that record every call.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;

/// Connection settings shared by every SSH session
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            key_path: PathBuf::from("~/.ssh/vm_api_ed25519"),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// Output of an interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// stdout or stderr bytes
    Output(Vec<u8>),
    Closed,
    Error(String),
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and authenticate
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn SshClient>>;
}

#[async_trait]
pub trait SshClient: Send + Sync {
    /// Run one non-interactive command to completion
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Request a pseudo-terminal shell. Output arrives on the returned receiver.
    async fn open_shell(
        &self,
        cols: u32,
        rows: u32,
    ) -> Result<(Arc<dyn ShellControl>, mpsc::Receiver<ShellEvent>)>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait ShellControl: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn resize(&self, cols: u32, rows: u32) -> Result<()>;

    async fn close(&self);
}
