use std::time::Duration;
use thiserror::Error;
use vm_orchestrator::OrchestratorError;

pub type Result<T> = std::result::Result<T, SshError>;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication failed for user {0}")]
    Authentication(String),

    #[error("Failed to load SSH key: {0}")]
    KeyFile(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    /// Remote command finished with a non-zero (or missing) exit status
    #[error("Remote command failed (exit status {}): {output}", exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    RemoteExecution {
        exit_code: Option<u32>,
        output: String,
    },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        Self::Channel(err.to_string())
    }
}
