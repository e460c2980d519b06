use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};
use vm_core::validation::validate_server_address;
use vm_orchestrator::ComputeInstance;

use crate::error::{Result, SshError};
use crate::transport::{SshConnector, SshSettings, SshTarget};

/// Default wall-clock limit for one remote command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on a graceful disconnect after the command finished or timed out
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Resolve where to reach an instance over SSH.
///
/// Requires a public address and the private key file to be present.
pub fn target_for(instance: &ComputeInstance, settings: &SshSettings) -> Result<SshTarget> {
    let host = instance.public_ip.clone().ok_or_else(|| {
        SshError::BadRequest(format!("instance {} has no public address", instance.id))
    })?;
    validate_server_address(&host).map_err(|e| SshError::BadRequest(e.to_string()))?;

    if !settings.key_path.is_file() {
        return Err(SshError::BadRequest(format!(
            "SSH private key not found at {}",
            settings.key_path.display()
        )));
    }

    Ok(SshTarget {
        host,
        port: settings.port,
        user: settings.user.clone(),
        key_path: settings.key_path.clone(),
    })
}

/// Runs one bounded command per SSH connection
#[derive(Clone)]
pub struct RemoteCommandExecutor {
    connector: Arc<dyn SshConnector>,
    settings: SshSettings,
    default_timeout: Duration,
}

impl RemoteCommandExecutor {
    pub fn new(connector: Arc<dyn SshConnector>, settings: SshSettings) -> Self {
        Self {
            connector,
            settings,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run `command` and return its stdout.
    ///
    /// A non-zero exit fails with stderr and stdout combined. The timeout
    /// covers connecting and running; when it fires the connection is closed
    /// and [`SshError::Timeout`] is returned.
    #[instrument(skip(self, instance, command), fields(instance_id = %instance.id))]
    pub async fn execute(
        &self,
        instance: &ComputeInstance,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let limit = timeout.unwrap_or(self.default_timeout);
        let target = target_for(instance, &self.settings)?;
        let deadline = Instant::now() + limit;

        let client = timeout_at(deadline, self.connector.connect(&target))
            .await
            .map_err(|_| SshError::Timeout(limit))??;

        let outcome = timeout_at(deadline, client.exec(command)).await;

        if tokio::time::timeout(DISCONNECT_GRACE, client.disconnect())
            .await
            .is_err()
        {
            warn!(host = %target.host, "SSH disconnect did not complete");
        }

        let output = outcome.map_err(|_| SshError::Timeout(limit))??;
        debug!(exit_code = ?output.exit_code, "Remote command finished");

        if output.exit_code == Some(0) {
            return Ok(output.stdout);
        }

        let combined = [output.stderr.trim(), output.stdout.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");

        Err(SshError::RemoteExecution {
            exit_code: output.exit_code,
            output: combined,
        })
    }
}
