//! Agent version checks and in-place updates over SSH

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use vm_orchestrator::boot_script::shell_quote;

use crate::error::Result;
use crate::executor::RemoteCommandExecutor;
use crate::lookup::InstanceLookup;

/// Placeholder in the update command replaced by the quoted target version
pub const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Version instances should run
    pub target_version: String,
    /// Prints the installed version
    pub version_command: String,
    /// Installs the target version; may contain `{version}`
    pub update_command: String,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            target_version: "1.0.0".to_string(),
            version_command: "devbox-agent --version".to_string(),
            update_command: "sudo npm install -g devbox-agent@{version}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UpdateStatus {
    pub current_version: String,
    pub latest_version: String,
    pub update_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UpdateResult {
    pub success: bool,
    /// Empty when the update failed
    pub new_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct UpdateService {
    lookup: Arc<dyn InstanceLookup>,
    executor: RemoteCommandExecutor,
    settings: UpdateSettings,
}

impl UpdateService {
    pub fn new(
        lookup: Arc<dyn InstanceLookup>,
        executor: RemoteCommandExecutor,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            lookup,
            executor,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn check_for_updates(
        &self,
        workspace_id: &str,
        instance_id: &str,
    ) -> Result<UpdateStatus> {
        let current_version = self.probe_version(workspace_id, instance_id).await?;
        let latest_version = self.settings.target_version.clone();

        Ok(UpdateStatus {
            update_available: normalize_version(&current_version)
                != normalize_version(&latest_version),
            current_version,
            latest_version,
        })
    }

    /// Install the target version and report the version found afterwards.
    /// Failures are reported in the result, never returned as errors.
    #[instrument(skip(self))]
    pub async fn apply_update(&self, workspace_id: &str, instance_id: &str) -> UpdateResult {
        match self.run_update(workspace_id, instance_id).await {
            Ok(new_version) => {
                info!(%new_version, "Agent updated");
                UpdateResult {
                    success: true,
                    new_version,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Agent update failed: {}", e);
                UpdateResult {
                    success: false,
                    new_version: String::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_update(&self, workspace_id: &str, instance_id: &str) -> Result<String> {
        let instance = self.lookup.get_instance(workspace_id, instance_id).await?;
        let command = self.settings.update_command.replace(
            VERSION_PLACEHOLDER,
            &shell_quote(&self.settings.target_version),
        );

        self.executor.execute(&instance, &command, None).await?;
        self.probe_version(workspace_id, instance_id).await
    }

    async fn probe_version(&self, workspace_id: &str, instance_id: &str) -> Result<String> {
        let instance = self.lookup.get_instance(workspace_id, instance_id).await?;
        let output = self
            .executor
            .execute(&instance, &self.settings.version_command, None)
            .await?;
        Ok(output.trim().to_string())
    }
}

/// `devbox-agent v1.2.3` and `1.2.3` compare equal
fn normalize_version(raw: &str) -> &str {
    let token = raw.split_whitespace().last().unwrap_or("");
    token.strip_prefix('v').unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("1.2.3"), "1.2.3");
        assert_eq!(normalize_version("devbox-agent v1.2.3"), "1.2.3");
        assert_eq!(normalize_version("  v2.0.0\n"), "2.0.0");
        assert_eq!(normalize_version(""), "");
    }
}
