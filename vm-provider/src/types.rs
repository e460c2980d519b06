use serde::{Deserialize, Serialize};
use std::fmt;

/// Decrypted provider credentials for a single outbound call.
///
/// Only ever held in memory; `Debug` redacts the secret key.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Value of the `Name` tag
    pub name: String,
    pub instance_type: String,
    pub image_id: String,
    pub security_group_id: String,
    /// Provider key-pair attached for SSH access
    pub key_name: Option<String>,
    /// Boot-time script, passed as user data
    pub init_script: Option<String>,
}

impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The init script embeds the escaped deploy token
        f.debug_struct("LaunchRequest")
            .field("name", &self.name)
            .field("instance_type", &self.instance_type)
            .field("image_id", &self.image_id)
            .field("security_group_id", &self.security_group_id)
            .field("key_name", &self.key_name)
            .field("init_script", &self.init_script.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Instance lifecycle state as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl ProviderState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Result of a describe call; the provider may omit either field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: Option<ProviderState>,
    pub public_ip: Option<String>,
}

/// One inbound firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct SecurityRule {
    pub port: u16,
    pub cidr: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl SecurityRule {
    pub fn ssh(cidr: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port: crate::SSH_PORT,
            cidr: cidr.into(),
            description: Some(description.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = ProviderCredentials {
            access_key_id: "AKIAABCDEFGH1234".to_string(),
            secret_access_key: "super-secret".to_string(),
            region: "us-east-1".to_string(),
        };

        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("AKIAABCDEFGH1234"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("us-east-1"));
    }

    #[test]
    fn test_provider_state_from_name() {
        assert_eq!(ProviderState::from_name("running"), ProviderState::Running);
        assert_eq!(
            ProviderState::from_name("shutting-down"),
            ProviderState::ShuttingDown
        );
        assert_eq!(
            ProviderState::from_name("rebooting"),
            ProviderState::Other("rebooting".to_string())
        );
    }
}
