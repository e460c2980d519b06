use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use vm_provider::SecurityRule;

/// Lifecycle status of a compute instance.
///
/// Allowed edges: `PROVISIONING -> RUNNING | ERROR`, `RUNNING <-> STOPPED`,
/// `RUNNING | STOPPED -> TERMINATED`. `TERMINATED` and `ERROR` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Terminated,
    Error,
}

impl InstanceStatus {
    /// Statuses that keep a credential in use
    pub const ACTIVE: [InstanceStatus; 3] = [Self::Provisioning, Self::Running, Self::Stopped];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Whether moving from `self` to `next` is a state-machine edge.
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        self == next
            || matches!(
                (self, next),
                (Provisioning, Running)
                    | (Provisioning, Error)
                    | (Running, Stopped)
                    | (Stopped, Running)
                    | (Running, Terminated)
                    | (Stopped, Terminated)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored cloud credential; both key fields are ciphertext
#[derive(Debug, Clone)]
pub struct CloudCredential {
    pub id: String,
    pub workspace_id: String,
    pub access_key_id_encrypted: String,
    pub secret_access_key_encrypted: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credential submitted by a client
#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialInput {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl fmt::Debug for CredentialInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialInput")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Non-secret view of a stored credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CredentialMetadata {
    pub id: String,
    pub workspace_id: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CloudCredential> for CredentialMetadata {
    fn from(credential: &CloudCredential) -> Self {
        Self {
            id: credential.id.clone(),
            workspace_id: credential.workspace_id.clone(),
            region: credential.region.clone(),
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        }
    }
}

/// Credential metadata plus the access key with all but its last four
/// characters redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MaskedCredential {
    pub id: String,
    pub workspace_id: String,
    pub access_key_id: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComputeInstance {
    pub id: String,
    pub workspace_id: String,
    pub credential_id: String,
    pub status: InstanceStatus,
    pub instance_type: String,
    pub region: String,
    pub repo_url: String,

    #[serde(skip_serializing, default)]
    pub deploy_token_encrypted: Option<String>,

    pub integrations: Vec<String>,
    pub provider_instance_id: Option<String>,
    pub security_group_id: Option<String>,
    pub public_ip: Option<String>,
    pub error_message: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct ProvisionRequest {
    pub instance_type: String,
    pub repo_url: String,
    #[serde(default)]
    pub deploy_token: Option<String>,
    #[serde(default)]
    pub integrations: Vec<String>,
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("instance_type", &self.instance_type)
            .field("repo_url", &self.repo_url)
            .field("deploy_token", &self.deploy_token.as_ref().map(|_| "<redacted>"))
            .field("integrations", &self.integrations)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceAction {
    Start,
    Stop,
    Terminate,
}

impl InstanceAction {
    /// Status recorded once the provider accepted the request
    pub fn target_status(self) -> InstanceStatus {
        match self {
            Self::Start => InstanceStatus::Running,
            Self::Stop => InstanceStatus::Stopped,
            Self::Terminate => InstanceStatus::Terminated,
        }
    }

    /// Whether a caller may request this action while the instance is
    /// `status`. `PROVISIONING` is only left through observed provider state.
    pub fn allowed_from(self, status: InstanceStatus) -> bool {
        match self {
            Self::Start => status == InstanceStatus::Stopped,
            Self::Stop => status == InstanceStatus::Running,
            Self::Terminate => {
                matches!(status, InstanceStatus::Running | InstanceStatus::Stopped)
            }
        }
    }
}

impl fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionRequest {
    pub action: InstanceAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateSecurityRulesRequest {
    #[serde(default)]
    pub cidrs: Vec<String>,
}

/// Result of replacing an instance's inbound rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SecurityRulesUpdate {
    pub rules: Vec<SecurityRule>,
    /// Set when no CIDRs were supplied and SSH was opened to 0.0.0.0/0
    pub open_to_world: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    const ALL: [InstanceStatus; 5] = [Provisioning, Running, Stopped, Terminated, Error];

    #[test]
    fn test_only_documented_edges_are_allowed() {
        let allowed = [
            (Provisioning, Running),
            (Provisioning, Error),
            (Running, Stopped),
            (Stopped, Running),
            (Running, Terminated),
            (Stopped, Terminated),
        ];

        for from in ALL {
            for to in ALL {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_actions_are_allowed_only_from_settled_statuses() {
        use InstanceAction::*;

        assert!(Start.allowed_from(Stopped));
        assert!(!Start.allowed_from(Provisioning));
        assert!(!Start.allowed_from(Running));

        assert!(Stop.allowed_from(Running));
        assert!(!Stop.allowed_from(Provisioning));
        assert!(!Stop.allowed_from(Stopped));

        assert!(Terminate.allowed_from(Running));
        assert!(Terminate.allowed_from(Stopped));
        for status in [Provisioning, Terminated, Error] {
            assert!(!Terminate.allowed_from(status), "terminate from {}", status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Terminated.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Provisioning.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Stopped.is_terminal());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Provisioning).unwrap(), "\"PROVISIONING\"");
        let action: InstanceAction = serde_json::from_str("\"TERMINATE\"").unwrap();
        assert_eq!(action.target_status(), Terminated);
    }

    #[test]
    fn test_instance_serialization_omits_deploy_token() {
        let now = Utc::now();
        let instance = ComputeInstance {
            id: "inst-1".to_string(),
            workspace_id: "ws-1".to_string(),
            credential_id: "cred-1".to_string(),
            status: Provisioning,
            instance_type: "t3.small".to_string(),
            region: "us-east-1".to_string(),
            repo_url: "https://github.com/acme/app".to_string(),
            deploy_token_encrypted: Some("ciphertext".to_string()),
            integrations: vec![],
            provider_instance_id: None,
            security_group_id: None,
            public_ip: None,
            error_message: None,
            launched_at: None,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(&instance).unwrap();
        assert!(json.get("deploy_token_encrypted").is_none());
        assert_eq!(json["status"], "PROVISIONING");
    }
}
