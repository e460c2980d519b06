//! Shared fixtures for vm-ssh tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use vm_orchestrator::{ComputeInstance, InstanceStatus, OrchestratorError};
use vm_ssh::{InstanceLookup, SshSettings};

pub const WS: &str = "ws-1";

pub fn instance(id: &str, public_ip: Option<&str>) -> ComputeInstance {
    let now = Utc::now();
    ComputeInstance {
        id: id.to_string(),
        workspace_id: WS.to_string(),
        credential_id: "cred-1".to_string(),
        status: InstanceStatus::Running,
        instance_type: "t3.small".to_string(),
        region: "us-east-1".to_string(),
        repo_url: "https://github.com/acme/app".to_string(),
        deploy_token_encrypted: None,
        integrations: vec![],
        provider_instance_id: Some("i-0abc".to_string()),
        security_group_id: Some("sg-0abc".to_string()),
        public_ip: public_ip.map(str::to_string),
        error_message: None,
        launched_at: Some(now),
        created_at: now,
        updated_at: now,
    }
}

/// Settings pointing at a real (empty) key file; keep the file alive
pub fn ssh_settings() -> (SshSettings, NamedTempFile) {
    let key = NamedTempFile::new().expect("Failed to create key file");
    let settings = SshSettings {
        user: "ubuntu".to_string(),
        port: 22,
        key_path: key.path().to_path_buf(),
        connect_timeout: Duration::from_secs(5),
    };
    (settings, key)
}

/// Lookup over a fixed set of records
#[derive(Default)]
pub struct StaticLookup {
    instances: HashMap<(String, String), ComputeInstance>,
}

impl StaticLookup {
    pub fn with(instances: Vec<ComputeInstance>) -> Arc<Self> {
        Arc::new(Self {
            instances: instances
                .into_iter()
                .map(|i| ((i.workspace_id.clone(), i.id.clone()), i))
                .collect(),
        })
    }
}

#[async_trait]
impl InstanceLookup for StaticLookup {
    async fn get_instance(
        &self,
        workspace_id: &str,
        instance_id: &str,
    ) -> vm_orchestrator::Result<ComputeInstance> {
        self.instances
            .get(&(workspace_id.to_string(), instance_id.to_string()))
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {}", instance_id)))
    }
}
