use async_trait::async_trait;
use vm_orchestrator::{ComputeInstance, InstanceOrchestrator, Result};

/// Resolves an instance record, refreshed from the provider where possible
#[async_trait]
pub trait InstanceLookup: Send + Sync {
    async fn get_instance(&self, workspace_id: &str, instance_id: &str) -> Result<ComputeInstance>;
}

#[async_trait]
impl InstanceLookup for InstanceOrchestrator {
    async fn get_instance(&self, workspace_id: &str, instance_id: &str) -> Result<ComputeInstance> {
        self.get(workspace_id, instance_id).await
    }
}
