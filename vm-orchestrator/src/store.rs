//! Persistence seams for credential and instance records.
//!
//! The orchestrator and vault only see these traits; [`crate::db::SqliteStore`]
//! is the production implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CloudCredential, ComputeInstance, InstanceStatus};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_credential(&self, workspace_id: &str) -> Result<Option<CloudCredential>>;

    /// Insert, or replace the secrets and region of the workspace's existing
    /// record in the same statement. Returns the stored record.
    async fn upsert_credential(&self, credential: &CloudCredential) -> Result<CloudCredential>;

    async fn delete_credential(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_instance(&self, instance: &ComputeInstance) -> Result<()>;

    async fn find_instance(&self, workspace_id: &str, id: &str)
        -> Result<Option<ComputeInstance>>;

    /// Overwrite the whole record; concurrent writers resolve last-write-wins
    async fn update_instance(&self, instance: &ComputeInstance) -> Result<()>;

    /// Instances of a workspace, newest first
    async fn list_instances(&self, workspace_id: &str) -> Result<Vec<ComputeInstance>>;

    async fn list_instances_by_status(&self, status: InstanceStatus)
        -> Result<Vec<ComputeInstance>>;

    /// Count instances created with `credential_id` whose status is one of `statuses`
    async fn count_instances_by_status(
        &self,
        credential_id: &str,
        statuses: &[InstanceStatus],
    ) -> Result<i64>;
}
