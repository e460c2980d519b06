//! Cloud compute provider access.
//!
//! [`ComputeProvider`] is the only path from the rest of the workspace to the
//! cloud API. Every call receives the decrypted credentials it should run
//! with and opens its own short-lived provider session, so no client outlives
//! a single operation.

pub mod ec2;
pub mod error;
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;
pub mod types;

use async_trait::async_trait;
use std::future::Future;
use tracing::{info, warn};

pub use ec2::Ec2Provider;
pub use error::{ProviderError, Result};
#[cfg(any(test, feature = "test-helpers"))]
pub use mock::{MockOperation, MockProvider, ProviderCall};
pub use types::{
    InstanceDescription, LaunchRequest, ProviderCredentials, ProviderState, SecurityRule,
};

/// Port opened by the default ingress rule of every new security group
pub const SSH_PORT: u16 = 22;

/// CIDR allowing access from anywhere
pub const OPEN_CIDR: &str = "0.0.0.0/0";

/// Single-operation wrapper around a cloud compute API.
///
/// Start/stop/terminate only request a transition; the resulting state is
/// observed later through [`ComputeProvider::describe`].
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch one instance and return the provider's instance id
    async fn launch(&self, creds: &ProviderCredentials, request: &LaunchRequest) -> Result<String>;

    async fn describe(
        &self,
        creds: &ProviderCredentials,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription>;

    async fn start(&self, creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()>;

    async fn stop(&self, creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()>;

    async fn terminate(&self, creds: &ProviderCredentials, provider_instance_id: &str)
        -> Result<()>;

    /// Create a security group with a single inbound rule (TCP/22 from anywhere)
    async fn create_security_group(
        &self,
        creds: &ProviderCredentials,
        name: &str,
        description: &str,
    ) -> Result<String>;

    /// Delete a security group. Provider refusals such as "still in use"
    /// are returned to the caller.
    async fn delete_security_group(&self, creds: &ProviderCredentials, group_id: &str)
        -> Result<()>;

    /// List the inbound rules of a security group
    async fn list_ingress_rules(
        &self,
        creds: &ProviderCredentials,
        group_id: &str,
    ) -> Result<Vec<SecurityRule>>;

    /// Revoke every inbound rule of the group, then authorize `rules`.
    ///
    /// An empty `rules` slice leaves the group without inbound access.
    async fn replace_ingress_rules(
        &self,
        creds: &ProviderCredentials,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<()>;

    /// Dry-run an authorized request; `true` only when the provider reports
    /// the dry run would have succeeded.
    async fn validate_credentials(&self, creds: &ProviderCredentials) -> bool;
}

/// Run `authorize` for a freshly created security group. When it fails the
/// group is deleted through `discard` before the authorization error is
/// returned, so no group is left behind without an owner.
pub(crate) async fn discard_on_failure<A, D>(group_id: &str, authorize: A, discard: D) -> Result<()>
where
    A: Future<Output = Result<()>>,
    D: Future<Output = Result<()>>,
{
    let Err(err) = authorize.await else {
        return Ok(());
    };

    match discard.await {
        Ok(()) => info!(group_id, "Deleted security group after failed rule authorization"),
        Err(delete_err) => warn!(
            group_id,
            error = %delete_err,
            "Failed to delete security group after failed rule authorization"
        ),
    }
    Err(err)
}
