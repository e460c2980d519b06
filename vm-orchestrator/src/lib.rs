//! Instance orchestration business logic
//!
//! This crate contains the core business logic for provisioning and tracking
//! short-lived cloud instances on behalf of a workspace: the credential
//! vault, the instance lifecycle state machine and its background
//! reconciliation. It is consumed by the vm-api HTTP service and by the
//! SSH services in vm-ssh.

pub mod access;
pub mod boot_script;
pub mod crypto;
pub mod db;
pub mod error;
pub mod instance;
pub mod models;
pub mod reconcile;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod vault;

pub use access::{AccessDirectory, ApiKeyVerifier, SqliteAccessDirectory, TokenVerifier, UserIdentity};
pub use crypto::{AesGcmCipher, SecretCipher};
pub use db::SqliteStore;
pub use error::{OrchestratorError, Result};
pub use instance::{InstanceOrchestrator, OrchestratorSettings};
pub use models::{
    ActionRequest, CloudCredential, ComputeInstance, CredentialInput, CredentialMetadata,
    InstanceAction, InstanceStatus, MaskedCredential, ProvisionRequest, SecurityRulesUpdate,
    UpdateSecurityRulesRequest,
};
pub use reconcile::ReconcileScheduler;
pub use store::{CredentialStore, InstanceStore};
pub use vault::{CredentialVault, DecryptedCredential};
pub use vm_provider::SecurityRule;
