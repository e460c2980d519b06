use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use vm_orchestrator::{
    AccessDirectory, AesGcmCipher, ApiKeyVerifier, CredentialVault, InstanceOrchestrator,
    SecretCipher, SqliteAccessDirectory, SqliteStore, TokenVerifier,
};
use vm_provider::{ComputeProvider, Ec2Provider};
use vm_ssh::{
    RemoteCommandExecutor, RusshConnector, SshConnector, TerminalProxy, UpdateService,
};

use crate::config::Config;

/// External collaborators the service is assembled from
pub struct Collaborators {
    pub provider: Arc<dyn ComputeProvider>,
    pub ssh: Arc<dyn SshConnector>,
    pub cipher: Arc<dyn SecretCipher>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl Collaborators {
    /// EC2, russh, an AES-GCM cipher derived from the master key and the
    /// configured API tokens
    pub fn production(config: &Config) -> Result<Self> {
        let salt = config.key_salt()?;
        let cipher = AesGcmCipher::derive_from_password(config.master_key()?, &salt)
            .context("Failed to derive credential cipher")?;
        let verifier = ApiKeyVerifier::from_pairs(&config.api_tokens)
            .context("Failed to parse VM_API_TOKENS")?;

        let provider = match &config.ec2_endpoint {
            Some(endpoint) => Ec2Provider::with_endpoint(endpoint.clone()),
            None => Ec2Provider::new(),
        };

        Ok(Self {
            provider: Arc::new(provider),
            ssh: Arc::new(RusshConnector::new(config.ssh_settings().connect_timeout)),
            cipher: Arc::new(cipher),
            verifier: Arc::new(verifier),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub orchestrator: InstanceOrchestrator,
    pub directory: Arc<dyn AccessDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub updates: UpdateService,
    pub terminal: TerminalProxy,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            provider,
            ssh,
            cipher,
            verifier,
        } = collaborators;

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let directory: Arc<dyn AccessDirectory> =
            Arc::new(SqliteAccessDirectory::new(pool.clone()));

        let vault = CredentialVault::new(
            store.clone(),
            store.clone(),
            cipher.clone(),
            provider.clone(),
        );
        let orchestrator = InstanceOrchestrator::new(
            store,
            vault,
            cipher,
            provider,
            config.orchestrator_settings(),
        );

        let ssh_settings = config.ssh_settings();
        let lookup = Arc::new(orchestrator.clone());
        let executor = RemoteCommandExecutor::new(ssh.clone(), ssh_settings.clone())
            .with_default_timeout(config.command_timeout());
        let updates = UpdateService::new(lookup.clone(), executor, config.update_settings());
        let terminal = TerminalProxy::new(
            verifier.clone(),
            directory.clone(),
            lookup,
            ssh,
            ssh_settings,
        );

        Self {
            pool,
            orchestrator,
            directory,
            verifier,
            updates,
            terminal,
        }
    }
}
