//! Per-workspace cloud credential storage.
//!
//! Secrets are encrypted before they reach the store and are only decrypted
//! in memory for an outbound provider call.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vm_provider::{ComputeProvider, ProviderCredentials};

use crate::crypto::SecretCipher;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    CloudCredential, CredentialInput, CredentialMetadata, InstanceStatus, MaskedCredential,
};
use crate::store::{CredentialStore, InstanceStore};

/// Number of trailing access-key characters left visible when masking
const VISIBLE_KEY_CHARS: usize = 4;

/// Decrypted credential plus the id of the record it came from
#[derive(Debug, Clone)]
pub struct DecryptedCredential {
    pub credential_id: String,
    pub creds: ProviderCredentials,
}

#[derive(Clone)]
pub struct CredentialVault {
    credentials: Arc<dyn CredentialStore>,
    instances: Arc<dyn InstanceStore>,
    cipher: Arc<dyn SecretCipher>,
    provider: Arc<dyn ComputeProvider>,
}

impl CredentialVault {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        instances: Arc<dyn InstanceStore>,
        cipher: Arc<dyn SecretCipher>,
        provider: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            credentials,
            instances,
            cipher,
            provider,
        }
    }

    /// Validate with a provider dry run, then encrypt and upsert
    #[instrument(skip(self, input), fields(region = %input.region))]
    pub async fn save(
        &self,
        workspace_id: &str,
        input: CredentialInput,
    ) -> Result<CredentialMetadata> {
        if input.access_key_id.trim().is_empty()
            || input.secret_access_key.trim().is_empty()
            || input.region.trim().is_empty()
        {
            return Err(OrchestratorError::BadRequest(
                "access_key_id, secret_access_key and region are required".to_string(),
            ));
        }

        let creds = ProviderCredentials {
            access_key_id: input.access_key_id,
            secret_access_key: input.secret_access_key,
            region: input.region,
        };

        if !self.provider.validate_credentials(&creds).await {
            warn!("Cloud credentials failed dry-run validation");
            return Err(OrchestratorError::InvalidCredentials);
        }

        let access_key_id_encrypted = self.cipher.encrypt(&creds.access_key_id)?;
        let secret_access_key_encrypted = self.cipher.encrypt(&creds.secret_access_key)?;
        let now = Utc::now();

        let candidate = CloudCredential {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            access_key_id_encrypted,
            secret_access_key_encrypted,
            region: creds.region,
            created_at: now,
            updated_at: now,
        };
        let credential = self.credentials.upsert_credential(&candidate).await?;

        if credential.id == candidate.id {
            info!(credential_id = %credential.id, "Stored cloud credentials");
        } else {
            info!(credential_id = %credential.id, "Updated cloud credentials");
        }

        Ok(CredentialMetadata::from(&credential))
    }

    pub async fn get_masked(&self, workspace_id: &str) -> Result<MaskedCredential> {
        let credential = self.find(workspace_id).await?;
        let access_key_id = self.cipher.decrypt(&credential.access_key_id_encrypted)?;

        Ok(MaskedCredential {
            id: credential.id,
            workspace_id: credential.workspace_id,
            access_key_id: mask_key(&access_key_id),
            region: credential.region,
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        })
    }

    /// Plaintext credentials for internal use; never returned over the API
    pub async fn get_decrypted(&self, workspace_id: &str) -> Result<DecryptedCredential> {
        let credential = self.find(workspace_id).await?;

        Ok(DecryptedCredential {
            creds: ProviderCredentials {
                access_key_id: self.cipher.decrypt(&credential.access_key_id_encrypted)?,
                secret_access_key: self
                    .cipher
                    .decrypt(&credential.secret_access_key_encrypted)?,
                region: credential.region,
            },
            credential_id: credential.id,
        })
    }

    /// Refused while any instance created with the credential is still active
    #[instrument(skip(self))]
    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        let credential = self.find(workspace_id).await?;

        let active = self
            .instances
            .count_instances_by_status(&credential.id, &InstanceStatus::ACTIVE)
            .await?;
        if active > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "{} instance(s) still use these credentials; terminate them first",
                active
            )));
        }

        self.credentials.delete_credential(&credential.id).await?;
        info!(credential_id = %credential.id, "Deleted cloud credentials");
        Ok(())
    }

    async fn find(&self, workspace_id: &str) -> Result<CloudCredential> {
        self.credentials
            .find_credential(workspace_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "cloud credentials for workspace {}",
                    workspace_id
                ))
            })
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= VISIBLE_KEY_CHARS {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - VISIBLE_KEY_CHARS..].iter().collect();
    format!("****{}", tail)
}
