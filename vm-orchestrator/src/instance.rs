//! Instance lifecycle: provisioning, user actions and reconciliation against
//! the provider.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vm_core::validation::{validate_integration_name, validate_ipv4_cidr, validate_repo_url};
use vm_provider::{
    ComputeProvider, InstanceDescription, LaunchRequest, ProviderCredentials, ProviderState,
    SecurityRule, OPEN_CIDR,
};

use crate::boot_script::build_boot_script;
use crate::crypto::SecretCipher;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    ComputeInstance, InstanceAction, InstanceStatus, ProvisionRequest, SecurityRulesUpdate,
};
use crate::reconcile::ReconcileScheduler;
use crate::store::InstanceStore;
use crate::vault::{CredentialVault, DecryptedCredential};

/// Stored on a record whose instance died before it ever became ready
pub const TERMINATED_BEFORE_READY: &str = "instance terminated before becoming ready";

/// Stored on a record left half-provisioned by a restart
pub const PROVISIONING_INTERRUPTED: &str = "provisioning interrupted before the instance was launched";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Machine image launched for every instance
    pub image_id: String,
    /// Provider key pair attached at launch
    pub key_name: Option<String>,
    pub poll_interval: Duration,
    /// Maximum number of reconciliation polls after a launch or start
    pub poll_attempts: u32,
    /// Extra command appended to the boot script
    pub bootstrap_command: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            image_id: "ami-0c7217cdde317cfec".to_string(),
            key_name: None,
            poll_interval: Duration::from_secs(10),
            poll_attempts: 30,
            bootstrap_command: None,
        }
    }
}

/// Owns the instance records and their state machine
#[derive(Clone)]
pub struct InstanceOrchestrator {
    instances: Arc<dyn InstanceStore>,
    vault: CredentialVault,
    cipher: Arc<dyn SecretCipher>,
    provider: Arc<dyn ComputeProvider>,
    scheduler: ReconcileScheduler,
    settings: Arc<OrchestratorSettings>,
}

impl InstanceOrchestrator {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        vault: CredentialVault,
        cipher: Arc<dyn SecretCipher>,
        provider: Arc<dyn ComputeProvider>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            instances,
            vault,
            cipher,
            provider,
            scheduler: ReconcileScheduler::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn scheduler(&self) -> &ReconcileScheduler {
        &self.scheduler
    }

    /// Provision a new instance.
    ///
    /// Input is validated before anything is stored. From then on the record
    /// is always returned: provider failures leave it in `ERROR` with the
    /// provider's message instead of failing the call.
    #[instrument(skip(self, request), fields(instance_type = %request.instance_type))]
    pub async fn provision(
        &self,
        workspace_id: &str,
        request: ProvisionRequest,
    ) -> Result<ComputeInstance> {
        let credential = self.credentials_for(workspace_id).await?;

        if request.instance_type.trim().is_empty() {
            return Err(OrchestratorError::BadRequest(
                "instance_type is required".to_string(),
            ));
        }
        validate_repo_url(&request.repo_url)?;
        for name in &request.integrations {
            validate_integration_name(name)?;
        }

        let deploy_token = request.deploy_token.as_deref().filter(|t| !t.is_empty());
        let deploy_token_encrypted = deploy_token
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        let now = Utc::now();
        let mut instance = ComputeInstance {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            credential_id: credential.credential_id.clone(),
            status: InstanceStatus::Provisioning,
            instance_type: request.instance_type.clone(),
            region: credential.creds.region.clone(),
            repo_url: request.repo_url.clone(),
            deploy_token_encrypted,
            integrations: request.integrations.clone(),
            provider_instance_id: None,
            security_group_id: None,
            public_ip: None,
            error_message: None,
            launched_at: None,
            created_at: now,
            updated_at: now,
        };
        self.instances.create_instance(&instance).await?;
        info!(instance_id = %instance.id, "Created instance record");

        match self
            .launch_resources(&mut instance, &credential.creds, &request, deploy_token)
            .await
        {
            Ok(()) => {
                info!(
                    instance_id = %instance.id,
                    provider_instance_id = ?instance.provider_instance_id,
                    "Instance launched"
                );
                self.schedule_reconciliation(&instance);
            }
            Err(e) => {
                error!(instance_id = %instance.id, "Provisioning failed: {}", e);
                instance.status = InstanceStatus::Error;
                instance.error_message = Some(e.to_string());
                instance.updated_at = Utc::now();
                self.instances.update_instance(&instance).await?;
            }
        }

        Ok(instance)
    }

    async fn launch_resources(
        &self,
        instance: &mut ComputeInstance,
        creds: &ProviderCredentials,
        request: &ProvisionRequest,
        deploy_token: Option<&str>,
    ) -> Result<()> {
        let name = format!("workspace-{}", instance.id);

        let group_id = self
            .provider
            .create_security_group(
                creds,
                &name,
                &format!("SSH access for workspace instance {}", instance.id),
            )
            .await?;
        instance.security_group_id = Some(group_id.clone());
        instance.updated_at = Utc::now();
        self.instances.update_instance(instance).await?;

        let init_script = build_boot_script(
            &request.repo_url,
            deploy_token,
            &request.integrations,
            self.settings.bootstrap_command.as_deref(),
        )?;

        let provider_instance_id = self
            .provider
            .launch(
                creds,
                &LaunchRequest {
                    name,
                    instance_type: request.instance_type.clone(),
                    image_id: self.settings.image_id.clone(),
                    security_group_id: group_id,
                    key_name: self.settings.key_name.clone(),
                    init_script: Some(init_script),
                },
            )
            .await?;
        instance.provider_instance_id = Some(provider_instance_id);
        instance.updated_at = Utc::now();
        self.instances.update_instance(instance).await?;

        Ok(())
    }

    /// Records of a workspace, newest first, as stored
    pub async fn list(&self, workspace_id: &str) -> Result<Vec<ComputeInstance>> {
        self.instances.list_instances(workspace_id).await
    }

    /// Stored record, refreshed from the provider first unless final.
    /// A failed refresh returns the last known record.
    pub async fn get(&self, workspace_id: &str, id: &str) -> Result<ComputeInstance> {
        let instance = self.find(workspace_id, id).await?;

        if instance.status.is_terminal() || instance.provider_instance_id.is_none() {
            return Ok(instance);
        }

        match self.refresh(instance.clone()).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                warn!(instance_id = %id, "Status refresh failed: {}", e);
                Ok(instance)
            }
        }
    }

    /// One explicit reconciliation; provider errors are returned
    #[instrument(skip(self))]
    pub async fn sync_status(&self, workspace_id: &str, id: &str) -> Result<ComputeInstance> {
        let instance = self.find(workspace_id, id).await?;

        if instance.provider_instance_id.is_none() {
            return Err(OrchestratorError::BadRequest(
                "instance has not been launched".to_string(),
            ));
        }
        if instance.status.is_terminal() {
            return Ok(instance);
        }

        self.refresh(instance).await
    }

    /// Request a transition from the provider and record the target status
    /// without waiting for the provider to reach it.
    #[instrument(skip(self))]
    pub async fn perform_action(
        &self,
        workspace_id: &str,
        id: &str,
        action: InstanceAction,
    ) -> Result<ComputeInstance> {
        let mut instance = self.find(workspace_id, id).await?;

        let provider_instance_id = instance.provider_instance_id.clone().ok_or_else(|| {
            OrchestratorError::BadRequest("instance has not been launched".to_string())
        })?;

        let target = action.target_status();
        if !action.allowed_from(instance.status) {
            return Err(OrchestratorError::Conflict(format!(
                "cannot {} an instance that is {}",
                action, instance.status
            )));
        }

        let credential = self.credentials_for(workspace_id).await?;
        let creds = &credential.creds;

        match action {
            InstanceAction::Start => self.provider.start(creds, &provider_instance_id).await?,
            InstanceAction::Stop => self.provider.stop(creds, &provider_instance_id).await?,
            InstanceAction::Terminate => {
                self.provider
                    .terminate(creds, &provider_instance_id)
                    .await?
            }
        }

        instance.status = target;
        instance.updated_at = Utc::now();
        if action != InstanceAction::Start {
            instance.public_ip = None;
        }
        self.instances.update_instance(&instance).await?;
        info!(instance_id = %id, status = %target, "Requested {} from provider", action);

        match action {
            InstanceAction::Start => self.schedule_reconciliation(&instance),
            // Polling from an earlier start must not outlive the stop
            InstanceAction::Stop => {
                self.scheduler.cancel(&instance.id);
            }
            InstanceAction::Terminate => {
                self.scheduler.cancel(&instance.id);
                if let Some(group_id) = &instance.security_group_id {
                    if let Err(e) = self.provider.delete_security_group(creds, group_id).await {
                        warn!(
                            instance_id = %id,
                            security_group_id = %group_id,
                            "Failed to delete security group: {}",
                            e
                        );
                    }
                }
            }
        }

        Ok(instance)
    }

    pub async fn get_security_rules(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<Vec<SecurityRule>> {
        let instance = self.find(workspace_id, id).await?;
        let group_id = require_security_group(&instance)?;
        let credential = self.credentials_for(workspace_id).await?;

        Ok(self
            .provider
            .list_ingress_rules(&credential.creds, group_id)
            .await?)
    }

    /// Replace the SSH ingress set with one rule per CIDR.
    ///
    /// No CIDRs means SSH open to 0.0.0.0/0; the result flags it.
    #[instrument(skip(self))]
    pub async fn update_security_rules(
        &self,
        workspace_id: &str,
        id: &str,
        cidrs: &[String],
    ) -> Result<SecurityRulesUpdate> {
        let instance = self.find(workspace_id, id).await?;
        let group_id = require_security_group(&instance)?;

        let mut unique: Vec<&str> = Vec::with_capacity(cidrs.len());
        for cidr in cidrs.iter().map(|c| c.trim()) {
            validate_ipv4_cidr(cidr)?;
            if !unique.contains(&cidr) {
                unique.push(cidr);
            }
        }

        let open_to_world = unique.is_empty();
        let rules: Vec<SecurityRule> = if open_to_world {
            warn!(instance_id = %id, "No CIDRs supplied, opening SSH to {}", OPEN_CIDR);
            vec![SecurityRule::ssh(OPEN_CIDR, "SSH access")]
        } else {
            unique
                .into_iter()
                .map(|cidr| SecurityRule::ssh(cidr, format!("SSH access from {}", cidr)))
                .collect()
        };

        let credential = self.credentials_for(workspace_id).await?;
        self.provider
            .replace_ingress_rules(&credential.creds, group_id, &rules)
            .await?;
        info!(instance_id = %id, rules = rules.len(), "Replaced ingress rules");

        Ok(SecurityRulesUpdate {
            rules,
            open_to_world,
        })
    }

    /// Restart polling for records still `PROVISIONING` after a restart.
    /// Records that never reached the provider are marked `ERROR`.
    pub async fn resume_reconciliation(&self) -> Result<usize> {
        let pending = self
            .instances
            .list_instances_by_status(InstanceStatus::Provisioning)
            .await?;

        let mut resumed = 0;
        for mut instance in pending {
            if instance.provider_instance_id.is_some() {
                self.schedule_reconciliation(&instance);
                resumed += 1;
            } else {
                instance.status = InstanceStatus::Error;
                instance.error_message = Some(PROVISIONING_INTERRUPTED.to_string());
                instance.updated_at = Utc::now();
                self.instances.update_instance(&instance).await?;
            }
        }

        if resumed > 0 {
            info!("Resumed reconciliation for {} instance(s)", resumed);
        }
        Ok(resumed)
    }

    fn schedule_reconciliation(&self, instance: &ComputeInstance) {
        let this = self.clone();
        let workspace_id = instance.workspace_id.clone();
        let id = instance.id.clone();

        self.scheduler.schedule(&instance.id, async move {
            this.poll_until_settled(&workspace_id, &id).await;
        });
    }

    async fn poll_until_settled(&self, workspace_id: &str, id: &str) {
        for attempt in 1..=self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;

            let instance = match self.find(workspace_id, id).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(instance_id = %id, attempt, "Reconciliation lookup failed: {}", e);
                    continue;
                }
            };
            if instance.status.is_terminal() {
                return;
            }

            match self.refresh(instance).await {
                Ok(instance) if settled(&instance) => {
                    debug!(instance_id = %id, status = %instance.status, attempt, "Instance settled");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(instance_id = %id, attempt, "Reconciliation poll failed: {}", e),
            }
        }

        debug!(instance_id = %id, "Reconciliation attempt budget exhausted");
    }

    /// Describe the instance and persist whatever changed
    async fn refresh(&self, mut instance: ComputeInstance) -> Result<ComputeInstance> {
        let Some(provider_instance_id) = instance.provider_instance_id.clone() else {
            return Ok(instance);
        };

        let credential = self.credentials_for(&instance.workspace_id).await?;
        let description = self
            .provider
            .describe(&credential.creds, &provider_instance_id)
            .await?;

        if apply_observation(&mut instance, &description) {
            instance.updated_at = Utc::now();
            self.instances.update_instance(&instance).await?;
        }

        Ok(instance)
    }

    async fn find(&self, workspace_id: &str, id: &str) -> Result<ComputeInstance> {
        self.instances
            .find_instance(workspace_id, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {}", id)))
    }

    async fn credentials_for(&self, workspace_id: &str) -> Result<DecryptedCredential> {
        self.vault
            .get_decrypted(workspace_id)
            .await
            .map_err(|e| match e {
                OrchestratorError::NotFound(_) => OrchestratorError::BadRequest(
                    "no cloud credentials configured for this workspace".to_string(),
                ),
                other => other,
            })
    }
}

fn require_security_group(instance: &ComputeInstance) -> Result<&str> {
    instance.security_group_id.as_deref().ok_or_else(|| {
        OrchestratorError::BadRequest("instance has no security group".to_string())
    })
}

fn settled(instance: &ComputeInstance) -> bool {
    instance.status.is_terminal()
        || (instance.status == InstanceStatus::Running && instance.public_ip.is_some())
}

fn map_provider_state(state: &ProviderState) -> Option<InstanceStatus> {
    match state {
        ProviderState::Running => Some(InstanceStatus::Running),
        ProviderState::Stopped => Some(InstanceStatus::Stopped),
        ProviderState::Terminated | ProviderState::ShuttingDown => Some(InstanceStatus::Terminated),
        ProviderState::Pending => Some(InstanceStatus::Provisioning),
        ProviderState::Stopping | ProviderState::Other(_) => None,
    }
}

/// Fold a provider observation into the record. Status changes outside the
/// state machine are skipped; the public address is always taken over.
/// Returns whether anything changed.
fn apply_observation(instance: &mut ComputeInstance, description: &InstanceDescription) -> bool {
    let mut changed = false;

    if let Some(observed) = description.state.as_ref().and_then(map_provider_state) {
        let next = if instance.status == InstanceStatus::Provisioning
            && observed == InstanceStatus::Terminated
        {
            InstanceStatus::Error
        } else {
            observed
        };

        if next != instance.status {
            if instance.status.can_transition_to(next) {
                debug!(instance_id = %instance.id, from = %instance.status, to = %next, "Status changed");
                if next == InstanceStatus::Error {
                    instance.error_message = Some(TERMINATED_BEFORE_READY.to_string());
                }
                instance.status = next;
                changed = true;
            } else {
                debug!(
                    instance_id = %instance.id,
                    from = %instance.status,
                    to = %next,
                    "Ignoring observed status outside the state machine"
                );
            }
        }
    }

    if instance.status == InstanceStatus::Running && instance.launched_at.is_none() {
        instance.launched_at = Some(Utc::now());
        changed = true;
    }

    if instance.public_ip != description.public_ip {
        instance.public_ip = description.public_ip.clone();
        changed = true;
    }

    changed
}
