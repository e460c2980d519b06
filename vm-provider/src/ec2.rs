//! EC2 implementation of [`ComputeProvider`].

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::types::{
    Filter, InstanceStateName, InstanceType, IpPermission, IpRange, ResourceType, Tag,
    TagSpecification,
};
use aws_sdk_ec2::Client;
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, info, instrument, warn};

use crate::error::{dry_run_authorized, ProviderError, Result};
use crate::types::{
    InstanceDescription, LaunchRequest, ProviderCredentials, ProviderState, SecurityRule,
};
use crate::{discard_on_failure, ComputeProvider, OPEN_CIDR, SSH_PORT};

/// Name reported by the static credentials provider
const CREDENTIALS_SOURCE: &str = "vm-credential-vault";

/// EC2-backed compute provider.
///
/// Holds no client: each operation builds an [`Ec2Session`] from the
/// supplied credentials and drops it before returning.
#[derive(Debug, Clone, Default)]
pub struct Ec2Provider {
    endpoint_url: Option<String>,
}

/// Provider session scoped to one operation.
///
/// The SDK client and its connection pool are released when the session is
/// dropped, on success, error and early return alike.
struct Ec2Session {
    client: Client,
    operation: &'static str,
}

impl Drop for Ec2Session {
    fn drop(&mut self) {
        debug!(operation = self.operation, "Released provider session");
    }
}

impl Ec2Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send requests to a custom endpoint (e.g. a local EC2 emulator)
    pub fn with_endpoint(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.into()),
        }
    }

    async fn session(&self, creds: &ProviderCredentials, operation: &'static str) -> Ec2Session {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(creds.region.clone()))
            .credentials_provider(Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                CREDENTIALS_SOURCE,
            ));

        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let config = loader.load().await;
        debug!(operation, region = %creds.region, "Opened provider session");

        Ec2Session {
            client: Client::new(&config),
            operation,
        }
    }

    fn map_state(name: &InstanceStateName) -> ProviderState {
        match name {
            InstanceStateName::Pending => ProviderState::Pending,
            InstanceStateName::Running => ProviderState::Running,
            InstanceStateName::ShuttingDown => ProviderState::ShuttingDown,
            InstanceStateName::Terminated => ProviderState::Terminated,
            InstanceStateName::Stopping => ProviderState::Stopping,
            InstanceStateName::Stopped => ProviderState::Stopped,
            other => ProviderState::Other(other.as_str().to_string()),
        }
    }

    fn ip_permission(rule: &SecurityRule) -> IpPermission {
        let mut range = IpRange::builder().cidr_ip(&rule.cidr);
        if let Some(description) = &rule.description {
            range = range.description(description);
        }

        IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(i32::from(rule.port))
            .to_port(i32::from(rule.port))
            .ip_ranges(range.build())
            .build()
    }

    async fn authorize_rules(
        session: &Ec2Session,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }

        session
            .client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(rules.iter().map(Self::ip_permission).collect()))
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        Ok(())
    }

    async fn delete_group(session: &Ec2Session, group_id: &str) -> Result<()> {
        session
            .client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        Ok(())
    }
}

#[async_trait]
impl ComputeProvider for Ec2Provider {
    #[instrument(skip(self, creds), fields(region = %creds.region))]
    async fn launch(&self, creds: &ProviderCredentials, request: &LaunchRequest) -> Result<String> {
        let session = self.session(creds, "run_instances").await;

        let name_tag = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(Tag::builder().key("Name").value(&request.name).build())
            .build();

        let mut call = session
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .security_group_ids(&request.security_group_id)
            .tag_specifications(name_tag);

        if let Some(key_name) = &request.key_name {
            call = call.key_name(key_name);
        }
        if let Some(script) = &request.init_script {
            call = call.user_data(STANDARD.encode(script));
        }

        let output = call.send().await.map_err(ProviderError::from_sdk)?;

        let instance_id = output
            .instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .map(str::to_string)
            .ok_or(ProviderError::MissingField("instance id"))?;

        info!(instance_id = %instance_id, "Instance launch requested");
        Ok(instance_id)
    }

    #[instrument(skip(self, creds))]
    async fn describe(
        &self,
        creds: &ProviderCredentials,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription> {
        let session = self.session(creds, "describe_instances").await;

        let output = session
            .client
            .describe_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        let description = output
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .find(|instance| instance.instance_id() == Some(provider_instance_id))
            .map(|instance| InstanceDescription {
                state: instance
                    .state()
                    .and_then(|state| state.name())
                    .map(Self::map_state),
                public_ip: instance.public_ip_address().map(str::to_string),
            })
            .unwrap_or_default();

        Ok(description)
    }

    #[instrument(skip(self, creds))]
    async fn start(&self, creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()> {
        let session = self.session(creds, "start_instances").await;
        session
            .client
            .start_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        info!("Instance start requested");
        Ok(())
    }

    #[instrument(skip(self, creds))]
    async fn stop(&self, creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()> {
        let session = self.session(creds, "stop_instances").await;
        session
            .client
            .stop_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        info!("Instance stop requested");
        Ok(())
    }

    #[instrument(skip(self, creds))]
    async fn terminate(
        &self,
        creds: &ProviderCredentials,
        provider_instance_id: &str,
    ) -> Result<()> {
        let session = self.session(creds, "terminate_instances").await;
        session
            .client
            .terminate_instances()
            .instance_ids(provider_instance_id)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        info!("Instance termination requested");
        Ok(())
    }

    #[instrument(skip(self, creds, description))]
    async fn create_security_group(
        &self,
        creds: &ProviderCredentials,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let session = self.session(creds, "create_security_group").await;

        let output = session
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        let group_id = output
            .group_id()
            .map(str::to_string)
            .ok_or(ProviderError::MissingField("security group id"))?;

        discard_on_failure(
            &group_id,
            Self::authorize_rules(
                &session,
                &group_id,
                &[SecurityRule::ssh(OPEN_CIDR, "SSH access")],
            ),
            Self::delete_group(&session, &group_id),
        )
        .await?;

        info!(group_id = %group_id, port = SSH_PORT, "Security group created");
        Ok(group_id)
    }

    #[instrument(skip(self, creds))]
    async fn delete_security_group(
        &self,
        creds: &ProviderCredentials,
        group_id: &str,
    ) -> Result<()> {
        let session = self.session(creds, "delete_security_group").await;
        Self::delete_group(&session, group_id).await?;

        info!("Security group deleted");
        Ok(())
    }

    #[instrument(skip(self, creds))]
    async fn list_ingress_rules(
        &self,
        creds: &ProviderCredentials,
        group_id: &str,
    ) -> Result<Vec<SecurityRule>> {
        let session = self.session(creds, "describe_security_group_rules").await;

        let output = session
            .client
            .describe_security_group_rules()
            .filters(Filter::builder().name("group-id").values(group_id).build())
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        let rules = output
            .security_group_rules()
            .iter()
            .filter(|rule| rule.is_egress() != Some(true))
            .filter_map(|rule| {
                let port = rule.from_port().and_then(|p| u16::try_from(p).ok())?;
                let cidr = rule.cidr_ipv4().or(rule.cidr_ipv6())?;
                Some(SecurityRule {
                    port,
                    cidr: cidr.to_string(),
                    description: rule.description().map(str::to_string),
                })
            })
            .collect();

        Ok(rules)
    }

    #[instrument(skip(self, creds, rules), fields(rule_count = rules.len()))]
    async fn replace_ingress_rules(
        &self,
        creds: &ProviderCredentials,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<()> {
        let session = self.session(creds, "replace_ingress_rules").await;

        let existing = session
            .client
            .describe_security_group_rules()
            .filters(Filter::builder().name("group-id").values(group_id).build())
            .send()
            .await
            .map_err(ProviderError::from_sdk)?;

        let ingress_ids: Vec<String> = existing
            .security_group_rules()
            .iter()
            .filter(|rule| rule.is_egress() != Some(true))
            .filter_map(|rule| rule.security_group_rule_id().map(str::to_string))
            .collect();

        if !ingress_ids.is_empty() {
            debug!(count = ingress_ids.len(), "Revoking existing ingress rules");
            session
                .client
                .revoke_security_group_ingress()
                .group_id(group_id)
                .set_security_group_rule_ids(Some(ingress_ids))
                .send()
                .await
                .map_err(ProviderError::from_sdk)?;
        }

        Self::authorize_rules(&session, group_id, rules).await?;

        if rules.is_empty() {
            warn!("Security group left without inbound rules");
        }
        Ok(())
    }

    #[instrument(skip(self, creds), fields(region = %creds.region))]
    async fn validate_credentials(&self, creds: &ProviderCredentials) -> bool {
        let session = self.session(creds, "validate_credentials").await;

        let result = session
            .client
            .describe_instances()
            .dry_run(true)
            .send()
            .await
            .map(|_| ())
            .map_err(ProviderError::from_sdk);

        dry_run_authorized(result)
    }
}
