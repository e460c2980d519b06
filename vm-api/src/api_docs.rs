use utoipa::OpenApi;
use vm_orchestrator::{
    ActionRequest, ComputeInstance, CredentialInput, CredentialMetadata, InstanceAction,
    InstanceStatus, MaskedCredential, ProvisionRequest, SecurityRule, SecurityRulesUpdate,
    UpdateSecurityRulesRequest,
};
use vm_ssh::{UpdateResult, UpdateStatus};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::credentials::save_credentials,
        crate::routes::credentials::get_credentials,
        crate::routes::credentials::delete_credentials,
        crate::routes::instances::list_instances,
        crate::routes::instances::provision_instance,
        crate::routes::instances::get_instance,
        crate::routes::instances::perform_action,
        crate::routes::instances::sync_instance,
        crate::routes::instances::get_security_rules,
        crate::routes::instances::update_security_rules,
        crate::routes::instances::check_for_updates,
        crate::routes::instances::apply_update,
    ),
    components(
        schemas(
            CredentialInput,
            CredentialMetadata,
            MaskedCredential,
            ComputeInstance,
            InstanceStatus,
            InstanceAction,
            ProvisionRequest,
            ActionRequest,
            SecurityRule,
            UpdateSecurityRulesRequest,
            SecurityRulesUpdate,
            UpdateStatus,
            UpdateResult
        )
    ),
    tags(
        (name = "vm-api", description = "Cloud workspace instance API"),
        (name = "credentials", description = "Per-workspace cloud credentials"),
        (name = "instances", description = "Instance lifecycle, firewall rules and agent updates"),
        (name = "health", description = "Liveness and readiness")
    )
)]
pub struct ApiDoc;
