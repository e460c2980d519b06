use crate::{
    auth::{check_workspace_access, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Extension, Json, Router,
};
use vm_orchestrator::{
    ActionRequest, ComputeInstance, ProvisionRequest, SecurityRule, SecurityRulesUpdate,
    UpdateSecurityRulesRequest,
};
use vm_ssh::{UpdateResult, UpdateStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces/{ws}/instances",
            get(list_instances).post(provision_instance),
        )
        .route("/api/v1/workspaces/{ws}/instances/{id}", get(get_instance))
        .route(
            "/api/v1/workspaces/{ws}/instances/{id}/actions",
            post(perform_action),
        )
        .route("/api/v1/workspaces/{ws}/instances/{id}/sync", post(sync_instance))
        .route(
            "/api/v1/workspaces/{ws}/instances/{id}/security-rules",
            get(get_security_rules).put(update_security_rules),
        )
        .route(
            "/api/v1/workspaces/{ws}/instances/{id}/updates",
            get(check_for_updates).post(apply_update),
        )
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{ws}/instances",
    tag = "instances",
    params(("ws" = String, Path, description = "Workspace id")),
    responses((status = 200, body = Vec<ComputeInstance>, description = "Newest first"))
)]
pub async fn list_instances(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(ws): Path<String>,
) -> ApiResult<Json<Vec<ComputeInstance>>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.orchestrator.list(&ws).await?))
}

/// Provider failures still return the record, in `ERROR` status
#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{ws}/instances",
    tag = "instances",
    params(("ws" = String, Path, description = "Workspace id")),
    request_body = ProvisionRequest,
    responses(
        (status = 200, body = ComputeInstance),
        (status = 400, description = "Invalid input or no credentials configured"),
    )
)]
pub async fn provision_instance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(ws): Path<String>,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<Json<ComputeInstance>> {
    check_workspace_access(&state, &ws, &user).await?;

    let instance = state.orchestrator.provision(&ws, req).await?;
    Ok(Json(instance))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{ws}/instances/{id}",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    responses((status = 200, body = ComputeInstance), (status = 404, description = "Unknown instance"))
)]
pub async fn get_instance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<Json<ComputeInstance>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.orchestrator.get(&ws, &id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{ws}/instances/{id}/actions",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    request_body = ActionRequest,
    responses(
        (status = 200, body = ComputeInstance),
        (status = 409, description = "Action not allowed from the current status"),
        (status = 502, description = "Provider rejected the request"),
    )
)]
pub async fn perform_action(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Json<ComputeInstance>> {
    check_workspace_access(&state, &ws, &user).await?;

    let instance = state
        .orchestrator
        .perform_action(&ws, &id, req.action)
        .await?;
    Ok(Json(instance))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{ws}/instances/{id}/sync",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    responses(
        (status = 200, body = ComputeInstance),
        (status = 502, description = "Provider describe failed"),
    )
)]
pub async fn sync_instance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<Json<ComputeInstance>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.orchestrator.sync_status(&ws, &id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{ws}/instances/{id}/security-rules",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    responses((status = 200, body = Vec<SecurityRule>))
)]
pub async fn get_security_rules(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<SecurityRule>>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.orchestrator.get_security_rules(&ws, &id).await?))
}

/// Replace the SSH ingress rules. An empty list opens SSH to 0.0.0.0/0.
#[utoipa::path(
    put,
    path = "/api/v1/workspaces/{ws}/instances/{id}/security-rules",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    request_body = UpdateSecurityRulesRequest,
    responses(
        (status = 200, body = SecurityRulesUpdate),
        (status = 400, description = "Invalid CIDR"),
    )
)]
pub async fn update_security_rules(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
    Json(req): Json<UpdateSecurityRulesRequest>,
) -> ApiResult<Json<SecurityRulesUpdate>> {
    check_workspace_access(&state, &ws, &user).await?;

    let update = state
        .orchestrator
        .update_security_rules(&ws, &id, &req.cidrs)
        .await?;
    Ok(Json(update))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{ws}/instances/{id}/updates",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    responses(
        (status = 200, body = UpdateStatus),
        (status = 504, description = "Version probe timed out"),
    )
)]
pub async fn check_for_updates(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<Json<UpdateStatus>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.updates.check_for_updates(&ws, &id).await?))
}

/// Always 200; failures are reported in the body
#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{ws}/instances/{id}/updates",
    tag = "instances",
    params(
        ("ws" = String, Path, description = "Workspace id"),
        ("id" = String, Path, description = "Instance id"),
    ),
    responses((status = 200, body = UpdateResult))
)]
pub async fn apply_update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((ws, id)): Path<(String, String)>,
) -> ApiResult<Json<UpdateResult>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.updates.apply_update(&ws, &id).await))
}
