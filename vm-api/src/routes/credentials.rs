use crate::{
    auth::{check_workspace_access, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::get,
    Extension, Json, Router,
};
use serde_json::{json, Value};
use vm_orchestrator::{CredentialInput, CredentialMetadata, MaskedCredential};

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/v1/workspaces/{ws}/credentials",
        get(get_credentials)
            .put(save_credentials)
            .delete(delete_credentials),
    )
}

/// Validate the keys with a provider dry run, then store them encrypted
#[utoipa::path(
    put,
    path = "/api/v1/workspaces/{ws}/credentials",
    tag = "credentials",
    params(("ws" = String, Path, description = "Workspace id")),
    request_body = CredentialInput,
    responses(
        (status = 200, body = CredentialMetadata),
        (status = 400, description = "Missing fields or keys rejected by the provider"),
    )
)]
pub async fn save_credentials(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(ws): Path<String>,
    Json(input): Json<CredentialInput>,
) -> ApiResult<Json<CredentialMetadata>> {
    check_workspace_access(&state, &ws, &user).await?;

    let metadata = state.orchestrator.vault().save(&ws, input).await?;
    Ok(Json(metadata))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{ws}/credentials",
    tag = "credentials",
    params(("ws" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = MaskedCredential),
        (status = 404, description = "No credentials saved for the workspace"),
    )
)]
pub async fn get_credentials(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(ws): Path<String>,
) -> ApiResult<Json<MaskedCredential>> {
    check_workspace_access(&state, &ws, &user).await?;

    Ok(Json(state.orchestrator.vault().get_masked(&ws).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/workspaces/{ws}/credentials",
    tag = "credentials",
    params(("ws" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, description = "Credentials deleted"),
        (status = 409, description = "Instances still use the credentials"),
    )
)]
pub async fn delete_credentials(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(ws): Path<String>,
) -> ApiResult<Json<Value>> {
    check_workspace_access(&state, &ws, &user).await?;

    state.orchestrator.vault().delete(&ws).await?;
    Ok(Json(json!({ "message": "Credentials deleted" })))
}
