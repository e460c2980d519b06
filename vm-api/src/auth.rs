use crate::{error::ApiError, state::AppState};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use vm_orchestrator::{access::authorize_workspace, UserIdentity};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

impl AuthenticatedUser {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            user_id: self.user_id.clone(),
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
}

/// Auth middleware - resolves the bearer token to a user
///
/// Requests without a valid token are rejected with 401 before reaching
/// any handler.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let identity = state
        .verifier
        .verify(token)
        .ok_or_else(|| ApiError::Unauthorized("Invalid bearer token".to_string()))?;

    req.extensions_mut().insert(AuthenticatedUser {
        user_id: identity.user_id,
    });

    Ok(next.run(req).await)
}

/// Check the authenticated user belongs to the workspace's organization
///
/// Returns:
/// - ApiError::NotFound if the workspace doesn't exist
/// - ApiError::Forbidden if the user is not a member of its organization
pub async fn check_workspace_access(
    state: &AppState,
    workspace_id: &str,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    authorize_workspace(state.directory.as_ref(), &user.identity(), workspace_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("bearer  abc123 ")), Some("abc123"));
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
