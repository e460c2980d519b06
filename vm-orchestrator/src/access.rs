//! Caller identity and workspace membership checks.
//!
//! Bearer tokens resolve to a user id through a [`TokenVerifier`]; the
//! [`AccessDirectory`] answers which organization owns a workspace and
//! whether a user belongs to it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::error::{OrchestratorError, Result};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<UserIdentity>;
}

/// Verifies static API keys. Only SHA-256 digests of the keys are kept.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyVerifier {
    keys: HashMap<[u8; 32], String>,
}

impl ApiKeyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `token=user_id` pairs separated by commas.
    /// Malformed entries are rejected rather than skipped.
    pub fn from_pairs(pairs: &str) -> Result<Self> {
        let mut verifier = Self::new();

        for entry in pairs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, user_id) = entry
                .split_once('=')
                .map(|(t, u)| (t.trim(), u.trim()))
                .filter(|(t, u)| !t.is_empty() && !u.is_empty())
                .ok_or_else(|| {
                    OrchestratorError::BadRequest(
                        "API tokens must be given as token=user_id".to_string(),
                    )
                })?;
            verifier.insert(token, user_id);
        }

        Ok(verifier)
    }

    pub fn insert(&mut self, token: &str, user_id: &str) {
        self.keys.insert(digest(token), user_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TokenVerifier for ApiKeyVerifier {
    fn verify(&self, token: &str) -> Option<UserIdentity> {
        self.keys.get(&digest(token)).map(|user_id| UserIdentity {
            user_id: user_id.clone(),
        })
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Delegated authorization collaborator
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Organization that owns `workspace_id`, or `None` if the workspace is unknown
    async fn workspace_organization(&self, workspace_id: &str) -> Result<Option<String>>;

    async fn is_member(&self, user_id: &str, organization_id: &str) -> Result<bool>;
}

/// Fails `NotFound` for an unknown workspace and `Forbidden` for a non-member
pub async fn authorize_workspace(
    directory: &dyn AccessDirectory,
    user: &UserIdentity,
    workspace_id: &str,
) -> Result<()> {
    let organization_id = directory
        .workspace_organization(workspace_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {}", workspace_id)))?;

    if !directory.is_member(&user.user_id, &organization_id).await? {
        return Err(OrchestratorError::Forbidden(format!(
            "not a member of the organization owning workspace {}",
            workspace_id
        )));
    }

    Ok(())
}

#[derive(Clone)]
pub struct SqliteAccessDirectory {
    pool: SqlitePool,
}

impl SqliteAccessDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_workspace(&self, workspace_id: &str, organization_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspaces (id, organization_id) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET organization_id = excluded.organization_id",
        )
        .bind(workspace_id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_member(&self, organization_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO organization_members (organization_id, user_id) VALUES (?, ?)",
        )
        .bind(organization_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl AccessDirectory for SqliteAccessDirectory {
    async fn workspace_organization(&self, workspace_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT organization_id FROM workspaces WHERE id = ?")
                .bind(workspace_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(org,)| org))
    }

    async fn is_member(&self, user_id: &str, organization_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM organization_members WHERE organization_id = ? AND user_id = ?",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    #[test]
    fn test_api_keys_resolve_to_users() {
        let verifier = ApiKeyVerifier::from_pairs("tok-a=alice, tok-b=bob").unwrap();

        assert_eq!(verifier.len(), 2);
        assert_eq!(verifier.verify("tok-a").unwrap().user_id, "alice");
        assert_eq!(verifier.verify("tok-b").unwrap().user_id, "bob");
        assert!(verifier.verify("tok-c").is_none());
        assert!(verifier.verify("").is_none());
    }

    #[test]
    fn test_malformed_pairs_are_rejected() {
        assert!(ApiKeyVerifier::from_pairs("just-a-token").is_err());
        assert!(ApiKeyVerifier::from_pairs("=alice").is_err());
        assert!(ApiKeyVerifier::from_pairs("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authorize_workspace() {
        let pool = create_test_db().await;
        let directory = SqliteAccessDirectory::new(pool);
        directory.add_workspace("ws-1", "org-1").await.unwrap();
        directory.add_member("org-1", "alice").await.unwrap();

        let alice = UserIdentity { user_id: "alice".to_string() };
        let mallory = UserIdentity { user_id: "mallory".to_string() };

        authorize_workspace(&directory, &alice, "ws-1").await.unwrap();
        assert!(matches!(
            authorize_workspace(&directory, &mallory, "ws-1").await,
            Err(OrchestratorError::Forbidden(_))
        ));
        assert!(matches!(
            authorize_workspace(&directory, &alice, "ws-missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
