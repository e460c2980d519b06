use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{OrchestratorError, Result};
use crate::models::{CloudCredential, ComputeInstance, InstanceStatus};
use crate::store::{CredentialStore, InstanceStore};

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Backup database before migrations (returns backup path)
pub fn backup_database(db_path: &Path) -> Result<PathBuf> {
    let timestamp = Utc::now().timestamp();
    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

/// SQLite-backed credential and instance store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn find_credential(&self, workspace_id: &str) -> Result<Option<CloudCredential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM cloud_credentials WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CloudCredential::try_from).transpose()
    }

    async fn upsert_credential(&self, credential: &CloudCredential) -> Result<CloudCredential> {
        // The existing row keeps its id and created_at
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            INSERT INTO cloud_credentials (id, workspace_id, access_key_id_encrypted, secret_access_key_encrypted, region, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id) DO UPDATE SET
                access_key_id_encrypted = excluded.access_key_id_encrypted,
                secret_access_key_encrypted = excluded.secret_access_key_encrypted,
                region = excluded.region,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.workspace_id)
        .bind(&credential.access_key_id_encrypted)
        .bind(&credential.secret_access_key_encrypted)
        .bind(&credential.region)
        .bind(credential.created_at.timestamp_millis())
        .bind(credential.updated_at.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        CloudCredential::try_from(row)
    }

    async fn delete_credential(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM cloud_credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("credential {}", id)));
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn create_instance(&self, instance: &ComputeInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO compute_instances (id, workspace_id, credential_id, status, instance_type, region, repo_url, deploy_token_encrypted, integrations, provider_instance_id, security_group_id, public_ip, error_message, launched_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.workspace_id)
        .bind(&instance.credential_id)
        .bind(instance.status)
        .bind(&instance.instance_type)
        .bind(&instance.region)
        .bind(&instance.repo_url)
        .bind(&instance.deploy_token_encrypted)
        .bind(serde_json::to_string(&instance.integrations)?)
        .bind(&instance.provider_instance_id)
        .bind(&instance.security_group_id)
        .bind(&instance.public_ip)
        .bind(&instance.error_message)
        .bind(instance.launched_at.map(|dt| dt.timestamp_millis()))
        .bind(instance.created_at.timestamp_millis())
        .bind(instance.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_instance(
        &self,
        workspace_id: &str,
        id: &str,
    ) -> Result<Option<ComputeInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM compute_instances WHERE id = ? AND workspace_id = ?",
        )
        .bind(id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComputeInstance::try_from).transpose()
    }

    async fn update_instance(&self, instance: &ComputeInstance) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compute_instances
             SET status = ?, provider_instance_id = ?, security_group_id = ?, public_ip = ?,
                 error_message = ?, launched_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(instance.status)
        .bind(&instance.provider_instance_id)
        .bind(&instance.security_group_id)
        .bind(&instance.public_ip)
        .bind(&instance.error_message)
        .bind(instance.launched_at.map(|dt| dt.timestamp_millis()))
        .bind(instance.updated_at.timestamp_millis())
        .bind(&instance.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("instance {}", instance.id)));
        }

        Ok(())
    }

    async fn list_instances(&self, workspace_id: &str) -> Result<Vec<ComputeInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM compute_instances WHERE workspace_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ComputeInstance::try_from).collect()
    }

    async fn list_instances_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<ComputeInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM compute_instances WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ComputeInstance::try_from).collect()
    }

    async fn count_instances_by_status(
        &self,
        credential_id: &str,
        statuses: &[InstanceStatus],
    ) -> Result<i64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query = format!(
            "SELECT COUNT(*) FROM compute_instances WHERE credential_id = ? AND status IN ({})",
            placeholders
        );

        let mut q = sqlx::query_as::<_, (i64,)>(&query).bind(credential_id);
        for status in statuses {
            q = q.bind(*status);
        }

        let (count,) = q.fetch_one(&self.pool).await?;
        Ok(count)
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    workspace_id: String,
    access_key_id_encrypted: String,
    secret_access_key_encrypted: String,
    region: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    workspace_id: String,
    credential_id: String,
    status: InstanceStatus,
    instance_type: String,
    region: String,
    repo_url: String,
    deploy_token_encrypted: Option<String>,
    integrations: String,
    provider_instance_id: Option<String>,
    security_group_id: Option<String>,
    public_ip: Option<String>,
    error_message: Option<String>,
    launched_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        OrchestratorError::Database(sqlx::Error::Decode(
            format!("{} out of range: {}", column, millis).into(),
        ))
    })
}

impl TryFrom<CredentialRow> for CloudCredential {
    type Error = OrchestratorError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            access_key_id_encrypted: row.access_key_id_encrypted,
            secret_access_key_encrypted: row.secret_access_key_encrypted,
            region: row.region,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
        })
    }
}

impl TryFrom<InstanceRow> for ComputeInstance {
    type Error = OrchestratorError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            credential_id: row.credential_id,
            status: row.status,
            instance_type: row.instance_type,
            region: row.region,
            repo_url: row.repo_url,
            deploy_token_encrypted: row.deploy_token_encrypted,
            integrations: serde_json::from_str(&row.integrations)?,
            provider_instance_id: row.provider_instance_id,
            security_group_id: row.security_group_id,
            public_ip: row.public_ip,
            error_message: row.error_message,
            launched_at: row
                .launched_at
                .map(|ts| from_millis("launched_at", ts))
                .transpose()?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
        })
    }
}
