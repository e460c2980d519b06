use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use vm_provider::MockProvider;

use crate::crypto::{generate_salt, AesGcmCipher, SecretCipher};
use crate::db::SqliteStore;
use crate::instance::{InstanceOrchestrator, OrchestratorSettings};
use crate::models::CredentialInput;
use crate::vault::CredentialVault;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Settings with a short poll interval for tests
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        image_id: "ami-test".to_string(),
        key_name: Some("test-key".to_string()),
        poll_interval: Duration::from_millis(20),
        poll_attempts: 5,
        bootstrap_command: None,
    }
}

pub fn test_credentials() -> CredentialInput {
    CredentialInput {
        access_key_id: "AKIAABCDEFGH1234".to_string(),
        secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
        region: "us-east-1".to_string(),
    }
}

/// Orchestrator wired to an in-memory database and a [`MockProvider`]
pub struct TestHarness {
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub provider: Arc<MockProvider>,
    pub cipher: Arc<AesGcmCipher>,
    pub vault: CredentialVault,
    pub orchestrator: InstanceOrchestrator,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    pub async fn with_settings(settings: OrchestratorSettings) -> Self {
        let pool = create_test_db().await;
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let provider = Arc::new(MockProvider::new());
        let cipher = Arc::new(
            AesGcmCipher::derive_from_password("test-master-key", &generate_salt())
                .expect("Failed to derive test cipher"),
        );

        let vault = CredentialVault::new(
            store.clone(),
            store.clone(),
            cipher.clone() as Arc<dyn SecretCipher>,
            provider.clone(),
        );
        let orchestrator = InstanceOrchestrator::new(
            store.clone(),
            vault.clone(),
            cipher.clone() as Arc<dyn SecretCipher>,
            provider.clone(),
            settings,
        );

        Self {
            pool,
            store,
            provider,
            cipher,
            vault,
            orchestrator,
        }
    }

    /// Store valid credentials for `workspace_id`
    pub async fn seed_credentials(&self, workspace_id: &str) {
        self.vault
            .save(workspace_id, test_credentials())
            .await
            .expect("Failed to seed credentials");
    }
}
