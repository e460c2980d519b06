//! Common test utilities and helpers for vm-api tests
//!
//! Builds the full router over an in-memory database, a [`MockProvider`] and
//! a fake SSH connector, with two users: `alice` (member of the organization
//! owning [`WS`]) and `bob` (member of nothing).

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    Router,
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::ServiceExt; // for `oneshot`
use vm_api::{create_app, AppState, Collaborators, Config};
use vm_orchestrator::crypto::generate_salt;
use vm_orchestrator::test_utils::{create_test_db, test_credentials};
use vm_orchestrator::{AesGcmCipher, ApiKeyVerifier, SqliteAccessDirectory};
use vm_provider::MockProvider;
use vm_ssh::fake::FakeSsh;

pub const WS: &str = "ws-1";
pub const OTHER_WS: &str = "ws-2";
pub const ALICE: &str = "alice-token";
pub const BOB: &str = "bob-token";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub pool: SqlitePool,
    pub provider: Arc<MockProvider>,
    pub ssh: FakeSsh,
    _key: NamedTempFile,
}

impl TestApp {
    pub async fn new() -> Self {
        let pool = create_test_db().await;

        let directory = SqliteAccessDirectory::new(pool.clone());
        directory
            .add_workspace(WS, "org-1")
            .await
            .expect("Failed to add workspace");
        directory
            .add_workspace(OTHER_WS, "org-2")
            .await
            .expect("Failed to add workspace");
        directory
            .add_member("org-1", "alice")
            .await
            .expect("Failed to add member");

        let key = NamedTempFile::new().expect("Failed to create key file");
        let config = Config {
            ssh_key_path: key.path().to_path_buf(),
            image_id: "ami-test".to_string(),
            // Keep background polling out of the way of explicit calls
            poll_interval_secs: 3600,
            poll_attempts: 1,
            agent_version: "1.4.0".to_string(),
            version_command: "devbox-agent --version".to_string(),
            update_command: "sudo npm install -g devbox-agent@{version}".to_string(),
            ..Config::default()
        };

        let provider = Arc::new(MockProvider::new());
        let ssh = FakeSsh::new();
        let cipher = AesGcmCipher::derive_from_password("test-master-key", &generate_salt())
            .expect("Failed to derive test cipher");
        let verifier = ApiKeyVerifier::from_pairs(&format!("{}=alice,{}=bob", ALICE, BOB))
            .expect("Failed to parse tokens");

        let state = AppState::new(
            pool.clone(),
            &config,
            Collaborators {
                provider: provider.clone(),
                ssh: Arc::new(ssh.clone()),
                cipher: Arc::new(cipher),
                verifier: Arc::new(verifier),
            },
        );

        Self {
            app: create_app(state.clone()),
            state,
            pool,
            provider,
            ssh,
            _key: key,
        }
    }

    /// Save the default test credentials for `workspace_id` directly
    pub async fn seed_credentials(&self, workspace_id: &str) {
        self.state
            .orchestrator
            .vault()
            .save(workspace_id, test_credentials())
            .await
            .expect("Failed to seed credentials");
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }

        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        // Router is cheap to clone
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> Response<Body> {
        self.send("GET", uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Response<Body> {
        self.send("POST", uri, token, Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> Response<Body> {
        self.send("PUT", uri, token, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: Option<&str>) -> Response<Body> {
        self.send("DELETE", uri, token, None).await
    }
}

/// Helper to extract JSON body from axum response
pub async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// Assert the status and return the body
pub async fn expect_status(response: Response<Body>, status: StatusCode) -> Value {
    let actual = response.status();
    let body = json_body(response).await;
    assert_eq!(actual, status, "unexpected status, body: {}", body);
    body
}

pub fn instances_uri(workspace_id: &str) -> String {
    format!("/api/v1/workspaces/{}/instances", workspace_id)
}

pub fn instance_uri(workspace_id: &str, id: &str) -> String {
    format!("/api/v1/workspaces/{}/instances/{}", workspace_id, id)
}

pub fn credentials_uri(workspace_id: &str) -> String {
    format!("/api/v1/workspaces/{}/credentials", workspace_id)
}
