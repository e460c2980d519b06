//! Scriptable in-memory provider for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ProviderError, Result};
use crate::types::{
    InstanceDescription, LaunchRequest, ProviderCredentials, ProviderState, SecurityRule,
};
use crate::{discard_on_failure, ComputeProvider, OPEN_CIDR};

/// Operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Launch,
    Describe,
    Start,
    Stop,
    Terminate,
    CreateSecurityGroup,
    DeleteSecurityGroup,
    ListIngressRules,
    ReplaceIngressRules,
    /// The default SSH rule authorized while creating a security group
    AuthorizeDefaultRule,
}

/// A call observed by the mock, in order of arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Launch(LaunchRequest),
    Describe(String),
    Start(String),
    Stop(String),
    Terminate(String),
    CreateSecurityGroup(String),
    DeleteSecurityGroup(String),
    ListIngressRules(String),
    ReplaceIngressRules(String, Vec<SecurityRule>),
    ValidateCredentials,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ProviderCall>,
    failures: HashMap<MockOperation, String>,
    descriptions: VecDeque<InstanceDescription>,
    last_description: Option<InstanceDescription>,
    groups: HashMap<String, Vec<SecurityRule>>,
    credentials_invalid: bool,
    omit_instance_id: bool,
    next_id: u32,
}

#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call to `operation` fail with a provider API error
    pub fn fail_on(&self, operation: MockOperation, message: &str) {
        self.lock().failures.insert(operation, message.to_string());
    }

    pub fn clear_failure(&self, operation: MockOperation) {
        self.lock().failures.remove(&operation);
    }

    /// Queue a describe result. Once the queue drains, the last result repeats.
    pub fn push_description(&self, state: Option<ProviderState>, public_ip: Option<&str>) {
        self.lock().descriptions.push_back(InstanceDescription {
            state,
            public_ip: public_ip.map(str::to_string),
        });
    }

    /// Make the dry-run validation report unauthorized credentials
    pub fn reject_credentials(&self) {
        self.lock().credentials_invalid = true;
    }

    /// Make launch succeed without returning an instance id
    pub fn omit_instance_id(&self) {
        self.lock().omit_instance_id = true;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn describe_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ProviderCall::Describe(_)))
            .count()
    }

    /// Ids of the security groups that currently exist
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current inbound rules of a mock security group
    pub fn rules(&self, group_id: &str) -> Vec<SecurityRule> {
        self.lock().groups.get(group_id).cloned().unwrap_or_default()
    }

    fn record(&self, call: ProviderCall, operation: Option<MockOperation>) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);

        match operation.and_then(|op| state.failures.get(&op)) {
            Some(message) => Err(ProviderError::api(None, message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn launch(&self, _creds: &ProviderCredentials, request: &LaunchRequest) -> Result<String> {
        self.record(ProviderCall::Launch(request.clone()), Some(MockOperation::Launch))?;

        let mut state = self.lock();
        if state.omit_instance_id {
            return Err(ProviderError::MissingField("instance id"));
        }
        state.next_id += 1;
        Ok(format!("i-mock{:04}", state.next_id))
    }

    async fn describe(
        &self,
        _creds: &ProviderCredentials,
        provider_instance_id: &str,
    ) -> Result<InstanceDescription> {
        self.record(
            ProviderCall::Describe(provider_instance_id.to_string()),
            Some(MockOperation::Describe),
        )?;

        let mut state = self.lock();
        if let Some(next) = state.descriptions.pop_front() {
            state.last_description = Some(next);
        }

        Ok(state.last_description.clone().unwrap_or(InstanceDescription {
            state: Some(ProviderState::Pending),
            public_ip: None,
        }))
    }

    async fn start(&self, _creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()> {
        self.record(
            ProviderCall::Start(provider_instance_id.to_string()),
            Some(MockOperation::Start),
        )
    }

    async fn stop(&self, _creds: &ProviderCredentials, provider_instance_id: &str) -> Result<()> {
        self.record(
            ProviderCall::Stop(provider_instance_id.to_string()),
            Some(MockOperation::Stop),
        )
    }

    async fn terminate(
        &self,
        _creds: &ProviderCredentials,
        provider_instance_id: &str,
    ) -> Result<()> {
        self.record(
            ProviderCall::Terminate(provider_instance_id.to_string()),
            Some(MockOperation::Terminate),
        )
    }

    async fn create_security_group(
        &self,
        creds: &ProviderCredentials,
        name: &str,
        _description: &str,
    ) -> Result<String> {
        self.record(
            ProviderCall::CreateSecurityGroup(name.to_string()),
            Some(MockOperation::CreateSecurityGroup),
        )?;

        let group_id = {
            let mut state = self.lock();
            state.next_id += 1;
            let group_id = format!("sg-mock{:04}", state.next_id);
            state.groups.insert(group_id.clone(), Vec::new());
            group_id
        };

        let authorize = async {
            let mut state = self.lock();
            if let Some(message) = state.failures.get(&MockOperation::AuthorizeDefaultRule) {
                return Err(ProviderError::api(None, message.clone()));
            }
            state.groups.insert(
                group_id.clone(),
                vec![SecurityRule::ssh(OPEN_CIDR, "SSH access")],
            );
            Ok(())
        };

        discard_on_failure(
            &group_id,
            authorize,
            self.delete_security_group(creds, &group_id),
        )
        .await?;
        Ok(group_id)
    }

    async fn delete_security_group(
        &self,
        _creds: &ProviderCredentials,
        group_id: &str,
    ) -> Result<()> {
        self.record(
            ProviderCall::DeleteSecurityGroup(group_id.to_string()),
            Some(MockOperation::DeleteSecurityGroup),
        )?;
        self.lock().groups.remove(group_id);
        Ok(())
    }

    async fn list_ingress_rules(
        &self,
        _creds: &ProviderCredentials,
        group_id: &str,
    ) -> Result<Vec<SecurityRule>> {
        self.record(
            ProviderCall::ListIngressRules(group_id.to_string()),
            Some(MockOperation::ListIngressRules),
        )?;
        Ok(self.rules(group_id))
    }

    async fn replace_ingress_rules(
        &self,
        _creds: &ProviderCredentials,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<()> {
        self.record(
            ProviderCall::ReplaceIngressRules(group_id.to_string(), rules.to_vec()),
            Some(MockOperation::ReplaceIngressRules),
        )?;
        self.lock()
            .groups
            .insert(group_id.to_string(), rules.to_vec());
        Ok(())
    }

    async fn validate_credentials(&self, _creds: &ProviderCredentials) -> bool {
        let _ = self.record(ProviderCall::ValidateCredentials, None);
        !self.lock().credentials_invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ProviderCredentials {
        ProviderCredentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_replace_supplants_entire_rule_set() {
        let provider = MockProvider::new();
        let group = provider
            .create_security_group(&creds(), "sg-test", "test")
            .await
            .unwrap();

        provider
            .replace_ingress_rules(&creds(), &group, &[SecurityRule::ssh("10.0.0.0/8", "a")])
            .await
            .unwrap();
        provider
            .replace_ingress_rules(&creds(), &group, &[SecurityRule::ssh("192.168.0.0/16", "b")])
            .await
            .unwrap();

        let rules = provider.list_ingress_rules(&creds(), &group).await.unwrap();
        assert_eq!(rules, vec![SecurityRule::ssh("192.168.0.0/16", "b")]);
    }

    #[tokio::test]
    async fn test_scripted_failure_uses_provider_message() {
        let provider = MockProvider::new();
        provider.fail_on(MockOperation::CreateSecurityGroup, "quota exceeded");

        let err = provider
            .create_security_group(&creds(), "sg-test", "test")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[tokio::test]
    async fn test_group_is_deleted_when_default_rule_is_rejected() {
        let provider = MockProvider::new();
        provider.fail_on(MockOperation::AuthorizeDefaultRule, "RulesPerSecurityGroupLimitExceeded");

        let err = provider
            .create_security_group(&creds(), "sg-test", "test")
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "RulesPerSecurityGroupLimitExceeded");
        assert!(provider.group_ids().is_empty());
        assert!(matches!(
            provider.calls().last(),
            Some(ProviderCall::DeleteSecurityGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_authorization_error_wins_over_failed_cleanup() {
        let provider = MockProvider::new();
        provider.fail_on(MockOperation::AuthorizeDefaultRule, "RulesPerSecurityGroupLimitExceeded");
        provider.fail_on(MockOperation::DeleteSecurityGroup, "DependencyViolation");

        let err = provider
            .create_security_group(&creds(), "sg-test", "test")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "RulesPerSecurityGroupLimitExceeded");
    }

    #[tokio::test]
    async fn test_describe_repeats_last_scripted_result() {
        let provider = MockProvider::new();
        provider.push_description(Some(ProviderState::Running), Some("203.0.113.10"));

        for _ in 0..2 {
            let description = provider.describe(&creds(), "i-1").await.unwrap();
            assert_eq!(description.state, Some(ProviderState::Running));
            assert_eq!(description.public_ip.as_deref(), Some("203.0.113.10"));
        }
        assert_eq!(provider.describe_count(), 2);
    }
}
