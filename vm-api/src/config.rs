use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use vm_orchestrator::crypto::SALT_LENGTH;
use vm_orchestrator::OrchestratorSettings;
use vm_ssh::{SshSettings, UpdateSettings};

/// Salt used when `VM_API_KEY_SALT` is not set
const DEFAULT_KEY_SALT: &[u8; SALT_LENGTH] = b"vm-api credential vault salt v1!";

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Password the credential cipher key is derived from
    #[serde(default = "default_master_key")]
    pub master_key: Option<String>,

    /// Base64 salt for key derivation
    #[serde(default = "default_key_salt")]
    pub key_salt: Option<String>,

    /// `token=user_id` pairs accepted as bearer tokens
    #[serde(default = "default_api_tokens")]
    pub api_tokens: String,

    /// Alternate EC2 endpoint, e.g. a local emulator
    #[serde(default = "default_ec2_endpoint")]
    pub ec2_endpoint: Option<String>,

    #[serde(default = "default_image_id")]
    pub image_id: String,

    #[serde(default = "default_key_pair")]
    pub key_pair: Option<String>,

    #[serde(default = "default_bootstrap_command")]
    pub bootstrap_command: Option<String>,

    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,

    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    #[serde(default = "default_version_command")]
    pub version_command: String,

    #[serde(default = "default_update_command")]
    pub update_command: String,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("VM_API_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VM_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("vm").join("api").join("vm.db")
    } else {
        home_dir().join(".vm").join("api").join("vm.db")
    }
}

fn default_master_key() -> Option<String> {
    env_string("VM_API_MASTER_KEY")
}

fn default_key_salt() -> Option<String> {
    env_string("VM_API_KEY_SALT")
}

fn default_api_tokens() -> String {
    std::env::var("VM_API_TOKENS").unwrap_or_default()
}

fn default_ec2_endpoint() -> Option<String> {
    env_string("VM_API_EC2_ENDPOINT")
}

fn default_image_id() -> String {
    env_string("VM_API_IMAGE_ID").unwrap_or_else(|| OrchestratorSettings::default().image_id)
}

fn default_key_pair() -> Option<String> {
    env_string("VM_API_KEY_PAIR")
}

fn default_bootstrap_command() -> Option<String> {
    env_string("VM_API_BOOTSTRAP_COMMAND")
}

fn default_ssh_key_path() -> PathBuf {
    match env_string("VM_API_SSH_KEY_PATH") {
        Some(path) => expand_home(&path),
        None => home_dir().join(".ssh").join("vm_api_ed25519"),
    }
}

fn default_ssh_user() -> String {
    env_string("VM_API_SSH_USER").unwrap_or_else(|| "ubuntu".to_string())
}

fn default_ssh_port() -> u16 {
    env_parse("VM_API_SSH_PORT", 22)
}

fn default_command_timeout() -> u64 {
    env_parse("VM_API_COMMAND_TIMEOUT", 120)
}

fn default_poll_interval() -> u64 {
    env_parse("VM_API_POLL_INTERVAL", 10)
}

fn default_poll_attempts() -> u32 {
    env_parse("VM_API_POLL_ATTEMPTS", 30)
}

fn default_agent_version() -> String {
    env_string("VM_API_AGENT_VERSION").unwrap_or_else(|| UpdateSettings::default().target_version)
}

fn default_version_command() -> String {
    env_string("VM_API_VERSION_COMMAND")
        .unwrap_or_else(|| UpdateSettings::default().version_command)
}

fn default_update_command() -> String {
    env_string("VM_API_UPDATE_COMMAND").unwrap_or_else(|| UpdateSettings::default().update_command)
}

fn expand_home(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            master_key: default_master_key(),
            key_salt: default_key_salt(),
            api_tokens: default_api_tokens(),
            ec2_endpoint: default_ec2_endpoint(),
            image_id: default_image_id(),
            key_pair: default_key_pair(),
            bootstrap_command: default_bootstrap_command(),
            ssh_key_path: default_ssh_key_path(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            command_timeout_secs: default_command_timeout(),
            poll_interval_secs: default_poll_interval(),
            poll_attempts: default_poll_attempts(),
            agent_version: default_agent_version(),
            version_command: default_version_command(),
            update_command: default_update_command(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("ec2_endpoint", &self.ec2_endpoint)
            .field("image_id", &self.image_id)
            .field("key_pair", &self.key_pair)
            .field("ssh_key_path", &self.ssh_key_path)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_port", &self.ssh_port)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("poll_attempts", &self.poll_attempts)
            .field("agent_version", &self.agent_version)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn master_key(&self) -> Result<&str> {
        self.master_key
            .as_deref()
            .ok_or_else(|| anyhow!("VM_API_MASTER_KEY must be set"))
    }

    pub fn key_salt(&self) -> Result<Vec<u8>> {
        let Some(encoded) = &self.key_salt else {
            return Ok(DEFAULT_KEY_SALT.to_vec());
        };

        let salt = STANDARD
            .decode(encoded.trim())
            .context("VM_API_KEY_SALT is not valid base64")?;
        if salt.len() != SALT_LENGTH {
            return Err(anyhow!(
                "VM_API_KEY_SALT must decode to {} bytes, got {}",
                SALT_LENGTH,
                salt.len()
            ));
        }
        Ok(salt)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            image_id: self.image_id.clone(),
            key_name: self.key_pair.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_attempts: self.poll_attempts,
            bootstrap_command: self.bootstrap_command.clone(),
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            key_path: self.ssh_key_path.clone(),
            ..SshSettings::default()
        }
    }

    pub fn update_settings(&self) -> UpdateSettings {
        UpdateSettings {
            target_version: self.agent_version.clone(),
            version_command: self.version_command.clone(),
            update_command: self.update_command.clone(),
        }
    }
}
