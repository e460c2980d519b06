//! SSH access to provisioned instances: one-shot remote commands, agent
//! update checks and the interactive terminal proxy.

pub mod error;
pub mod executor;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;
pub mod lookup;
pub mod russh_client;
pub mod terminal;
pub mod transport;
pub mod updates;

pub use error::{Result, SshError};
pub use executor::{RemoteCommandExecutor, DEFAULT_COMMAND_TIMEOUT};
pub use lookup::InstanceLookup;
pub use russh_client::RusshConnector;
pub use terminal::{ClientEvent, ServerEvent, SessionRegistry, TerminalProxy, TerminalRequest};
pub use transport::{
    ExecOutput, ShellControl, ShellEvent, SshClient, SshConnector, SshSettings, SshTarget,
};
pub use updates::{UpdateResult, UpdateService, UpdateSettings, UpdateStatus};
