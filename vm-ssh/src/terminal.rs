//! Interactive terminal bridged from a client channel to an SSH shell.
//!
//! The caller (the WebSocket route) owns the client side: it decodes frames
//! into [`ClientEvent`]s and encodes [`ServerEvent`]s. The proxy authorizes
//! the connection, opens the shell and pumps events both ways until either
//! side goes away. Every exit path ends in [`SessionRegistry::teardown`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vm_orchestrator::access::authorize_workspace;
use vm_orchestrator::{AccessDirectory, OrchestratorError, TokenVerifier, UserIdentity};

use crate::error::{Result, SshError};
use crate::executor::target_for;
use crate::lookup::InstanceLookup;
use crate::transport::{ShellControl, ShellEvent, SshClient, SshConnector, SshSettings};

pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

/// Client to server frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Input { data: String },
    Resize { cols: u32, rows: u32 },
}

/// Server to client frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected,
    Output { data: String },
    Error { message: String },
    Disconnected,
}

/// Authorized terminal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub user: UserIdentity,
    pub workspace_id: String,
    pub instance_id: String,
}

struct TerminalSession {
    client: Arc<dyn SshClient>,
    shell: Option<Arc<dyn ShellControl>>,
}

/// Live sessions keyed by connection id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, TerminalSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TerminalSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, connection_id: &str, client: Arc<dyn SshClient>) {
        self.lock().insert(
            connection_id.to_string(),
            TerminalSession {
                client,
                shell: None,
            },
        );
    }

    fn attach_shell(&self, connection_id: &str, shell: Arc<dyn ShellControl>) {
        if let Some(session) = self.lock().get_mut(connection_id) {
            session.shell = Some(shell);
        }
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.lock().contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close the shell if present, end the SSH client and drop the entry.
    /// Safe to call any number of times.
    pub async fn teardown(&self, connection_id: &str) {
        let Some(session) = self.lock().remove(connection_id) else {
            return;
        };

        if let Some(shell) = session.shell {
            shell.close().await;
        }
        session.client.disconnect().await;
        debug!(connection_id, "Terminal session torn down");
    }
}

#[derive(Clone)]
pub struct TerminalProxy {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn AccessDirectory>,
    lookup: Arc<dyn InstanceLookup>,
    connector: Arc<dyn SshConnector>,
    settings: SshSettings,
    registry: SessionRegistry,
}

impl TerminalProxy {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn AccessDirectory>,
        lookup: Arc<dyn InstanceLookup>,
        connector: Arc<dyn SshConnector>,
        settings: SshSettings,
    ) -> Self {
        Self {
            verifier,
            directory,
            lookup,
            connector,
            settings,
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Verify the bearer token and the caller's membership of the
    /// workspace's organization
    pub async fn handshake(
        &self,
        token: Option<&str>,
        workspace_id: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<TerminalRequest> {
        let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
            OrchestratorError::Unauthorized("missing bearer token".to_string())
        })?;
        let user = self
            .verifier
            .verify(token)
            .ok_or_else(|| OrchestratorError::Unauthorized("invalid bearer token".to_string()))?;

        let (workspace_id, instance_id) = match (workspace_id, instance_id) {
            (Some(ws), Some(id)) if !ws.is_empty() && !id.is_empty() => (ws, id),
            _ => {
                return Err(SshError::BadRequest(
                    "workspace and instance ids are required".to_string(),
                ))
            }
        };

        authorize_workspace(self.directory.as_ref(), &user, workspace_id).await?;

        Ok(TerminalRequest {
            user,
            workspace_id: workspace_id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Bridge one client connection to an SSH shell until either side closes.
    ///
    /// Failures are reported to the client as an `error` event.
    pub async fn run(
        &self,
        connection_id: &str,
        request: &TerminalRequest,
        mut client_events: mpsc::Receiver<ClientEvent>,
        server_events: mpsc::Sender<ServerEvent>,
    ) {
        let mut shell_events = match self.open(connection_id, request).await {
            Ok(events) => events,
            Err(e) => {
                warn!(connection_id, "Terminal session failed to start: {}", e);
                let _ = server_events
                    .send(ServerEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                self.registry.teardown(connection_id).await;
                return;
            }
        };

        info!(
            connection_id,
            user_id = %request.user.user_id,
            instance_id = %request.instance_id,
            "Terminal session connected"
        );
        let _ = server_events.send(ServerEvent::Connected).await;

        let mut decoder = Utf8Decoder::default();
        loop {
            tokio::select! {
                event = client_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.forward(connection_id, event).await {
                            let _ = server_events
                                .send(ServerEvent::Error { message: e.to_string() })
                                .await;
                            break;
                        }
                    }
                    None => break,
                },
                event = shell_events.recv() => match event {
                    Some(ShellEvent::Output(bytes)) => {
                        let data = decoder.decode(&bytes);
                        if !data.is_empty()
                            && server_events.send(ServerEvent::Output { data }).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(ShellEvent::Error(message)) => {
                        let _ = server_events.send(ServerEvent::Error { message }).await;
                        break;
                    }
                    Some(ShellEvent::Closed) | None => {
                        let _ = server_events.send(ServerEvent::Disconnected).await;
                        break;
                    }
                },
            }
        }

        self.registry.teardown(connection_id).await;
        info!(connection_id, "Terminal session closed");
    }

    async fn open(
        &self,
        connection_id: &str,
        request: &TerminalRequest,
    ) -> Result<mpsc::Receiver<ShellEvent>> {
        let instance = self
            .lookup
            .get_instance(&request.workspace_id, &request.instance_id)
            .await?;
        let target = target_for(&instance, &self.settings)?;

        let client = self.connector.connect(&target).await?;
        self.registry.insert(connection_id, client.clone());

        let (shell, events) = client.open_shell(DEFAULT_COLS, DEFAULT_ROWS).await?;
        self.registry.attach_shell(connection_id, shell);

        Ok(events)
    }

    async fn forward(&self, connection_id: &str, event: ClientEvent) -> Result<()> {
        let shell = self
            .registry
            .lock()
            .get(connection_id)
            .and_then(|session| session.shell.clone())
            .ok_or_else(|| SshError::Channel("terminal session is not open".to_string()))?;

        match event {
            ClientEvent::Input { data } => shell.write(data.as_bytes()).await,
            ClientEvent::Resize { cols, rows } => shell.resize(cols, rows).await,
        }
    }
}

/// Decodes a byte stream as UTF-8, holding back a sequence split across chunks
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end; wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged_snake_case() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(event, ClientEvent::Resize { cols: 120, rows: 40 });

        let json = serde_json::to_string(&ServerEvent::Output {
            data: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi"}"#);
        assert_eq!(
            serde_json::to_string(&ServerEvent::Connected).unwrap(),
            r#"{"type":"connected"}"#
        );
    }

    #[test]
    fn test_decoder_joins_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo".as_bytes();

        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
        assert_eq!(decoder.decode(&[0xff, b'a']), "\u{fffd}a");
    }
}
