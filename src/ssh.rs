//! SSH client plumbing shared by the session worker and the terminal service.
//!
//! Everything above this module talks to a [`RemoteHost`]: run a command,
//! open a `direct-tcpip` forward, or open an interactive shell. The russh
//! implementation is [`SshSession`]; tests substitute recording fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::events::{AuthType, SshConfig};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const SHELL_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("ssh connection to {0} timed out")]
    Timeout(String),
    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),
    #[error("invalid private key: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("authentication rejected for user {0}")]
    AuthRejected(String),
    #[error("channel error: {0}")]
    Channel(String),
}

/// Result of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the channel closed without reporting a status.
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// stdout and stderr joined, for matching on diagnostic text.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Byte stream over a forwarded channel.
pub trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardIo for T {}

pub type ForwardStream = Box<dyn ForwardIo>;

#[derive(Debug)]
pub enum ShellCommand {
    Data(Bytes),
    Resize(TermSize),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Bytes),
    Closed,
    Error(String),
}

/// Both ends of an interactive shell channel. The channel itself lives in a
/// pump task; dropping `commands` closes it.
pub struct ShellHandle {
    pub commands: mpsc::Sender<ShellCommand>,
    pub events: mpsc::Receiver<ShellEvent>,
}

#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Run `command` to completion. No timeout is applied.
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Open a forwarded connection to `host:port` as seen from the remote.
    async fn open_forward(&self, host: &str, port: u16) -> Result<ForwardStream, SshError>;

    /// Open a PTY-backed login shell.
    async fn open_shell(&self, size: TermSize) -> Result<ShellHandle, SshError>;

    /// Disconnect. Further calls fail.
    async fn close(&self);
}

/// Produces connected hosts. The worker is generic over this so its whole
/// startup pipeline can run without a network.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteHost>, SshError>;
}

// ── russh ──────────────────────────────────────────────────────────

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Targets are user-owned VMs registered by address; there is no
        // known_hosts store to pin against.
        Ok(true)
    }
}

pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    target: String,
}

impl SshSession {
    /// Connect and authenticate within `timeout`.
    pub async fn connect(config: &SshConfig, timeout: Duration) -> Result<Self, SshError> {
        let target = format!("{}@{}:{}", config.username, config.host, config.port);
        tokio::time::timeout(timeout, Self::connect_inner(config, target.clone()))
            .await
            .map_err(|_| SshError::Timeout(target))?
    }

    async fn connect_inner(config: &SshConfig, target: String) -> Result<Self, SshError> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let mut handle = client::connect(
            ssh_config,
            (config.host.as_str(), config.port),
            ClientHandler,
        )
        .await?;

        let authenticated = match config.auth_type {
            AuthType::Key => {
                let key = decode_secret_key(&config.credential, None)?;
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
                    .success()
            }
            AuthType::Password => handle
                .authenticate_password(&config.username, &config.credential)
                .await?
                .success(),
        };
        if !authenticated {
            return Err(SshError::AuthRejected(config.username.clone()));
        }
        tracing::info!(remote = %target, auth = %config.auth_type, "ssh connected");
        Ok(Self { handle, target })
    }
}

#[async_trait]
impl RemoteHost for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn open_forward(&self, host: &str, port: u16) -> Result<ForwardStream, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_shell(&self, size: TermSize) -> Result<ShellHandle, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(false, "xterm-256color", size.cols as u32, size.rows as u32, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(SHELL_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(SHELL_QUEUE);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { ref data })
                        | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                            let chunk = Bytes::copy_from_slice(data);
                            if event_tx.send(ShellEvent::Data(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            let _ = event_tx.send(ShellEvent::Closed).await;
                            break;
                        }
                        Some(_) => {}
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(bytes)) => {
                            if let Err(e) = channel.data(&bytes[..]).await {
                                let _ = event_tx.send(ShellEvent::Error(e.to_string())).await;
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(size)) => {
                            if let Err(e) = channel
                                .window_change(size.cols as u32, size.rows as u32, 0, 0)
                                .await
                            {
                                tracing::debug!(error = %e, "window change failed");
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            let _ = event_tx.send(ShellEvent::Closed).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(ShellHandle {
            commands: cmd_tx,
            events: event_rx,
        })
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(remote = %self.target, error = %e, "ssh disconnect failed");
        }
        tracing::info!(remote = %self.target, "ssh disconnected");
    }
}

/// Connector backed by real SSH connections.
pub struct SshConnector {
    timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteHost>, SshError> {
        let session = SshSession::connect(config, self.timeout).await?;
        Ok(Arc::new(session))
    }
}
