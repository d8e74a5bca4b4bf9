//! SSH tunnel for reaching a database behind a bastion host.
//!
//! The connection manager only needs the [`Tunnel`] capability: start,
//! report the local port, close. [`SshTunnel`] implements it with russh.

use crate::error::{TetherError, TetherResult};
use crate::models::{TunnelConfig, TunnelCredential};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An encrypted hop exposing a local port that forwards to the database.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Start forwarding.
    ///
    /// Resolves only once the tunnel accepts connections on the returned
    /// local port.
    async fn start(&mut self) -> TetherResult<u16>;

    /// Local port of a started tunnel.
    fn local_port(&self) -> Option<u16>;

    /// Check whether the tunnel is still forwarding.
    fn is_running(&self) -> bool;

    /// Stop forwarding. Safe to call on a tunnel that never started.
    fn close(&mut self);
}

/// Forwarding task of a started tunnel.
struct ActiveTunnel {
    local_port: u16,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

/// Tunnel through an SSH server using direct-tcpip channels.
pub struct SshTunnel {
    config: TunnelConfig,
    active: Option<ActiveTunnel>,
}

impl SshTunnel {
    /// Create an unstarted tunnel.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config, active: None }
    }

    /// Get the tunnel configuration.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Connect and authenticate to the SSH server.
    async fn connect_ssh(
        config: &TunnelConfig,
    ) -> TetherResult<client::Handle<TunnelClientHandler>> {
        let (host, port) = config.server_addr()?;
        let ssh_config = Arc::new(client::Config::default());

        let mut handle = client::connect(ssh_config, format!("{host}:{port}"), TunnelClientHandler)
            .await
            .map_err(|e| {
                TetherError::tunnel_with_hint(
                    format!("Failed to connect to SSH server {host}:{port}: {e}"),
                    "Verify the SSH server is running and reachable",
                )
            })?;

        let authenticated = match &config.credential {
            TunnelCredential::Password { password } => handle
                .authenticate_password(&config.user, password)
                .await
                .map_err(|e| {
                    TetherError::tunnel_with_hint(
                        format!("SSH password authentication failed: {e}"),
                        "Check your SSH username and password",
                    )
                })?,
            TunnelCredential::KeyFile { path, passphrase } => {
                let key = Self::load_private_key(path, passphrase.as_deref()).await?;
                handle.authenticate_publickey(&config.user, key).await.map_err(|e| {
                    TetherError::tunnel_with_hint(
                        format!("SSH key authentication failed: {e}"),
                        "Verify your SSH key is valid and has the correct permissions",
                    )
                })?
            }
        };

        if !authenticated {
            return Err(TetherError::tunnel_with_hint(
                "SSH authentication failed",
                "Check your credentials and try again",
            ));
        }

        tracing::info!(user = %config.user, server = %host, "SSH authentication successful");
        Ok(handle)
    }

    /// Load a private key from a file.
    async fn load_private_key(path: &Path, passphrase: Option<&str>) -> TetherResult<Arc<KeyPair>> {
        let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
            TetherError::tunnel_with_hint(
                format!("Failed to read SSH key file {}: {e}", path.display()),
                "Check that the key file exists and is readable",
            )
        })?;

        let key = russh_keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
            TetherError::tunnel_with_hint(
                format!("Failed to decode SSH key: {e}"),
                "The key may be encrypted; provide the passphrase",
            )
        })?;

        Ok(Arc::new(key))
    }

    /// Accept local connections until cancelled.
    async fn run_tunnel(
        listener: TcpListener,
        ssh_client: Arc<Mutex<client::Handle<TunnelClientHandler>>>,
        remote_host: String,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((local_stream, peer_addr)) => {
                            tracing::debug!(%peer_addr, "New tunnel connection");

                            let ssh_client = ssh_client.clone();
                            let remote_host = remote_host.clone();
                            let cancel = cancel_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::forward_connection(
                                    local_stream,
                                    ssh_client,
                                    &remote_host,
                                    remote_port,
                                    cancel,
                                )
                                .await
                                {
                                    tracing::warn!(error = %e, "Tunnel forwarding error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept tunnel connection");
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    tracing::info!("SSH tunnel cancelled");
                    break;
                }
            }
        }
    }

    /// Forward a single connection through the SSH session.
    async fn forward_connection(
        mut local_stream: TcpStream,
        ssh_client: Arc<Mutex<client::Handle<TunnelClientHandler>>>,
        remote_host: &str,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) -> TetherResult<()> {
        let channel = {
            let handle = ssh_client.lock().await;
            handle
                .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    TetherError::tunnel_with_hint(
                        format!("Failed to open SSH channel to {remote_host}:{remote_port}: {e}"),
                        "The SSH server may not allow TCP forwarding",
                    )
                })?
        };

        let mut channel = channel.into_stream();
        let mut buf_local = [0u8; 8192];
        let mut buf_remote = [0u8; 8192];

        loop {
            tokio::select! {
                n = local_stream.read(&mut buf_local) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if channel.write_all(&buf_local[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                n = channel.read(&mut buf_remote) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn start(&mut self) -> TetherResult<u16> {
        if let Some(port) = self.local_port().filter(|_| self.is_running()) {
            return Ok(port);
        }
        self.close();
        self.config.validate()?;

        let (remote_host, remote_port) = self.config.destination_addr()?;
        tracing::info!(
            server = %self.config.server,
            destination = %self.config.destination,
            "Establishing SSH tunnel"
        );

        let ssh_client = Self::connect_ssh(&self.config).await?;
        let ssh_client = Arc::new(Mutex::new(ssh_client));

        let listener = TcpListener::bind(("127.0.0.1", self.config.local_port))
            .await
            .map_err(|e| {
                TetherError::tunnel_with_hint(
                    format!(
                        "Failed to bind local port {} for SSH tunnel: {e}",
                        self.config.local_port
                    ),
                    "Try a different local port or use 0 to let the system choose one",
                )
            })?;
        let local_port = listener.local_addr()?.port();

        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(Self::run_tunnel(
            listener,
            ssh_client,
            remote_host,
            remote_port,
            cancel_token.clone(),
        ));

        tracing::info!(local_port, "SSH tunnel ready");
        self.active = Some(ActiveTunnel { local_port, cancel_token, task });
        Ok(local_port)
    }

    fn local_port(&self) -> Option<u16> {
        self.active.as_ref().map(|a| a.local_port)
    }

    fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.cancel_token.is_cancelled() && !a.task.is_finished())
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel_token.cancel();
            tracing::info!(local_port = active.local_port, "SSH tunnel stopped");
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel_token.cancel();
        }
    }
}

/// SSH client handler for russh.
struct TunnelClientHandler;

#[async_trait]
impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against known_hosts instead of trusting every host key
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstarted_tunnel_has_no_port() {
        let tunnel = SshTunnel::new(TunnelConfig::new("deploy", "pw", "bastion", "db:5432", 0));
        assert_eq!(tunnel.local_port(), None);
        assert!(!tunnel.is_running());
    }

    #[test]
    fn test_close_unstarted_tunnel_is_noop() {
        let mut tunnel = SshTunnel::new(TunnelConfig::new("deploy", "pw", "bastion", "db:5432", 0));
        tunnel.close();
        assert!(!tunnel.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_destination() {
        let mut tunnel = SshTunnel::new(TunnelConfig::new("deploy", "pw", "bastion", "db", 0));
        let err = tunnel.start().await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(tunnel.local_port(), None);
    }

    #[tokio::test]
    async fn test_start_fails_against_unreachable_server() {
        let mut tunnel =
            SshTunnel::new(TunnelConfig::new("deploy", "pw", "127.0.0.1:1", "db:5432", 0));
        let err = tunnel.start().await.unwrap_err();
        assert_eq!(err.category(), "Tunnel");
        assert!(!tunnel.is_running());
    }
}
