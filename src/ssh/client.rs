//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, SshConfig};
use crate::error::FsError;

/// Open the TCP connection and finish the SSH handshake.
///
/// An unreachable host or a timeout is reported as
/// [`FsError::ConnectionLost`] so a retrying caller backs off and tries again.
pub async fn connect(config: &SshConfig) -> Result<Handle<ClientHandler>, FsError> {
    let addr = config.address();

    info!("Connecting to SSH server at {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| FsError::ConnectionLost(format!("Failed to resolve address {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| FsError::ConnectionLost(format!("No address found for {}", addr)))?;

    // Keepalives detect a dead peer between operations
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(
        config.host.clone(),
        config.port,
        config.strict_host_key_checking,
    );

    let handle = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| FsError::ConnectionLost(format!("Connection to {} timed out", addr)))?
    .map_err(|e| match e {
        FsError::Io(io) => FsError::ConnectionLost(format!("{}: {}", addr, io)),
        other => other,
    })?;

    debug!("SSH handshake completed with {}", addr);
    Ok(handle)
}

async fn authenticate_with(
    handle: &mut Handle<ClientHandler>,
    config: &SshConfig,
    auth: &AuthMethod,
) -> Result<(), FsError> {
    let rejected = || FsError::Authentication(format!("{}@{} rejected", config.username, config.host));

    let result = match auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(&config.username, password)
            .await
            .map_err(|e| FsError::Authentication(e.to_string()))?,
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                .map_err(|e| FsError::Authentication(format!("Failed to load key {}: {}", key_path, e)))?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&config.username, key_with_hash)
                .await
                .map_err(|e| FsError::Authentication(e.to_string()))?
        }
        AuthMethod::Agent => {
            let mut agent = SshAgentClient::connect().await?;
            return agent.authenticate(handle, config.username.clone()).await;
        }
    };

    if result.success() {
        Ok(())
    } else {
        Err(rejected())
    }
}

/// Authenticate an established connection.
///
/// With `allow_agent` set, a rejected password or key falls back to the keys
/// held by the ssh-agent.
pub async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SshConfig,
) -> Result<(), FsError> {
    match authenticate_with(handle, config, &config.auth).await {
        Ok(()) => {
            info!("SSH authentication successful for {}@{}", config.username, config.host);
            Ok(())
        }
        Err(FsError::Authentication(msg)) if config.allow_agent && config.auth != AuthMethod::Agent => {
            warn!("{}, trying ssh-agent", msg);
            authenticate_with(handle, config, &AuthMethod::Agent).await
        }
        Err(e) => Err(e),
    }
}

/// Client handler for russh callbacks
///
/// Verifies host keys against ~/.ssh/known_hosts.
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    /// Strict host key checking mode
    /// - true: reject unknown/changed keys
    /// - false: learn unknown keys (still reject changed)
    strict: bool,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self { host, port, strict }
    }
}

impl client::Handler for ClientHandler {
    type Error = FsError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) if self.strict => {
                warn!(
                    "Unknown host key for {}:{}. Strict mode enabled, rejecting.",
                    self.host, self.port
                );
                Err(FsError::ConnectionFailed(format!(
                    "Host key verification failed: unknown host {}:{}. \
                     Add to known_hosts or disable strict mode.",
                    self.host, self.port
                )))
            }
            Ok(false) => {
                info!("New host {}:{}, adding to known_hosts", self.host, self.port);
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(e) => {
                // A changed key is always rejected
                warn!("Host key check failed for {}:{}: {}", self.host, self.port, e);
                Err(FsError::ConnectionFailed(format!(
                    "Host key verification failed for {}:{}: {}. \
                     If the key change is legitimate, remove the old key from ~/.ssh/known_hosts",
                    self.host, self.port, e
                )))
            }
        }
    }
}
