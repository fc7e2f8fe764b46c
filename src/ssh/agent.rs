//! ssh-agent authentication
//!
//! Signing is delegated to the agent listening on `SSH_AUTH_SOCK` (or the
//! OpenSSH named pipe on Windows). Each agent identity is offered in turn
//! until the server accepts one.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use crate::error::FsError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// [`Signer`] over a borrowed agent.
///
/// The key is cloned before the async block so the returned future only
/// holds owned data and stays `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    /// Connect to the system agent.
    pub async fn connect() -> Result<Self, FsError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                FsError::Authentication(format!(
                    "ssh-agent unavailable: {}. Is SSH_AUTH_SOCK set?",
                    e
                ))
            })?;
            debug!("Connected to ssh-agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| FsError::Authentication(format!("ssh-agent unavailable: {}", e)))?;
            debug!("Connected to ssh-agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(FsError::Authentication(
                "ssh-agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Offer every agent identity for `username`.
    ///
    /// Fails with [`FsError::Authentication`] when the agent holds no keys or
    /// the server rejects all of them.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: String,
    ) -> Result<(), FsError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| FsError::Authentication(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(FsError::Authentication(
                "ssh-agent has no keys loaded".to_string(),
            ));
        }

        info!("ssh-agent offers {} key(s)", keys.len());

        let mut last_error: Option<String> = None;
        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            let signed = handle
                .authenticate_publickey_with(
                    &username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await;

            match signed {
                Ok(result) if result.success() => {
                    info!("Agent key accepted: {}", key.comment());
                    return Ok(());
                }
                Ok(_) => debug!("Key rejected by server: {}", key.comment()),
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(FsError::Authentication(format!(
            "No agent key was accepted for {} (tried {}){}",
            username,
            keys.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

/// Whether an agent socket is advertised.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var_os("SSH_AUTH_SOCK").is_some()
    }

    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_authentication_error() {
        match SshAgentClient::connect().await {
            Ok(_) => assert!(is_agent_available()),
            Err(e) => assert_eq!(e.kind(), crate::error::ErrorKind::Authentication),
        }
    }
}
