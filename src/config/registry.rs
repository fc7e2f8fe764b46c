//! Host registry
//!
//! Hosts known by alias, loaded once from an SSH config file and extended at
//! runtime with [`HostRegistry::insert`].

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use super::ssh_config::{parse_ssh_config, SshConfigError, SshConfigHost};
use crate::error::FsError;
use crate::ssh::{AuthMethod, SshConfig};

#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: BTreeMap<String, SshConfigHost>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load hosts from `path`, or from `~/.ssh/config` when `None`
    pub fn from_ssh_config(path: Option<&Path>) -> Result<Self, SshConfigError> {
        let mut registry = Self::new();
        for host in parse_ssh_config(path)? {
            registry.insert(host);
        }
        info!("Loaded {} host(s) from ssh config", registry.hosts.len());
        Ok(registry)
    }

    /// Add or replace a host entry
    pub fn insert(&mut self, host: SshConfigHost) {
        debug!("Registering host {}", host.alias);
        self.hosts.insert(host.alias.clone(), host);
    }

    pub fn get(&self, alias: &str) -> Option<&SshConfigHost> {
        self.hosts.get(alias)
    }

    /// Aliases that carry both a user and a hostname
    pub fn available_hosts(&self) -> Vec<&str> {
        self.hosts
            .values()
            .filter(|h| !h.is_wildcard() && h.user.is_some() && h.hostname.is_some())
            .map(|h| h.alias.as_str())
            .collect()
    }

    /// Connection settings for `alias`.
    ///
    /// Without `allow_agent` the host must name an identity file; with it the
    /// agent is used when none is configured.
    pub fn ssh_config_for(&self, alias: &str, allow_agent: bool) -> Result<SshConfig, FsError> {
        let host = self.get(alias).ok_or_else(|| {
            FsError::InvalidArgument(format!("couldn't find login credentials for {}", alias))
        })?;

        let (user, hostname) = match (&host.user, &host.hostname) {
            (Some(user), Some(hostname)) => (user.clone(), hostname.clone()),
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "Cannot find username or hostname for {}",
                    alias
                )))
            }
        };

        let auth = match host.identity_file() {
            Some(key) => AuthMethod::key(key, None),
            None if allow_agent => {
                info!("No private key for {}, using ssh-agent", hostname);
                AuthMethod::Agent
            }
            None => {
                return Err(FsError::InvalidArgument(format!(
                    "No private key found for {}",
                    alias
                )))
            }
        };

        let mut config = SshConfig::new(hostname, user, auth);
        config.port = host.effective_port();
        config.allow_agent = allow_agent;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ssh_config::parse_ssh_config_content;

    fn registry() -> HostRegistry {
        let content = r#"
Host gpu
    HostName 192.168.1.20
    User alice
    Port 2200
    IdentityFile /keys/gpu

Host agentonly
    HostName agent.example.com
    User bob

Host partial
    HostName nouser.example.com
"#;
        let mut registry = HostRegistry::new();
        for host in parse_ssh_config_content(content).unwrap() {
            registry.insert(host);
        }
        registry
    }

    #[test]
    fn test_available_hosts_need_user_and_hostname() {
        assert_eq!(registry().available_hosts(), vec!["agentonly", "gpu"]);
    }

    #[test]
    fn test_config_for_key_host() {
        let config = registry().ssh_config_for("gpu", false).unwrap();
        assert_eq!(config.host, "192.168.1.20");
        assert_eq!(config.username, "alice");
        assert_eq!(config.port, 2200);
        assert_eq!(config.auth, AuthMethod::key("/keys/gpu", None));
    }

    #[test]
    fn test_agent_required_without_key() {
        let registry = registry();
        assert!(matches!(
            registry.ssh_config_for("agentonly", false),
            Err(FsError::InvalidArgument(_))
        ));
        let config = registry.ssh_config_for("agentonly", true).unwrap();
        assert_eq!(config.auth, AuthMethod::Agent);
        assert!(config.allow_agent);
    }

    #[test]
    fn test_unknown_and_partial_hosts() {
        let registry = registry();
        assert!(registry.ssh_config_for("nope", true).is_err());
        assert!(registry.ssh_config_for("partial", true).is_err());
    }

    #[test]
    fn test_insert_overrides() {
        let mut registry = registry();
        registry.insert(SshConfigHost {
            alias: "gpu".into(),
            hostname: Some("10.0.0.1".into()),
            user: Some("carol".into()),
            ..Default::default()
        });
        let config = registry.ssh_config_for("gpu", true).unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.auth, AuthMethod::Agent);
    }

    #[test]
    fn test_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HostRegistry::from_ssh_config(Some(&dir.path().join("config"))).unwrap();
        assert!(registry.available_hosts().is_empty());
    }
}
