//! Connection descriptors
//!
//! A descriptor carries everything needed to reopen a connection except the
//! password, which is never written out.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ssh::{AuthMethod, SshConfig};

/// Descriptor persistence errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote descriptor for {0} has no address")]
    MissingAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    #[serde(rename = "SSHConnection")]
    Ssh,
    #[serde(rename = "LocalConnection")]
    Local,
}

/// Serializable description of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(rename = "connection_name")]
    pub kind: ConnectionKind,
    /// Lower-cased server name
    pub server_name: String,
    /// Remote address, `None` for the local machine
    pub address: Option<String>,
    pub user_name: String,
    /// Private key file, if key authentication is used
    pub ssh_key: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub thread_safe: bool,
    #[serde(default)]
    pub allow_agent: bool,
}

fn default_port() -> u16 {
    22
}

impl ConnectionDescriptor {
    pub fn local(server_name: &str, user_name: &str) -> Self {
        Self {
            kind: ConnectionKind::Local,
            server_name: server_name.to_lowercase(),
            address: None,
            user_name: user_name.to_string(),
            ssh_key: None,
            port: default_port(),
            thread_safe: true,
            allow_agent: false,
        }
    }

    /// Describe an SSH connection. Password credentials are dropped.
    pub fn ssh(server_name: &str, config: &SshConfig, thread_safe: bool) -> Self {
        Self {
            kind: ConnectionKind::Ssh,
            server_name: server_name.to_lowercase(),
            address: Some(config.host.clone()),
            user_name: config.username.clone(),
            ssh_key: config.auth.key_path().map(str::to_string),
            port: config.port,
            thread_safe,
            allow_agent: config.allow_agent || config.auth == AuthMethod::Agent,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == ConnectionKind::Local
    }

    /// Rebuild the SSH configuration.
    ///
    /// `password` is used only when no key is recorded.
    pub fn ssh_config(&self, password: Option<&str>) -> Result<SshConfig, DescriptorError> {
        let address = self
            .address
            .clone()
            .ok_or_else(|| DescriptorError::MissingAddress(self.server_name.clone()))?;

        let auth = match (&self.ssh_key, password) {
            (Some(key), _) => AuthMethod::key(key.clone(), None),
            (None, Some(password)) => AuthMethod::password(password),
            (None, None) => AuthMethod::Agent,
        };

        let mut config = SshConfig::new(address, self.user_name.clone(), auth);
        config.port = self.port;
        config.allow_agent = self.allow_agent;
        Ok(config)
    }

    pub fn to_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Result<Self, DescriptorError> {
        let object: serde_json::Map<String, Value> = map.into_iter().collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&json)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Load a list of descriptors. A missing file yields an empty list.
pub fn load_descriptors(path: &Path) -> Result<Vec<ConnectionDescriptor>, DescriptorError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(DescriptorError::Io(e)),
    }
}

/// Write descriptors through a temp file and rename
pub fn save_descriptors(
    path: &Path,
    descriptors: &[ConnectionDescriptor],
) -> Result<(), DescriptorError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(descriptors)?;
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> ConnectionDescriptor {
        let mut config = SshConfig::new("10.0.0.5", "deploy", AuthMethod::key("/keys/id_ed25519", None));
        config.port = 2222;
        ConnectionDescriptor::ssh("Build-Box", &config, true)
    }

    #[test]
    fn test_string_round_trip() {
        let desc = remote();
        let text = desc.to_string();
        assert!(text.contains("\"connection_name\":\"SSHConnection\""));
        assert!(text.contains("\"server_name\":\"build-box\""));
        assert_eq!(text.parse::<ConnectionDescriptor>().unwrap(), desc);
    }

    #[test]
    fn test_password_never_persisted() {
        let config = SshConfig::new("h", "u", AuthMethod::password("hunter2"));
        let desc = ConnectionDescriptor::ssh("h", &config, false);
        assert!(!desc.to_string().contains("hunter2"));
        assert_eq!(desc.ssh_key, None);

        let rebuilt = desc.ssh_config(Some("hunter2")).unwrap();
        assert_eq!(rebuilt.auth, AuthMethod::password("hunter2"));
        assert_eq!(desc.ssh_config(None).unwrap().auth, AuthMethod::Agent);
    }

    #[test]
    fn test_map_round_trip() {
        let desc = remote();
        let map = desc.to_map();
        assert_eq!(map["port"], Value::from(2222));
        assert_eq!(map["address"], Value::from("10.0.0.5"));
        assert_eq!(ConnectionDescriptor::from_map(map).unwrap(), desc);
    }

    #[test]
    fn test_local_has_no_ssh_config() {
        let desc = ConnectionDescriptor::local("Workstation", "me");
        assert!(desc.is_local());
        assert!(matches!(
            desc.ssh_config(None),
            Err(DescriptorError::MissingAddress(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("connections.json");
        assert!(load_descriptors(&path).unwrap().is_empty());

        let all = vec![remote(), ConnectionDescriptor::local("ws", "me")];
        save_descriptors(&path, &all).unwrap();
        assert_eq!(load_descriptors(&path).unwrap(), all);
    }
}
