//! SSH Configuration

use serde::{Deserialize, Serialize};

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Strict host key checking (default: false)
    /// - true: reject connections to unknown hosts
    /// - false: learn unknown hosts, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Fall back to the ssh-agent when key or password auth is rejected
    #[serde(default)]
    pub allow_agent: bool,
}

/// Authentication methods supported. Exactly one credential per config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Key file path, if this is key authentication
    pub fn key_path(&self) -> Option<&str> {
        match self {
            AuthMethod::Key { key_path, .. } => Some(key_path),
            _ => None,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            auth,
            ..Default::default()
        }
    }

    /// `host:port` for logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Agent,
            timeout_secs: 30,
            strict_host_key_checking: false,
            allow_agent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: SshConfig = serde_json::from_str(
            r#"{"host": "example.com", "username": "me", "auth": {"type": "agent"}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.strict_host_key_checking);
        assert_eq!(config.auth, AuthMethod::Agent);
        assert_eq!(config.address(), "example.com:22");
    }

    #[test]
    fn test_auth_tagging() {
        let json = serde_json::to_value(AuthMethod::key("/k", None)).unwrap();
        assert_eq!(json["type"], "key");
        assert_eq!(json["key_path"], "/k");
        assert_eq!(AuthMethod::key("/k", None).key_path(), Some("/k"));
        assert_eq!(AuthMethod::password("pw").key_path(), None);
    }
}
