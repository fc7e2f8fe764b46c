//! SSH Config Parser
//!
//! Reads ~/.ssh/config so connections can be opened by host alias.
//! Supports Host, HostName, User, Port and IdentityFile.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A parsed SSH config host entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfigHost {
    /// Host alias (the pattern after "Host")
    pub alias: String,
    /// Actual hostname (HostName directive)
    pub hostname: Option<String>,
    /// Username (User directive)
    pub user: Option<String>,
    /// Port number (Port directive)
    pub port: Option<u16>,
    /// Identity files in the order given, `~/` expanded
    #[serde(default)]
    pub identity_files: Vec<String>,
}

impl SshConfigHost {
    /// Get the effective hostname (hostname or alias)
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    /// Get effective port (port or 22)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// First configured identity file
    pub fn identity_file(&self) -> Option<&str> {
        self.identity_files.first().map(String::as_str)
    }

    /// Check if this is a wildcard pattern
    pub fn is_wildcard(&self) -> bool {
        is_pattern(&self.alias)
    }
}

fn is_pattern(alias: &str) -> bool {
    alias.contains('*') || alias.contains('?') || alias.starts_with('!')
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Parse an SSH config file. A missing file has no hosts.
pub fn parse_ssh_config(path: Option<&Path>) -> Result<Vec<SshConfigHost>, SshConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_ssh_config_path()?,
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new());
        }
        Err(e) => return Err(SshConfigError::Io(e)),
    };

    parse_ssh_config_content(&content)
}

fn expand_home(value: &str) -> String {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(stripped), Some(home)) => home.join(stripped).to_string_lossy().into_owned(),
        _ => value.to_string(),
    }
}

/// Parse SSH config content string.
///
/// A `Host` line with several aliases yields one entry per non-wildcard
/// alias. Directives before the first `Host` line are ignored.
pub fn parse_ssh_config_content(content: &str) -> Result<Vec<SshConfigHost>, SshConfigError> {
    let mut hosts: Vec<SshConfigHost> = Vec::new();
    // Entries opened by the most recent Host line
    let mut current: Vec<SshConfigHost> = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // "Key Value" or "Key=Value"
        let (key, value) = match line.find(|c: char| c == '=' || c.is_whitespace()) {
            Some(pos) => (
                &line[..pos],
                line[pos + 1..].trim_start_matches(|c: char| c == '=' || c.is_whitespace()),
            ),
            None => {
                return Err(SshConfigError::Parse {
                    line: index + 1,
                    message: format!("missing value for '{}'", line),
                })
            }
        };
        let value = value.trim().trim_matches('"');

        match key.to_lowercase().as_str() {
            "host" => {
                hosts.append(&mut current);
                current = value
                    .split_whitespace()
                    .filter(|alias| !is_pattern(alias))
                    .map(|alias| SshConfigHost {
                        alias: alias.to_string(),
                        ..Default::default()
                    })
                    .collect();
            }
            "match" => hosts.append(&mut current),
            "hostname" => current
                .iter_mut()
                .for_each(|h| h.hostname = Some(value.to_string())),
            "user" => current
                .iter_mut()
                .for_each(|h| h.user = Some(value.to_string())),
            "port" => {
                let port: u16 = value.parse().map_err(|_| SshConfigError::Parse {
                    line: index + 1,
                    message: format!("invalid port '{}'", value),
                })?;
                current.iter_mut().for_each(|h| h.port = Some(port));
            }
            "identityfile" => {
                let expanded = expand_home(value);
                current
                    .iter_mut()
                    .for_each(|h| h.identity_files.push(expanded.clone()));
            }
            _ => {}
        }
    }

    hosts.append(&mut current);
    Ok(hosts)
}
