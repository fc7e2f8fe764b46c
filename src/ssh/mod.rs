//! SSH backend
//!
//! Connects with russh, verifies host keys against ~/.ssh/known_hosts,
//! authenticates by password, key or ssh-agent and exposes the connection as
//! a [`crate::session::Transport`] with an SFTP file channel.

mod agent;
mod client;
mod config;
mod transport;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::ClientHandler;
pub use config::{AuthMethod, SshConfig};
pub use transport::{SshFileChannel, SshTransport};
