//! Configuration
//!
//! `~/.ssh/config` import, the host registry built from it and serializable
//! connection descriptors.

pub mod descriptor;
pub mod registry;
pub mod ssh_config;

pub use descriptor::{
    load_descriptors, save_descriptors, ConnectionDescriptor, ConnectionKind, DescriptorError,
};
pub use registry::HostRegistry;
pub use ssh_config::{
    default_ssh_config_path, parse_ssh_config, parse_ssh_config_content, SshConfigError,
    SshConfigHost,
};
