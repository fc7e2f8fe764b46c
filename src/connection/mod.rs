//! Connections
//!
//! A [`Connection`] bundles the filesystem, transfer and process capabilities
//! of one host. [`SshConnection`] routes every network call through a
//! [`crate::retry::RetryGuard`]; [`LocalConnection`] serves the local machine
//! through the same surface. [`MultiConnection`] fans calls out to many.

mod local;
mod multi;
mod remote;

use std::sync::Arc;

use crate::config::{ConnectionDescriptor, HostRegistry};
use crate::error::FsError;
use crate::fs::{EncodingErrors, FileObject, FileSystem, FileTransfer, ProcessRunner};
use crate::path::HostPath;
use crate::retry::RetryPolicy;
use crate::ssh::SshTransport;
use crate::transfer::{TransferOptions, TransferPlan, TransferProgress};

pub use local::LocalConnection;
pub use multi::{MultiConnection, DEFAULT_MAX_PARALLEL};
pub use remote::SshConnection;

/// Options shared by every connection constructor
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Serialize whole operations so the connection can be shared by threads
    pub thread_safe: bool,
    /// Retry behaviour for network faults
    pub retry: RetryPolicy,
}

impl ConnectionOptions {
    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One host, local or remote
pub trait Connection: Send + Sync {
    /// Lower-cased name the connection was opened under
    fn server_name(&self) -> &str;

    fn is_local(&self) -> bool;

    fn filesystem(&self) -> &dyn FileSystem;

    fn transfer(&self) -> &dyn FileTransfer;

    fn runner(&self) -> &dyn ProcessRunner;

    /// Copy the directory tree `remote` on this host to the local `local`
    fn download_tree(
        &self,
        remote: &str,
        local: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError>;

    /// Copy the local directory tree `local` to `remote` on this host
    fn upload_tree(
        &self,
        local: &str,
        remote: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError>;

    /// Remove a directory and everything below it
    fn rmtree(&self, path: &str) -> Result<(), FsError>;

    fn open(
        &self,
        path: &str,
        mode: &str,
        encoding: Option<&str>,
        errors: EncodingErrors,
    ) -> Result<FileObject<'_>, FsError>;

    /// Release the underlying transport. Later calls reconnect.
    fn close(&self);

    fn to_descriptor(&self) -> ConnectionDescriptor;

    fn path(&self, path: &str) -> HostPath<'_> {
        HostPath::new(self.filesystem(), path)
    }
}

/// Reopen a connection from its descriptor.
///
/// `password` is only consulted for remote descriptors without a key.
pub fn from_descriptor(
    descriptor: &ConnectionDescriptor,
    password: Option<&str>,
) -> Result<Arc<dyn Connection>, FsError> {
    if descriptor.is_local() {
        return Ok(Arc::new(LocalConnection::with_user(
            &descriptor.server_name,
            &descriptor.user_name,
        )));
    }

    let config = descriptor
        .ssh_config(password)
        .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
    let options = ConnectionOptions::default().thread_safe(descriptor.thread_safe);
    let connection = SshConnection::<SshTransport>::open(&descriptor.server_name, config, options)?;
    Ok(Arc::new(connection))
}

/// Open `alias` from the registry, or the local machine when `local` is set
pub fn open_host(
    registry: &HostRegistry,
    alias: &str,
    local: bool,
    allow_agent: bool,
    options: ConnectionOptions,
) -> Result<Arc<dyn Connection>, FsError> {
    if local {
        return Ok(Arc::new(LocalConnection::new(alias)));
    }
    let config = registry.ssh_config_for(alias, allow_agent)?;
    Ok(Arc::new(SshConnection::<SshTransport>::open(alias, config, options)?))
}
