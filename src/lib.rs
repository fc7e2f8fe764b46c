//! hostfs - one filesystem and process API for the local machine and SSH hosts
//!
//! File and command code is written once against [`fs::FileSystem`],
//! [`fs::FileTransfer`] and [`fs::ProcessRunner`]. Remote hosts are reached
//! over SSH/SFTP; a dropped transport is renegotiated and the interrupted call
//! is run again by [`retry::RetryGuard`].

pub mod config;
pub mod connection;
pub mod error;
pub mod fs;
pub mod path;
pub mod retry;
pub mod session;
pub mod ssh;
pub mod transfer;
pub mod tree;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConnectionDescriptor, HostRegistry};
pub use connection::{
    from_descriptor, open_host, Connection, ConnectionOptions, LocalConnection, MultiConnection,
    SshConnection,
};
pub use error::{ErrorKind, FsError};
pub use fs::{FileSystem, FileTransfer, LocalFs, ProcessRunner, RunOptions};
pub use path::HostPath;
pub use retry::{RetryGuard, RetryPolicy};
pub use transfer::{Direction, TransferOptions, TransferProgress, TreeTransferEngine};

/// Install a `RUST_LOG`-driven subscriber (default `info`).
///
/// Does nothing if the application already installed one.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
