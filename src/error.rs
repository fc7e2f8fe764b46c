//! Error types shared by every filesystem backend

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Could not open file channel: {0}")]
    ChannelOpen(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure of the local disk, never of the transport
    #[error("Local IO error on {path}: {source}")]
    LocalIo {
        path: String,
        source: std::io::Error,
    },

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Command '{command}' returned non-zero exit status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("Command '{command}' timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Coarse classification of [`FsError`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    ConnectionFailed,
    ConnectionLost,
    ChannelClosed,
    ChannelOpen,
    Io,
    LocalIo,
    Protocol,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    PermissionDenied,
    CommandFailed,
    Timeout,
    InvalidArgument,
    Unsupported,
}

impl ErrorKind {
    /// Faults that are likely cured by reconnecting.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionLost
                | ErrorKind::ChannelClosed
                | ErrorKind::ChannelOpen
                | ErrorKind::Io
                | ErrorKind::Protocol
        )
    }

    /// Faults describing the real state of the filesystem or the arguments.
    pub fn is_domain(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::AlreadyExists
                | ErrorKind::NotADirectory
                | ErrorKind::IsADirectory
                | ErrorKind::DirectoryNotEmpty
                | ErrorKind::PermissionDenied
                | ErrorKind::CommandFailed
                | ErrorKind::LocalIo
                | ErrorKind::Timeout
                | ErrorKind::InvalidArgument
                | ErrorKind::Unsupported
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Authentication(_) => ErrorKind::Authentication,
            FsError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            FsError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            FsError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            FsError::ChannelOpen(_) => ErrorKind::ChannelOpen,
            FsError::Io(_) => ErrorKind::Io,
            FsError::LocalIo { .. } => ErrorKind::LocalIo,
            FsError::Protocol(_) => ErrorKind::Protocol,
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::NotADirectory(_) => ErrorKind::NotADirectory,
            FsError::IsADirectory(_) => ErrorKind::IsADirectory,
            FsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            FsError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FsError::CommandFailed { .. } => ErrorKind::CommandFailed,
            FsError::Timeout { .. } => ErrorKind::Timeout,
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FsError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Map a local disk error onto the domain kinds, keeping the offending path.
    ///
    /// Kinds without a domain counterpart become [`FsError::LocalIo`], which
    /// the retry guard never mistakes for a dropped transport.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind as Io;

        match err.kind() {
            Io::NotFound => FsError::NotFound(path.to_string()),
            Io::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            Io::PermissionDenied => FsError::PermissionDenied(path.to_string()),
            Io::NotADirectory => FsError::NotADirectory(path.to_string()),
            Io::IsADirectory => FsError::IsADirectory(path.to_string()),
            Io::DirectoryNotEmpty => FsError::DirectoryNotEmpty(path.to_string()),
            Io::InvalidInput => FsError::InvalidArgument(format!("{}: {}", path, err)),
            _ => FsError::LocalIo {
                path: path.to_string(),
                source: err,
            },
        }
    }
}

impl From<russh::Error> for FsError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::HUP => {
                FsError::ConnectionLost(err.to_string())
            }
            russh::Error::IO(e) => FsError::Io(e),
            other => FsError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for FsError {
    fn from(err: russh::keys::Error) -> Self {
        FsError::Authentication(format!("Key error: {}", err))
    }
}

impl From<russh_sftp::client::error::Error> for FsError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as Sftp;

        let msg = err.to_string();
        match err {
            Sftp::Timeout | Sftp::IO(_) => FsError::ChannelClosed(msg),
            _ if msg.contains("No such file") || msg.contains("not found") => FsError::NotFound(msg),
            _ if msg.contains("Permission denied") => FsError::PermissionDenied(msg),
            _ => FsError::Protocol(msg),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::InvalidArgument(err.to_string())
    }
}
