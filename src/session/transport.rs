//! Transport boundary
//!
//! A [`Transport`] is the connection to one host. It authenticates, runs
//! commands and hands out a [`FileChannel`] for file operations. The SSH
//! implementation lives in `crate::ssh`; `MemoryTransport` (feature `test-utils`) emulates
//! a host in memory.

use std::path::Path;

use crate::error::FsError;
use crate::fs::{CompletedProcess, FileEntry, RunOptions};

/// Connection to a single host
pub trait Transport: Send + 'static {
    type Channel: FileChannel;

    /// Host identity used in logs
    fn host(&self) -> &str;

    /// One attempt to connect and authenticate.
    ///
    /// A rejected credential must be reported as [`FsError::Authentication`];
    /// an unreachable host as a transient kind.
    fn authenticate(&mut self) -> Result<(), FsError>;

    /// Drop the connection. Must be safe to call when already disconnected.
    fn disconnect(&mut self);

    /// Open the file-transfer channel
    fn open_channel(&mut self) -> Result<Self::Channel, FsError>;

    /// Run a shell command line on the host
    fn exec(&mut self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError>;
}

/// File-transfer channel (an SFTP subsystem for SSH)
pub trait FileChannel: Send {
    fn stat(&mut self, path: &str) -> Result<FileEntry, FsError>;

    fn lstat(&mut self, path: &str) -> Result<FileEntry, FsError>;

    /// Directory listing with lstat attributes, excluding `.` and `..`
    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, FsError>;

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError>;

    fn rmdir(&mut self, path: &str) -> Result<(), FsError>;

    fn remove(&mut self, path: &str) -> Result<(), FsError>;

    fn rename(&mut self, src: &str, dst: &str) -> Result<(), FsError>;

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), FsError>;

    fn symlink(&mut self, target: &str, link: &str) -> Result<(), FsError>;

    fn readlink(&mut self, path: &str) -> Result<String, FsError>;

    fn realpath(&mut self, path: &str) -> Result<String, FsError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError>;

    fn write_file(&mut self, path: &str, data: &[u8], append: bool) -> Result<(), FsError>;

    /// Download `remote` into the local file `local`
    fn get(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError>;

    /// Upload the local file `local` to `remote`
    fn put(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError>;
}
