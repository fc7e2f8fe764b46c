//! Filesystem capability interfaces
//!
//! Every backend (the local machine, an SSH session, a guarded SSH connection)
//! implements the same three traits so that tree walking, transfers and path
//! handling are written once against `&dyn FileSystem`.

pub mod io;
pub mod local;
pub mod path_utils;
pub mod types;

use std::path::Path;

use crate::error::FsError;

pub use io::{open, EncodingErrors, FileObject, OpenMode};
pub use local::LocalFs;
pub use types::{CompletedProcess, FileEntry, FileKind, RunOptions};

/// Default mode for created directories
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Primitive filesystem operations
pub trait FileSystem: Send + Sync {
    /// Stat a path, following symlinks
    fn stat(&self, path: &str) -> Result<FileEntry, FsError>;

    /// Stat a path without following symlinks
    fn lstat(&self, path: &str) -> Result<FileEntry, FsError>;

    /// List a directory in one call. Entries carry lstat attributes.
    fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, FsError>;

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Remove an empty directory
    fn rmdir(&self, path: &str) -> Result<(), FsError>;

    /// Remove a file or symlink
    fn remove(&self, path: &str) -> Result<(), FsError>;

    fn rename(&self, src: &str, dst: &str) -> Result<(), FsError>;

    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError>;

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError>;

    fn readlink(&self, path: &str) -> Result<String, FsError>;

    /// Absolute, symlink-free form of a path
    fn realpath(&self, path: &str) -> Result<String, FsError>;

    /// Home directory of the user owning the filesystem
    fn home(&self) -> Result<String, FsError>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;

    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError>;

    fn join(&self, base: &str, name: &str) -> String {
        path_utils::join_remote_path(base, name)
    }

    fn parent(&self, path: &str) -> String {
        path_utils::parent(path)
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        self.kind_of(path, true).map(|k| k == Some(FileKind::Directory))
    }

    fn is_file(&self, path: &str) -> Result<bool, FsError> {
        self.kind_of(path, true).map(|k| k == Some(FileKind::File))
    }

    /// Kind of the entry at `path`, `None` when nothing is there
    fn kind_of(&self, path: &str, follow_symlinks: bool) -> Result<Option<FileKind>, FsError> {
        let stat = if follow_symlinks {
            self.stat(path)
        } else {
            self.lstat(path)
        };
        match stat {
            Ok(entry) => Ok(Some(entry.kind)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        Ok(self.list_dir(path)?.into_iter().map(|e| e.name).collect())
    }

    /// Create a directory and all missing parents
    fn makedirs(&self, path: &str, mode: u32, exist_ok: bool) -> Result<(), FsError> {
        if self.is_dir(path)? {
            return if exist_ok {
                Ok(())
            } else {
                Err(FsError::AlreadyExists(path.to_string()))
            };
        }

        let mut missing = Vec::new();
        let mut current = path.trim_end_matches('/').to_string();
        while !current.is_empty() && current != "." && current != "/" {
            match self.kind_of(&current, true)? {
                Some(FileKind::Directory) => break,
                Some(_) => return Err(FsError::NotADirectory(current)),
                None => {
                    let parent = self.parent(&current);
                    missing.push(current);
                    if parent == missing[missing.len() - 1] {
                        break;
                    }
                    current = parent;
                }
            }
        }

        for dir in missing.iter().rev() {
            match self.mkdir(dir, mode) {
                Ok(()) => {}
                Err(FsError::AlreadyExists(_)) if self.is_dir(dir)? => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Whole-file copies between a filesystem and the local machine
///
/// The progress callback receives the bytes copied so far for the current file.
pub trait FileTransfer: Send + Sync {
    /// Copy `remote` from this filesystem to `local`
    fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError>;

    /// Copy `local` onto this filesystem at `remote`
    fn put(
        &self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError>;
}

/// Command execution on the host owning the filesystem
pub trait ProcessRunner: Send + Sync {
    /// Execute a command line through the host's shell. `options.check` is
    /// left to the callers below.
    fn execute(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError>;

    /// Run a command line through the host's shell
    fn run_shell(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        let completed = self.execute(command, options)?;
        if options.check {
            completed.check_returncode()?;
        }
        Ok(completed)
    }

    /// Run an argument vector; arguments are quoted for the shell when needed
    fn run(&self, args: &[&str], options: &RunOptions) -> Result<CompletedProcess, FsError> {
        if args.is_empty() {
            return Err(FsError::InvalidArgument("empty command".to_string()));
        }
        let command = args
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let mut completed = self.execute(&command, options)?;
        completed.args = args.iter().map(|a| a.to_string()).collect();
        if options.check {
            completed.check_returncode()?;
        }
        Ok(completed)
    }
}

/// Quote a shell argument with single quotes when it has special characters.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
