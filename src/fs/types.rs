//! Filesystem data types

use serde::{Deserialize, Serialize};

use crate::error::FsError;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Kind of a directory entry, derived from POSIX mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Socket,
    Fifo,
    BlockDevice,
    CharDevice,
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileKind::File,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFSOCK => FileKind::Socket,
            S_IFIFO => FileKind::Fifo,
            S_IFBLK => FileKind::BlockDevice,
            S_IFCHR => FileKind::CharDevice,
            _ => FileKind::Other,
        }
    }

    /// Type bits to OR into a permission mode.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::File => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
            FileKind::Socket => S_IFSOCK,
            FileKind::Fifo => S_IFIFO,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::CharDevice => S_IFCHR,
            FileKind::Other => 0,
        }
    }
}

/// Stat result for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Full path
    pub path: String,
    /// Last path component
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes
    pub size: u64,
    /// Full st_mode (type and permission bits)
    pub mode: u32,
    /// Last modified time (Unix timestamp)
    pub mtime: i64,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, kind: FileKind, size: u64, permissions: u32) -> Self {
        let path = path.into();
        let name = super::path_utils::file_name(&path).to_string();
        Self {
            path,
            name,
            kind,
            size,
            mode: kind.mode_bits() | (permissions & 0o7777),
            mtime: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Permission bits only, e.g. `0o755`
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Options for [`ProcessRunner::run`](super::ProcessRunner::run)
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory the command starts in
    pub cwd: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Bytes fed to the command's stdin
    pub input: Option<Vec<u8>>,
    /// Give up waiting for the command after this many seconds
    pub timeout_secs: Option<u64>,
    /// Turn a non-zero exit status into [`FsError::CommandFailed`]
    pub check: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }
}

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedProcess {
    pub args: Vec<String>,
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CompletedProcess {
    /// Command line as a single string
    pub fn command(&self) -> String {
        self.args.join(" ")
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    pub fn check_returncode(&self) -> Result<(), FsError> {
        if self.success() {
            Ok(())
        } else {
            Err(FsError::CommandFailed {
                command: self.command(),
                status: self.returncode,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o100644), FileKind::File);
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o010600), FileKind::Fifo);
        assert_eq!(FileKind::from_mode(0o140755), FileKind::Socket);
        assert_eq!(FileKind::from_mode(0o644), FileKind::Other);
    }

    #[test]
    fn test_entry_mode_combines_kind_and_permissions() {
        let entry = FileEntry::new("/srv/data/run.sh", FileKind::File, 12, 0o755);
        assert_eq!(entry.name, "run.sh");
        assert_eq!(entry.mode, 0o100755);
        assert_eq!(entry.permissions(), 0o755);
        assert!(entry.is_file());
    }

    #[test]
    fn test_check_returncode() {
        let ok = CompletedProcess {
            args: vec!["true".into()],
            returncode: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert!(ok.check_returncode().is_ok());

        let failed = CompletedProcess {
            args: vec!["ls".into(), "/missing".into()],
            returncode: 2,
            ..ok
        };
        match failed.check_returncode() {
            Err(FsError::CommandFailed { command, status }) => {
                assert_eq!(command, "ls /missing");
                assert_eq!(status, 2);
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }
}
