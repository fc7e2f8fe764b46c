//! Path handle bound to one filesystem
//!
//! Every operation that derives a new path returns another [`HostPath`] on the
//! same filesystem, so chained path code never falls back to bare strings.

use std::fmt;

use crate::error::FsError;
use crate::fs::path_utils::file_name;
use crate::fs::{open, EncodingErrors, FileEntry, FileKind, FileObject, FileSystem};
use crate::tree::{self, GlobPattern};

/// A path on a particular filesystem
#[derive(Clone)]
pub struct HostPath<'a> {
    fs: &'a dyn FileSystem,
    path: String,
}

impl<'a> HostPath<'a> {
    pub fn new(fs: &'a dyn FileSystem, path: impl Into<String>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn filesystem(&self) -> &'a dyn FileSystem {
        self.fs
    }

    fn sibling(&self, path: impl Into<String>) -> HostPath<'a> {
        HostPath::new(self.fs, path)
    }

    pub fn join(&self, name: &str) -> HostPath<'a> {
        self.sibling(self.fs.join(&self.path, name))
    }

    pub fn parent(&self) -> HostPath<'a> {
        self.sibling(self.fs.parent(&self.path))
    }

    /// Final component
    pub fn name(&self) -> &str {
        file_name(&self.path)
    }

    /// Final component without its suffix
    pub fn stem(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(pos) if pos > 0 => &name[..pos],
            _ => name,
        }
    }

    /// Extension of the final component including the dot, `""` if none
    pub fn suffix(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(pos) if pos > 0 && pos < name.len() - 1 => &name[pos..],
            _ => "",
        }
    }

    pub fn with_name(&self, name: &str) -> Result<HostPath<'a>, FsError> {
        if self.name().is_empty() {
            return Err(FsError::InvalidArgument(format!("{} has an empty name", self)));
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument(format!("Invalid name {:?}", name)));
        }
        Ok(self.parent().join(name))
    }

    pub fn with_suffix(&self, suffix: &str) -> Result<HostPath<'a>, FsError> {
        if !suffix.is_empty() && !suffix.starts_with('.') {
            return Err(FsError::InvalidArgument(format!("Invalid suffix {:?}", suffix)));
        }
        let name = format!("{}{}", self.stem(), suffix);
        self.with_name(&name)
    }

    /// Absolute path with symlinks resolved
    pub fn resolve(&self) -> Result<HostPath<'a>, FsError> {
        Ok(self.sibling(self.fs.realpath(&self.path)?))
    }

    /// Home directory of the filesystem's user
    pub fn home(&self) -> Result<HostPath<'a>, FsError> {
        Ok(self.sibling(self.fs.home()?))
    }

    pub fn stat(&self) -> Result<FileEntry, FsError> {
        self.fs.stat(&self.path)
    }

    pub fn lstat(&self) -> Result<FileEntry, FsError> {
        self.fs.lstat(&self.path)
    }

    pub fn chmod(&self, mode: u32) -> Result<(), FsError> {
        self.fs.chmod(&self.path, mode)
    }

    fn is_kind(&self, kind: FileKind) -> Result<bool, FsError> {
        Ok(self.fs.kind_of(&self.path, true)? == Some(kind))
    }

    pub fn is_dir(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::Directory)
    }

    pub fn is_file(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::File)
    }

    pub fn is_symlink(&self) -> Result<bool, FsError> {
        Ok(self.fs.kind_of(&self.path, false)? == Some(FileKind::Symlink))
    }

    pub fn is_socket(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::Socket)
    }

    pub fn is_fifo(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::Fifo)
    }

    pub fn is_block_device(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::BlockDevice)
    }

    pub fn is_char_device(&self) -> Result<bool, FsError> {
        self.is_kind(FileKind::CharDevice)
    }

    /// True when any kind of entry is at this path, including a dangling symlink
    pub fn exists(&self) -> Result<bool, FsError> {
        Ok(self.is_dir()?
            || self.is_file()?
            || self.is_symlink()?
            || self.is_socket()?
            || self.is_fifo()?
            || self.is_block_device()?
            || self.is_char_device()?)
    }

    fn require_dir(&self) -> Result<(), FsError> {
        if self.is_dir()? {
            Ok(())
        } else {
            Err(FsError::NotFound(format!("Directory {} does not exist.", self)))
        }
    }

    /// Children of this directory
    pub fn iterdir(&self) -> Result<Vec<HostPath<'a>>, FsError> {
        self.require_dir()?;
        Ok(self
            .fs
            .listdir(&self.path)?
            .into_iter()
            .map(|name| self.join(&name))
            .collect())
    }

    /// Entries below this directory matching `pattern`
    pub fn glob(
        &self,
        pattern: &str,
    ) -> Result<impl Iterator<Item = Result<HostPath<'a>, FsError>> + 'a, FsError> {
        let pattern = GlobPattern::parse(pattern)?;
        self.require_dir()?;
        let fs = self.fs;
        Ok(tree::Glob::new(fs, &self.path, pattern).map(move |p| p.map(|p| HostPath::new(fs, p))))
    }

    /// `glob` with an implicit leading `**/`
    pub fn rglob(
        &self,
        pattern: &str,
    ) -> Result<impl Iterator<Item = Result<HostPath<'a>, FsError>> + 'a, FsError> {
        self.glob(&format!("**/{}", pattern))
    }

    pub fn mkdir(&self, mode: u32, parents: bool, exist_ok: bool) -> Result<(), FsError> {
        if parents {
            return self.fs.makedirs(&self.path, mode, exist_ok);
        }
        match self.fs.mkdir(&self.path, mode) {
            Err(FsError::AlreadyExists(_)) if exist_ok && self.is_dir()? => Ok(()),
            other => other,
        }
    }

    /// Remove this directory and everything below it, then point at the parent
    pub fn rmdir(&mut self) -> Result<(), FsError> {
        tree::remove_tree(self.fs, &self.path)?;
        self.path = self.fs.parent(&self.path);
        Ok(())
    }

    /// Remove a file or symlink
    pub fn unlink(&self, missing_ok: bool) -> Result<(), FsError> {
        match self.fs.kind_of(&self.path, false)? {
            None if missing_ok => Ok(()),
            None => Err(FsError::NotFound(format!(
                "Cannot unlink {}, it does not exist",
                self
            ))),
            Some(FileKind::Directory) => Err(FsError::IsADirectory(format!(
                "{} is a directory, use rmdir instead",
                self
            ))),
            Some(_) => self.fs.remove(&self.path),
        }
    }

    /// Create an empty file if nothing is here yet
    pub fn touch(&self, exist_ok: bool) -> Result<(), FsError> {
        if self.exists()? {
            return if exist_ok {
                Ok(())
            } else {
                Err(FsError::AlreadyExists(format!(
                    "{} is a file or dir, cannot create new file",
                    self
                )))
            };
        }
        self.fs.write_file(&self.path, &[], false)
    }

    /// Rename to `target` and return the new path
    pub fn rename(&self, target: &str) -> Result<HostPath<'a>, FsError> {
        self.fs.rename(&self.path, target)?;
        Ok(self.sibling(target))
    }

    /// Make this path a symlink pointing at `target`
    pub fn symlink_to(&self, target: &str) -> Result<(), FsError> {
        self.fs.symlink(target, &self.path)
    }

    pub fn open(
        &self,
        mode: &str,
        encoding: Option<&str>,
        errors: EncodingErrors,
    ) -> Result<FileObject<'a>, FsError> {
        open(self.fs, &self.path, mode, encoding, errors)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>, FsError> {
        self.fs.read_file(&self.path)
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<(), FsError> {
        self.fs.write_file(&self.path, data, false)
    }

    pub fn read_text(&self, encoding: Option<&str>, errors: EncodingErrors) -> Result<String, FsError> {
        self.open("r", encoding, errors)?.read_text()
    }

    pub fn write_text(
        &self,
        text: &str,
        encoding: Option<&str>,
        errors: EncodingErrors,
    ) -> Result<(), FsError> {
        let mut file = self.open("w", encoding, errors)?;
        file.write_text(text)?;
        file.close()
    }
}

impl fmt::Display for HostPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl fmt::Debug for HostPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPath").field(&self.path).finish()
    }
}

impl PartialEq for HostPath<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl AsRef<str> for HostPath<'_> {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryHost, MemoryTransport, Session, SessionOptions};

    fn session() -> (Session<MemoryTransport>, MemoryHost) {
        let host = MemoryHost::new("mem-path");
        host.write("/w/notes.txt", b"hello");
        host.write("/w/sub/deep.txt", b"");
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());
        session.connect().unwrap();
        (session, host)
    }

    #[test]
    fn test_name_parts() {
        let (session, _host) = session();
        let p = HostPath::new(&session, "/w/archive.tar.gz");
        assert_eq!(p.name(), "archive.tar.gz");
        assert_eq!(p.stem(), "archive.tar");
        assert_eq!(p.suffix(), ".gz");
        assert_eq!(p.parent().as_str(), "/w");
        assert_eq!(p.with_name("x.txt").unwrap().as_str(), "/w/x.txt");
        assert_eq!(p.with_suffix(".zip").unwrap().as_str(), "/w/archive.tar.zip");
        assert_eq!(HostPath::new(&session, "/w/.bashrc").suffix(), "");
        assert!(HostPath::new(&session, "/").with_name("a").is_err());
    }

    #[test]
    fn test_derived_paths_share_filesystem() {
        let (session, _host) = session();
        let root = HostPath::new(&session, "/w");
        let child = root.join("notes.txt");
        assert!(std::ptr::eq(
            child.filesystem() as *const dyn FileSystem as *const u8,
            root.filesystem() as *const dyn FileSystem as *const u8
        ));
        assert!(child.is_file().unwrap());
        assert_eq!(child.parent(), root);
        assert_eq!(root.home().unwrap().as_str(), "/home/user");
    }

    #[test]
    fn test_exists_covers_all_kinds() {
        let (session, host) = session();
        host.symlink("/nowhere", "/w/dangling");
        assert!(HostPath::new(&session, "/w").exists().unwrap());
        assert!(HostPath::new(&session, "/w/notes.txt").exists().unwrap());
        assert!(HostPath::new(&session, "/w/dangling").exists().unwrap());
        assert!(!HostPath::new(&session, "/w/nothing").exists().unwrap());
    }

    #[test]
    fn test_iterdir_and_glob() {
        let (session, _host) = session();
        let root = HostPath::new(&session, "/w");
        let names: Vec<_> = root
            .iterdir()
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["notes.txt", "sub"]);

        let found: Vec<_> = root.glob("*.txt").unwrap().map(|p| p.unwrap()).collect();
        assert_eq!(found, vec![HostPath::new(&session, "/w/notes.txt")]);
        assert!(found[0].is_file().unwrap());

        let missing = HostPath::new(&session, "/w/notes.txt");
        assert!(matches!(missing.glob("*"), Err(FsError::NotFound(_))));
        assert!(matches!(missing.iterdir(), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_rmdir_is_recursive_and_repoints() {
        let (session, host) = session();
        let mut p = HostPath::new(&session, "/w/sub");
        p.rmdir().unwrap();
        assert_eq!(p.as_str(), "/w");
        assert!(!host.exists("/w/sub"));
        assert!(host.exists("/w/notes.txt"));
    }

    #[test]
    fn test_unlink() {
        let (session, host) = session();
        let missing = HostPath::new(&session, "/w/missing.txt");
        assert!(matches!(missing.unlink(false), Err(FsError::NotFound(_))));
        missing.unlink(true).unwrap();

        let dir = HostPath::new(&session, "/w/sub");
        assert!(matches!(dir.unlink(false), Err(FsError::IsADirectory(_))));

        HostPath::new(&session, "/w/notes.txt").unlink(false).unwrap();
        assert!(!host.exists("/w/notes.txt"));
    }

    #[test]
    fn test_touch_mkdir_rename() {
        let (session, host) = session();
        let file = HostPath::new(&session, "/w/new.txt");
        file.touch(true).unwrap();
        assert_eq!(host.read("/w/new.txt").unwrap(), b"");
        assert!(matches!(file.touch(false), Err(FsError::AlreadyExists(_))));

        // an existing file is left as is
        HostPath::new(&session, "/w/notes.txt").touch(true).unwrap();
        assert_eq!(host.read("/w/notes.txt").unwrap(), b"hello");

        let dir = HostPath::new(&session, "/w/a/b");
        assert!(dir.mkdir(0o755, false, false).is_err());
        dir.mkdir(0o755, true, false).unwrap();
        dir.mkdir(0o755, false, true).unwrap();
        assert!(dir.is_dir().unwrap());

        let moved = file.rename("/w/a/moved.txt").unwrap();
        assert!(moved.is_file().unwrap());
        assert!(!file.exists().unwrap());
    }

    #[test]
    fn test_text_and_bytes() {
        let (session, host) = session();
        let p = HostPath::new(&session, "/w/text.txt");
        p.write_text("grüße", None, EncodingErrors::Strict).unwrap();
        assert_eq!(p.read_text(None, EncodingErrors::Strict).unwrap(), "grüße");

        p.write_text("grüße", Some("latin1"), EncodingErrors::Strict)
            .unwrap();
        assert_eq!(host.read("/w/text.txt").unwrap(), b"gr\xfc\xdfe");
        assert_eq!(
            p.read_text(Some("latin1"), EncodingErrors::Strict).unwrap(),
            "grüße"
        );

        p.write_bytes(b"\x00\x01").unwrap();
        assert_eq!(p.read_bytes().unwrap(), vec![0, 1]);
    }
}
