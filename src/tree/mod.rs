//! Traversal of a filesystem tree: walk, glob, filters and recursive removal

pub mod filter;
pub mod glob;
pub mod walk;

pub use filter::FileFilter;
pub use glob::{glob, Glob, GlobPattern};
pub use walk::{walk, Walk, WalkEntry, WalkOptions};

use tracing::debug;

use crate::error::FsError;
use crate::fs::{FileKind, FileSystem};

/// `glob` with an implicit leading `**/`
pub fn rglob<'a>(fs: &'a dyn FileSystem, base: &str, pattern: &str) -> Result<Glob<'a>, FsError> {
    glob(fs, base, &format!("**/{}", pattern))
}

/// Remove `path` and everything below it.
///
/// Children are removed before their parent. Symlinks are removed, never
/// followed. `path` itself must be a real directory.
pub fn remove_tree(fs: &dyn FileSystem, path: &str) -> Result<(), FsError> {
    let entry = fs.lstat(path)?;
    if entry.kind != FileKind::Directory {
        return Err(FsError::NotADirectory(path.to_string()));
    }

    let options = WalkOptions {
        top_down: false,
        follow_symlinks: false,
    };
    for dir in walk(fs, path, options) {
        let dir = dir?;
        for name in &dir.files {
            fs.remove(&fs.join(&dir.root, name))?;
        }
        fs.rmdir(&dir.root)?;
        debug!("Removed directory {}", dir.root);
    }
    Ok(())
}
