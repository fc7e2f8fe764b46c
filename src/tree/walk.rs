//! Lazy directory walk built on `list_dir`/`stat`

use tracing::debug;

use crate::error::FsError;
use crate::fs::{FileKind, FileSystem};

/// Walk configuration
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Yield a directory before its subdirectories
    pub top_down: bool,
    /// Classify symlinks by their target and descend into linked directories.
    /// Link cycles are not detected.
    pub follow_symlinks: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            top_down: true,
            follow_symlinks: false,
        }
    }
}

/// One directory visited by [`Walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path of the directory
    pub root: String,
    /// `/` separated path of `root` below the walk's start (`""` for the start)
    pub relative: String,
    /// Subdirectory names
    pub dirs: Vec<String>,
    /// Names of everything else
    pub files: Vec<String>,
    /// 0 for the start directory
    pub depth: usize,
}

impl WalkEntry {
    /// Relative path of a child of this directory
    pub fn relative_child(&self, name: &str) -> String {
        if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative, name)
        }
    }
}

struct Frame {
    entry: WalkEntry,
    next_child: usize,
}

/// Depth-first walk yielding `(root, dirs, files)` per directory.
///
/// Every directory is listed exactly once. A listing error is yielded once
/// and ends the walk.
pub struct Walk<'a> {
    fs: &'a dyn FileSystem,
    options: WalkOptions,
    start: Option<String>,
    /// Top-down: directories waiting to be listed
    pending: Vec<(String, String, usize)>,
    /// Top-down: last yielded entry, whose subdirectories are not queued yet
    last: Option<WalkEntry>,
    /// Bottom-up: open directories
    frames: Vec<Frame>,
    done: bool,
}

impl<'a> Walk<'a> {
    pub fn new(fs: &'a dyn FileSystem, root: &str, options: WalkOptions) -> Self {
        Self {
            fs,
            options,
            start: Some(root.to_string()),
            pending: Vec::new(),
            last: None,
            frames: Vec::new(),
            done: false,
        }
    }

    /// Keep only the subdirectories of the last yielded entry for which `keep`
    /// returns true. Only meaningful for top-down walks.
    pub fn retain_subdirs(&mut self, mut keep: impl FnMut(&str) -> bool) {
        if let Some(last) = self.last.as_mut() {
            last.dirs.retain(|d| keep(d));
        }
    }

    /// Do not descend below the last yielded entry
    pub fn skip_subdirs(&mut self) {
        self.retain_subdirs(|_| false);
    }

    fn list(&self, root: &str, relative: &str, depth: usize) -> Result<WalkEntry, FsError> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        for entry in self.fs.list_dir(root)? {
            let is_dir = match entry.kind {
                FileKind::Directory => true,
                FileKind::Symlink if self.options.follow_symlinks => {
                    match self.fs.stat(&entry.path) {
                        Ok(target) => target.is_dir(),
                        Err(e) if e.is_transient() => return Err(e),
                        Err(e) => {
                            debug!("Treating unresolvable link {} as a file: {}", entry.path, e);
                            false
                        }
                    }
                }
                _ => false,
            };
            if is_dir {
                dirs.push(entry.name);
            } else {
                files.push(entry.name);
            }
        }
        dirs.sort();
        files.sort();

        Ok(WalkEntry {
            root: root.to_string(),
            relative: relative.to_string(),
            dirs,
            files,
            depth,
        })
    }

    fn queue_children(&mut self) {
        if let Some(last) = self.last.take() {
            for name in last.dirs.iter().rev() {
                self.pending.push((
                    self.fs.join(&last.root, name),
                    last.relative_child(name),
                    last.depth + 1,
                ));
            }
        }
    }

    fn next_top_down(&mut self) -> Option<Result<WalkEntry, FsError>> {
        if let Some(start) = self.start.take() {
            self.pending.push((start, String::new(), 0));
        }
        self.queue_children();

        let (root, relative, depth) = self.pending.pop()?;
        match self.list(&root, &relative, depth) {
            Ok(entry) => {
                self.last = Some(entry.clone());
                Some(Ok(entry))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn next_bottom_up(&mut self) -> Option<Result<WalkEntry, FsError>> {
        if let Some(start) = self.start.take() {
            match self.list(&start, "", 0) {
                Ok(entry) => self.frames.push(Frame {
                    entry,
                    next_child: 0,
                }),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        loop {
            let frame = self.frames.last_mut()?;
            if frame.next_child < frame.entry.dirs.len() {
                let name = &frame.entry.dirs[frame.next_child];
                frame.next_child += 1;
                let root = self.fs.join(&frame.entry.root, name);
                let relative = frame.entry.relative_child(name);
                let depth = frame.entry.depth + 1;

                match self.list(&root, &relative, depth) {
                    Ok(entry) => self.frames.push(Frame {
                        entry,
                        next_child: 0,
                    }),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            } else {
                let frame = self.frames.pop()?;
                return Some(Ok(frame.entry));
            }
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<WalkEntry, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.options.top_down {
            self.next_top_down()
        } else {
            self.next_bottom_up()
        }
    }
}

/// Walk `root` on `fs`
pub fn walk<'a>(fs: &'a dyn FileSystem, root: &str, options: WalkOptions) -> Walk<'a> {
    Walk::new(fs, root, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryHost, MemoryTransport, Session, SessionOptions};
    use std::collections::HashSet;

    fn tree() -> (Session<MemoryTransport>, MemoryHost) {
        let host = MemoryHost::new("mem-walk");
        host.write("/t/a/b/c.txt", b"0123456789");
        host.write("/t/a/d.txt", b"01234");
        host.write("/t/top.txt", b"");
        host.mkdir_all("/t/e");
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());
        session.connect().unwrap();
        (session, host)
    }

    #[test]
    fn test_top_down_order() {
        let (session, _host) = tree();
        let roots: Vec<_> = walk(&session, "/t", WalkOptions::default())
            .map(|e| e.unwrap().root)
            .collect();
        assert_eq!(roots, vec!["/t", "/t/a", "/t/a/b", "/t/e"]);
    }

    #[test]
    fn test_bottom_up_order() {
        let (session, _host) = tree();
        let options = WalkOptions {
            top_down: false,
            ..Default::default()
        };
        let roots: Vec<_> = walk(&session, "/t", options)
            .map(|e| e.unwrap().root)
            .collect();
        assert_eq!(roots, vec!["/t/a/b", "/t/a", "/t/e", "/t"]);
    }

    #[test]
    fn test_entries_partition_children() {
        let (session, host) = tree();
        let mut seen = HashSet::new();
        let mut listed = 0;

        for entry in walk(&session, "/t", WalkOptions::default()) {
            let entry = entry.unwrap();
            assert!(seen.insert(entry.root.clone()), "directory listed twice");
            listed += 1;

            let mut names: Vec<_> = entry.dirs.iter().chain(&entry.files).cloned().collect();
            names.sort();
            let mut expected = session.listdir(&entry.root).unwrap();
            expected.sort();
            assert_eq!(names, expected);
        }

        let dirs_on_host = host
            .paths()
            .into_iter()
            .filter(|p| p.starts_with("/t") && session.is_dir(p).unwrap())
            .count();
        assert_eq!(listed, dirs_on_host);
    }

    #[test]
    fn test_relative_and_depth() {
        let (session, _host) = tree();
        let deepest = walk(&session, "/t", WalkOptions::default())
            .map(|e| e.unwrap())
            .find(|e| e.root == "/t/a/b")
            .unwrap();
        assert_eq!(deepest.relative, "a/b");
        assert_eq!(deepest.depth, 2);
        assert_eq!(deepest.files, vec!["c.txt"]);
    }

    #[test]
    fn test_retain_subdirs_prunes_descent() {
        let (session, _host) = tree();
        let mut w = walk(&session, "/t", WalkOptions::default());
        let first = w.next().unwrap().unwrap();
        assert_eq!(first.dirs, vec!["a", "e"]);
        w.retain_subdirs(|d| d == "e");
        let rest: Vec<_> = w.map(|e| e.unwrap().root).collect();
        assert_eq!(rest, vec!["/t/e"]);
    }

    #[test]
    fn test_symlinks() {
        let (session, host) = tree();
        host.symlink("/t/a", "/t/link");
        host.symlink("/gone", "/t/broken");

        let first = walk(&session, "/t", WalkOptions::default())
            .next()
            .unwrap()
            .unwrap();
        assert!(first.files.contains(&"link".to_string()));

        let options = WalkOptions {
            follow_symlinks: true,
            ..Default::default()
        };
        let entries: Vec<_> = walk(&session, "/t", options).map(|e| e.unwrap()).collect();
        assert!(entries[0].dirs.contains(&"link".to_string()));
        assert!(entries[0].files.contains(&"broken".to_string()));
        assert!(entries.iter().any(|e| e.root == "/t/link/b"));
    }

    #[test]
    fn test_missing_root_yields_error_once() {
        let (session, _host) = tree();
        let mut w = walk(&session, "/nope", WalkOptions::default());
        assert!(matches!(w.next(), Some(Err(FsError::NotFound(_)))));
        assert!(w.next().is_none());
    }
}
