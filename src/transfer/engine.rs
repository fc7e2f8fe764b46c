//! Whole-directory copies between the local machine and a remote filesystem

use std::path::Path;

use tracing::{debug, error, info};

use super::types::{Direction, PlannedFile, TransferOptions, TransferPlan, TransferProgress};
use crate::error::FsError;
use crate::fs::{FileKind, FileSystem, FileTransfer, DEFAULT_DIR_MODE};
use crate::tree::{remove_tree, walk, FileFilter, WalkOptions};

/// Copies directory trees in three phases: enumerate, create directories, copy.
///
/// `local` and `remote` are the two ends; `channel` moves file contents
/// between them. Nothing is removed unless every planned file was copied.
pub struct TreeTransferEngine<'a> {
    local: &'a dyn FileSystem,
    remote: &'a dyn FileSystem,
    channel: &'a dyn FileTransfer,
}

impl<'a> TreeTransferEngine<'a> {
    pub fn new(
        local: &'a dyn FileSystem,
        remote: &'a dyn FileSystem,
        channel: &'a dyn FileTransfer,
    ) -> Self {
        Self {
            local,
            remote,
            channel,
        }
    }

    /// (source side, destination side)
    fn ends(&self, direction: Direction) -> (&'a dyn FileSystem, &'a dyn FileSystem) {
        match direction {
            Direction::Get => (self.remote, self.local),
            Direction::Put => (self.local, self.remote),
        }
    }

    /// Enumerate the source tree without touching the destination
    pub fn plan(
        &self,
        source: &str,
        dest: &str,
        direction: Direction,
        options: &TransferOptions,
    ) -> Result<TransferPlan, FsError> {
        let (src_fs, dst_fs) = self.ends(direction);

        if !src_fs.is_dir(source)? {
            return Err(FsError::NotFound(format!(
                "{} you are trying to copy from does not exist",
                source
            )));
        }

        let include: Vec<&str> = options.include.iter().map(String::as_str).collect();
        let exclude: Vec<&str> = options.exclude.iter().map(String::as_str).collect();
        let filter = FileFilter::all().include(&include)?.exclude(&exclude)?;

        let walk_options = WalkOptions {
            top_down: true,
            follow_symlinks: options.follow_symlinks,
        };

        let mut plan = TransferPlan::default();
        for entry in walk(src_fs, source, walk_options) {
            let entry = entry?;
            debug!("Searching {} directory {}", direction_side(direction), entry.root);

            let dst_dir = dest_path(dst_fs, dest, &entry.relative);
            for name in &entry.files {
                if !filter.matches(name) {
                    continue;
                }
                let src = src_fs.join(&entry.root, name);
                let stat = match src_fs.stat(&src) {
                    Ok(stat) => stat,
                    Err(FsError::NotFound(_)) => {
                        debug!("Skipping dangling link {}", src);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if stat.kind != FileKind::File {
                    debug!("Skipping {} ({:?})", src, stat.kind);
                    continue;
                }
                plan.push(PlannedFile {
                    dst: dst_fs.join(&dst_dir, name),
                    src,
                    size: stat.size,
                });
            }
            plan.dirs.insert(dst_dir);
        }

        info!(
            "Planned {} of {} files ({} bytes)",
            direction,
            plan.file_count(),
            plan.total_bytes
        );
        Ok(plan)
    }

    /// Copy the tree at `source` to `dest`.
    ///
    /// `progress` is called per chunk and after each file. The first failed
    /// copy aborts the transfer and the source is left untouched.
    pub fn transfer(
        &self,
        source: &str,
        dest: &str,
        direction: Direction,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        let plan = self.plan(source, dest, direction, options)?;
        let (src_fs, dst_fs) = self.ends(direction);

        for dir in &plan.dirs {
            dst_fs.makedirs(dir, DEFAULT_DIR_MODE, true)?;
        }

        let mut report = TransferProgress {
            direction,
            transferred_bytes: 0,
            total_bytes: plan.total_bytes,
            current_file: String::new(),
            files_done: 0,
            files_total: plan.file_count(),
        };

        for file in &plan.files {
            let done = report.transferred_bytes;
            report.current_file = file.src.clone();

            let copied = {
                let mut on_chunk = |bytes: u64| {
                    report.transferred_bytes = done + bytes;
                    progress(&report);
                };
                self.copy_file(&file.src, &file.dst, direction, &mut on_chunk)
            };
            let copied = match copied {
                Ok(copied) => copied,
                Err(e) => {
                    error!("Copying {} to {} failed: {}", file.src, file.dst, e);
                    return Err(e);
                }
            };

            report.transferred_bytes = done + copied;
            report.files_done += 1;
            progress(&report);
        }

        if options.remove_after {
            info!("Removing source tree {}", source);
            remove_tree(src_fs, source)?;
        }
        Ok(plan)
    }

    /// Copy a single file through the channel
    pub fn copy_file(
        &self,
        src: &str,
        dst: &str,
        direction: Direction,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        debug!("Copying ({}) {} --> {}", direction, src, dst);
        match direction {
            Direction::Get => self.channel.get(src, Path::new(dst), progress),
            Direction::Put => self.channel.put(Path::new(src), dst, progress),
        }
    }
}

fn direction_side(direction: Direction) -> &'static str {
    match direction {
        Direction::Get => "remote",
        Direction::Put => "local",
    }
}

fn dest_path(fs: &dyn FileSystem, dest: &str, relative: &str) -> String {
    relative
        .split('/')
        .filter(|c| !c.is_empty())
        .fold(dest.to_string(), |dir, part| fs.join(&dir, part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fs::LocalFs;
    use crate::session::{MemoryHost, MemoryTransport, Session, SessionOptions};
    use std::collections::BTreeSet;

    fn remote_tree() -> (Session<MemoryTransport>, MemoryHost) {
        let host = MemoryHost::new("mem-transfer");
        host.write("/data/a/b/c.txt", b"0123456789");
        host.write("/data/a/d.txt", b"01234");
        host.write("/data/a/e.log", b"skip me");
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());
        session.connect().unwrap();
        (session, host)
    }

    fn relative_files(root: &Path) -> BTreeSet<String> {
        let local = LocalFs;
        let root_str = root.to_string_lossy().to_string();
        walk(&local, &root_str, WalkOptions::default())
            .flat_map(|e| {
                let e = e.unwrap();
                e.files
                    .iter()
                    .map(|f| e.relative_child(f))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_download_with_include() {
        let (session, _host) = remote_tree();
        let local = LocalFs;
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("out");
        let dest_str = dest.to_string_lossy().to_string();

        let engine = TreeTransferEngine::new(&local, &session, &session);
        let options = TransferOptions::new().include("*.txt");
        let mut reports = Vec::new();
        let plan = engine
            .transfer("/data", &dest_str, Direction::Get, &options, &mut |p| {
                reports.push(p.clone())
            })
            .unwrap();

        assert_eq!(plan.file_count(), 2);
        assert_eq!(plan.total_bytes, 15);
        assert_eq!(
            std::fs::read(dest.join("a").join("b").join("c.txt")).unwrap(),
            b"0123456789"
        );
        assert_eq!(std::fs::read(dest.join("a").join("d.txt")).unwrap(), b"01234");
        assert!(!dest.join("a").join("e.log").exists());

        let last = reports.last().unwrap();
        assert_eq!(last.transferred_bytes, 15);
        assert!(last.is_complete());
        assert!(reports
            .windows(2)
            .all(|w| w[0].transferred_bytes <= w[1].transferred_bytes));
    }

    #[test]
    fn test_destination_mirrors_filtered_source() {
        let (session, host) = remote_tree();
        host.mkdir_all("/data/empty/deeper");
        let local = LocalFs;
        let tmp = tempfile::tempdir().unwrap();
        let dest_str = tmp.path().to_string_lossy().to_string();

        let engine = TreeTransferEngine::new(&local, &session, &session);
        let options = TransferOptions::new().exclude("*.log");
        let plan = engine
            .transfer("/data", &dest_str, Direction::Get, &options, &mut |_| {})
            .unwrap();

        let expected: BTreeSet<String> = ["a/b/c.txt", "a/d.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(relative_files(tmp.path()), expected);
        assert_eq!(
            plan.total_bytes,
            plan.files.iter().map(|f| f.size).sum::<u64>()
        );
        assert!(tmp.path().join("empty").join("deeper").is_dir());
    }

    #[test]
    fn test_upload_and_remove_source() {
        let (session, host) = remote_tree();
        let local = LocalFs;
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("up");
        std::fs::create_dir_all(src.join("x")).unwrap();
        std::fs::write(src.join("x").join("one.bin"), b"1").unwrap();
        std::fs::write(src.join("two.bin"), b"22").unwrap();
        let src_str = src.to_string_lossy().to_string();

        let engine = TreeTransferEngine::new(&local, &session, &session);
        let options = TransferOptions::new().remove_after(true);
        let plan = engine
            .transfer(&src_str, "/incoming", Direction::Put, &options, &mut |_| {})
            .unwrap();

        assert_eq!(plan.total_bytes, 3);
        assert_eq!(host.read("/incoming/x/one.bin").unwrap(), b"1");
        assert_eq!(host.read("/incoming/two.bin").unwrap(), b"22");
        assert!(!src.exists());
    }

    #[test]
    fn test_failed_copy_keeps_source() {
        let host = MemoryHost::new("mem-transfer");
        host.write("/data/1.txt", b"a");
        host.write("/data/2.txt", b"b");
        host.write("/data/3.txt", b"c");
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());
        session.connect().unwrap();
        host.inject_faults_after("get", ErrorKind::Io, 1, 1);

        let local = LocalFs;
        let tmp = tempfile::tempdir().unwrap();
        let dest_str = tmp.path().to_string_lossy().to_string();
        let engine = TreeTransferEngine::new(&local, &session, &session);
        let options = TransferOptions::new().remove_after(true);

        let err = engine
            .transfer("/data", &dest_str, Direction::Get, &options, &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        for f in ["/data/1.txt", "/data/2.txt", "/data/3.txt"] {
            assert!(host.exists(f), "{} was removed", f);
        }
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let (session, _host) = remote_tree();
        let local = LocalFs;
        let engine = TreeTransferEngine::new(&local, &session, &session);
        let err = engine
            .plan("/nope", "/tmp/x", Direction::Get, &TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }
}
