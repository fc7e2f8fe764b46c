//! Local machine backend

use std::fs::{self, Metadata};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::path_utils::{join_local_path, local_to_string};
use super::{CompletedProcess, FileEntry, FileKind, FileSystem, FileTransfer, ProcessRunner, RunOptions};
use crate::error::FsError;

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn entry_from_metadata(path: &str, meta: &Metadata) -> FileEntry {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::MetadataExt;
        meta.mode()
    };
    #[cfg(not(unix))]
    let mode = {
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::File
        };
        let perms = if meta.permissions().readonly() { 0o444 } else { 0o666 };
        kind.mode_bits() | perms
    };

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    FileEntry {
        path: path.to_string(),
        name,
        kind: FileKind::from_mode(mode),
        size: meta.len(),
        mode,
        mtime,
    }
}

fn copy_with_progress(
    mut reader: impl Read,
    mut writer: impl Write,
    progress: &mut dyn FnMut(u64),
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        progress(copied);
    }
    writer.flush()?;
    Ok(copied)
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &str) -> Result<FileEntry, FsError> {
        let meta = fs::metadata(path).map_err(|e| FsError::from_io(e, path))?;
        Ok(entry_from_metadata(path, &meta))
    }

    fn lstat(&self, path: &str) -> Result<FileEntry, FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path))?;
        Ok(entry_from_metadata(path, &meta))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        let mut entries = Vec::new();
        for item in fs::read_dir(path).map_err(|e| FsError::from_io(e, path))? {
            let item = item.map_err(|e| FsError::from_io(e, path))?;
            let child = local_to_string(&item.path());
            let meta = fs::symlink_metadata(&child).map_err(|e| FsError::from_io(e, &child))?;
            entries.push(entry_from_metadata(&child, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path).map_err(|e| FsError::from_io(e, path))
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        fs::remove_dir(path).map_err(|e| FsError::from_io(e, path))
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        fs::remove_file(path).map_err(|e| FsError::from_io(e, path))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<(), FsError> {
        fs::rename(src, dst).map_err(|e| FsError::from_io(e, src))
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| FsError::from_io(e, path))
        }
        #[cfg(not(unix))]
        {
            let mut perms = fs::metadata(path)
                .map_err(|e| FsError::from_io(e, path))?
                .permissions();
            perms.set_readonly(mode & 0o222 == 0);
            fs::set_permissions(path, perms).map_err(|e| FsError::from_io(e, path))
        }
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link).map_err(|e| FsError::from_io(e, link))
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(FsError::Unsupported(format!("symlink {}", link)))
        }
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        let target = fs::read_link(path).map_err(|e| FsError::from_io(e, path))?;
        Ok(local_to_string(&target))
    }

    fn realpath(&self, path: &str) -> Result<String, FsError> {
        let resolved = fs::canonicalize(path).map_err(|e| FsError::from_io(e, path))?;
        Ok(local_to_string(&resolved))
    }

    fn home(&self) -> Result<String, FsError> {
        dirs::home_dir()
            .map(|p| local_to_string(&p))
            .ok_or_else(|| FsError::NotFound("home directory".to_string()))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        fs::read(path).map_err(|e| FsError::from_io(e, path))
    }

    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| FsError::from_io(e, path))?;
        file.write_all(data).map_err(|e| FsError::from_io(e, path))
    }

    fn join(&self, base: &str, name: &str) -> String {
        join_local_path(base, name)
    }

    fn parent(&self, path: &str) -> String {
        match Path::new(path).parent() {
            Some(p) if !p.as_os_str().is_empty() => local_to_string(p),
            Some(_) => ".".to_string(),
            None => path.to_string(),
        }
    }
}

/// Local copies, used when both ends of a transfer are the local machine
impl FileTransfer for LocalFs {
    fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let src = fs::File::open(remote).map_err(|e| FsError::from_io(e, remote))?;
        let local_str = local_to_string(local);
        let dst = fs::File::create(local).map_err(|e| FsError::from_io(e, &local_str))?;
        copy_with_progress(src, dst, progress).map_err(|e| FsError::from_io(e, remote))
    }

    fn put(
        &self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let local_str = local_to_string(local);
        let src = fs::File::open(local).map_err(|e| FsError::from_io(e, &local_str))?;
        let dst = fs::File::create(remote).map_err(|e| FsError::from_io(e, remote))?;
        copy_with_progress(src, dst, progress).map_err(|e| FsError::from_io(e, remote))
    }
}

impl ProcessRunner for LocalFs {
    fn execute(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        debug!("Executing local command: {}", command);

        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(PathBuf::from(cwd));
        }
        cmd.envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let output = runtime.block_on(async {
            let mut child = cmd.spawn()?;
            let stdin = child.stdin.take();

            // stdin is fed while output is drained so neither pipe fills up
            let feed = async move {
                if let (Some(input), Some(mut stdin)) = (options.input.as_ref(), stdin) {
                    match stdin.write_all(input).await {
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                        other => other?,
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            let run = async {
                let (fed, output) = tokio::join!(feed, child.wait_with_output());
                fed?;
                output
            };

            match options.timeout_secs {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                    Ok(output) => output.map(Some),
                    Err(_) => Ok(None),
                },
                None => run.await.map(Some),
            }
        })
        .map_err(|e| FsError::from_io(e, command))?;
        let output = output.ok_or_else(|| FsError::Timeout {
            command: command.to_string(),
            secs: options.timeout_secs.unwrap_or_default(),
        })?;

        Ok(CompletedProcess {
            args: vec![command.to_string()],
            returncode: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().to_string()
    }

    #[test]
    fn test_stat_and_list_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let entries = fs.list_dir(&local_to_string(dir.path())).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt"]);
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].size, 5);
        assert!(entries[1].is_file());
    }

    #[test]
    fn test_remove_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();

        assert!(matches!(
            fs.remove(&tmp_path(&dir, "missing")),
            Err(FsError::NotFound(_))
        ));

        let sub = tmp_path(&dir, "sub");
        fs.mkdir(&sub, 0o755).unwrap();
        assert!(matches!(fs.remove(&sub), Err(FsError::IsADirectory(_))));

        fs.write_file(&fs.join(&sub, "f"), b"x", false).unwrap();
        assert!(matches!(fs.rmdir(&sub), Err(FsError::DirectoryNotEmpty(_))));
    }

    #[test]
    fn test_makedirs() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();
        let deep = tmp_path(&dir, "x/y/z");

        fs.makedirs(&deep, 0o755, false).unwrap();
        assert!(fs.is_dir(&deep).unwrap());
        assert!(fs.makedirs(&deep, 0o755, true).is_ok());
        assert!(matches!(
            fs.makedirs(&deep, 0o755, false),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_copy_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();
        let src = tmp_path(&dir, "src.bin");
        std::fs::write(&src, vec![7u8; COPY_CHUNK_SIZE + 10]).unwrap();

        let mut seen = Vec::new();
        let copied = fs
            .get(&src, &dir.path().join("dst.bin"), &mut |n| seen.push(n))
            .unwrap();
        assert_eq!(copied, (COPY_CHUNK_SIZE + 10) as u64);
        assert_eq!(seen, vec![COPY_CHUNK_SIZE as u64, copied]);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_cwd_and_input() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();

        let options = RunOptions::new()
            .cwd(local_to_string(dir.path()))
            .input("piped")
            .env("GREETING", "hi");
        let completed = fs.run_shell("cat; echo \" $GREETING\"; pwd", &options).unwrap();
        assert!(completed.success());
        let out = completed.stdout_text();
        assert!(out.starts_with("piped hi\n"));

        let failed = fs.run(&["sh", "-c", "exit 3"], &RunOptions::new().check(true));
        assert!(matches!(
            failed,
            Err(FsError::CommandFailed { status: 3, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_echoes_input_larger_than_pipe_buffer() {
        let fs = LocalFs::new();
        let input = vec![b'x'; 1 << 20];
        let completed = fs
            .run_shell("cat", &RunOptions::new().input(input.clone()).timeout_secs(30))
            .unwrap();
        assert!(completed.success());
        assert_eq!(completed.stdout, input);
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_covers_input_feed() {
        let fs = LocalFs::new();
        let result = fs.run_shell(
            "sleep 5",
            &RunOptions::new().input(vec![b'x'; 1 << 20]).timeout_secs(1),
        );
        assert!(matches!(result, Err(FsError::Timeout { secs: 1, .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_timeout() {
        let fs = LocalFs::new();
        let result = fs.run_shell("sleep 5", &RunOptions::new().timeout_secs(1));
        assert!(matches!(result, Err(FsError::Timeout { secs: 1, .. })));
    }
}
