//! Guarded SSH connection

use std::path::Path;

use tracing::info;

use super::{Connection, ConnectionOptions};
use crate::config::ConnectionDescriptor;
use crate::error::{ErrorKind, FsError};
use crate::fs::{
    open, CompletedProcess, EncodingErrors, FileEntry, FileKind, FileObject, FileSystem,
    FileTransfer, LocalFs, ProcessRunner, RunOptions,
};
use crate::retry::{RetryGuard, RetryPolicy, RetrySnapshot};
use crate::session::{Session, SessionOptions, Transport};
use crate::ssh::{SshConfig, SshTransport};
use crate::transfer::{Direction, TransferOptions, TransferPlan, TransferProgress, TreeTransferEngine};
use crate::tree::remove_tree;

/// A failed copy must not be repeated behind the caller's back
const TREE_EXCLUDED: &[ErrorKind] = &[ErrorKind::NotFound, ErrorKind::Io];
const OPEN_EXCLUDED: &[ErrorKind] = &[ErrorKind::NotFound];
const RUN_EXCLUDED: &[ErrorKind] = &[ErrorKind::CommandFailed, ErrorKind::InvalidArgument];
const MKDIR_EXCLUDED: &[ErrorKind] = &[ErrorKind::AlreadyExists, ErrorKind::NotFound, ErrorKind::Io];
const CHECK_EXCLUDED: &[ErrorKind] = &[ErrorKind::Io];

/// Remote host reached through a [`Transport`].
///
/// Every call goes through the retry guard: a dropped transport or channel is
/// renegotiated and the call runs again from the top.
pub struct SshConnection<T: Transport> {
    server_name: String,
    session: Session<T>,
    guard: RetryGuard,
    policy: RetryPolicy,
    local: LocalFs,
    descriptor: ConnectionDescriptor,
}

impl<T: Transport> SshConnection<T> {
    /// Wrap a transport. Connecting is deferred to the first call.
    pub fn new(
        server_name: &str,
        transport: T,
        options: ConnectionOptions,
        descriptor: ConnectionDescriptor,
    ) -> Self {
        let session_options = SessionOptions {
            thread_safe: options.thread_safe,
            auth_attempts: options.retry.auth_attempts,
        };
        Self {
            server_name: server_name.to_lowercase(),
            session: Session::new(transport, session_options),
            guard: RetryGuard::new(),
            policy: options.retry,
            local: LocalFs,
            descriptor,
        }
    }

    /// Replace the retry guard, e.g. to observe or shorten backoff waits
    pub fn with_guard(mut self, guard: RetryGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Connect now instead of on first use. Fails fast.
    pub fn connect(&self) -> Result<(), FsError> {
        self.session.connect()
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn retry_stats(&self) -> RetrySnapshot {
        self.guard.stats()
    }

    fn guarded<R>(
        &self,
        op: &str,
        excluded: &[ErrorKind],
        mut f: impl FnMut(&Session<T>) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        let policy = self.policy.clone().excluding(excluded);
        self.guard.run(&self.session, &policy, op, || f(&self.session))
    }

    fn tree_transfer(
        &self,
        source: &str,
        dest: &str,
        direction: Direction,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        let op = match direction {
            Direction::Get => "download_tree",
            Direction::Put => "upload_tree",
        };
        self.guarded(op, TREE_EXCLUDED, |session| {
            TreeTransferEngine::new(&self.local, session, session)
                .transfer(source, dest, direction, options, &mut *progress)
        })
    }
}

impl SshConnection<SshTransport> {
    /// Open and connect an SSH connection
    pub fn open(server_name: &str, config: SshConfig, options: ConnectionOptions) -> Result<Self, FsError> {
        info!("Connecting to {} ({}@{})", server_name, config.username, config.address());
        let descriptor = ConnectionDescriptor::ssh(server_name, &config, options.thread_safe);
        let connection = Self::new(server_name, SshTransport::new(config)?, options, descriptor);
        connection.connect()?;
        Ok(connection)
    }
}

impl<T: Transport> FileSystem for SshConnection<T> {
    fn stat(&self, path: &str) -> Result<FileEntry, FsError> {
        self.guarded("stat", &[], |s| s.stat(path))
    }

    fn lstat(&self, path: &str) -> Result<FileEntry, FsError> {
        self.guarded("lstat", &[], |s| s.lstat(path))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        self.guarded("list_dir", &[], |s| s.list_dir(path))
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.guarded("mkdir", MKDIR_EXCLUDED, |s| s.mkdir(path, mode))
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.guarded("rmdir", &[], |s| s.rmdir(path))
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        self.guarded("remove", &[], |s| s.remove(path))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.guarded("rename", &[], |s| s.rename(src, dst))
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.guarded("chmod", &[], |s| s.chmod(path, mode))
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        self.guarded("symlink", &[], |s| s.symlink(target, link))
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.guarded("readlink", &[], |s| s.readlink(path))
    }

    fn realpath(&self, path: &str) -> Result<String, FsError> {
        self.guarded("realpath", &[], |s| s.realpath(path))
    }

    fn home(&self) -> Result<String, FsError> {
        self.guarded("home", &[], |s| s.home())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.guarded("read_file", &[], |s| s.read_file(path))
    }

    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        self.guarded("write_file", &[], |s| s.write_file(path, data, append))
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.guarded("exists", CHECK_EXCLUDED, |s| s.exists(path))
    }

    fn kind_of(&self, path: &str, follow_symlinks: bool) -> Result<Option<FileKind>, FsError> {
        self.guarded("kind_of", CHECK_EXCLUDED, |s| s.kind_of(path, follow_symlinks))
    }

    fn makedirs(&self, path: &str, mode: u32, exist_ok: bool) -> Result<(), FsError> {
        self.guarded("makedirs", MKDIR_EXCLUDED, |s| s.makedirs(path, mode, exist_ok))
    }
}

impl<T: Transport> FileTransfer for SshConnection<T> {
    fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        self.guarded("get", &[], |s| s.get(remote, local, &mut *progress))
    }

    fn put(
        &self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        self.guarded("put", &[], |s| s.put(local, remote, &mut *progress))
    }
}

impl<T: Transport> ProcessRunner for SshConnection<T> {
    fn execute(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        self.guarded("run", RUN_EXCLUDED, |s| {
            let completed = s.execute(command, options)?;
            if options.check {
                completed.check_returncode()?;
            }
            Ok(completed)
        })
    }
}

impl<T: Transport> Connection for SshConnection<T> {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn is_local(&self) -> bool {
        false
    }

    fn filesystem(&self) -> &dyn FileSystem {
        self
    }

    fn transfer(&self) -> &dyn FileTransfer {
        self
    }

    fn runner(&self) -> &dyn ProcessRunner {
        self
    }

    fn download_tree(
        &self,
        remote: &str,
        local: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        self.tree_transfer(remote, local, Direction::Get, options, progress)
    }

    fn upload_tree(
        &self,
        local: &str,
        remote: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        self.tree_transfer(local, remote, Direction::Put, options, progress)
    }

    fn rmtree(&self, path: &str) -> Result<(), FsError> {
        self.guarded("rmtree", TREE_EXCLUDED, |s| remove_tree(s, path))
    }

    fn open(
        &self,
        path: &str,
        mode: &str,
        encoding: Option<&str>,
        errors: EncodingErrors,
    ) -> Result<FileObject<'_>, FsError> {
        let policy = self.policy.clone().excluding(OPEN_EXCLUDED);
        self.guard
            .run(&self.session, &policy, "open", || open(self, path, mode, encoding, errors))
    }

    fn close(&self) {
        info!("Closing ssh connection to {}", self.server_name);
        self.session.close();
    }

    fn to_descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionKind;
    use crate::session::{MemoryHost, MemoryTransport, SessionState};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            kind: ConnectionKind::Ssh,
            server_name: "mem".into(),
            address: Some("mem.invalid".into()),
            user_name: "user".into(),
            ssh_key: None,
            port: 22,
            thread_safe: false,
            allow_agent: true,
        }
    }

    fn connection(host: &MemoryHost) -> (SshConnection<MemoryTransport>, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorded = sleeps.clone();
        let guard = RetryGuard::with_sleeper(move |d| recorded.lock().push(d));
        let options = ConnectionOptions::default()
            .retry(RetryPolicy::new().with_backoff(Duration::from_secs(5)));
        let connection = SshConnection::new("MEM", MemoryTransport::new(host.clone()), options, descriptor())
            .with_guard(guard);
        (connection, sleeps)
    }

    #[test]
    fn test_connects_lazily() {
        let host = MemoryHost::new("mem");
        host.write("/data/a.txt", b"abc");
        let (conn, _) = connection(&host);
        assert_eq!(conn.session().state(), SessionState::Disconnected);
        assert_eq!(conn.server_name(), "mem");

        assert_eq!(conn.read_file("/data/a.txt").unwrap(), b"abc");
        assert_eq!(host.connects(), 1);
        assert_eq!(conn.retry_stats(), RetrySnapshot::default());
    }

    #[test]
    fn test_fresh_connection_reports_missing_file_without_repair() {
        let host = MemoryHost::new("mem");
        let (conn, sleeps) = connection(&host);

        let err = conn.path("/missing.txt").unlink(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(conn.retry_stats(), RetrySnapshot::default());
        assert!(sleeps.lock().is_empty());
    }

    #[test]
    fn test_get_of_missing_file_leaves_no_local_file() {
        let host = MemoryHost::new("mem");
        let (conn, _) = connection(&host);
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("out.bin");

        let err = conn.get("/nope.bin", &local, &mut |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!local.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_local_disk_failure_is_not_retried() {
        let host = MemoryHost::new("mem");
        host.write("/f", b"payload");
        let (conn, sleeps) = connection(&host);
        conn.connect().unwrap();

        let err = conn
            .get("/f", Path::new("/dev/full"), &mut |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
        assert_eq!(conn.retry_stats(), RetrySnapshot::default());
        assert_eq!(host.connects(), 1);
        assert!(sleeps.lock().is_empty());
    }

    #[test]
    fn test_retries_through_dropped_connection() {
        let host = MemoryHost::new("mem");
        host.write("/data/a.txt", b"abc");
        let (conn, sleeps) = connection(&host);
        conn.connect().unwrap();
        conn.stat("/data/a.txt").unwrap();

        host.kill_connection();
        host.refuse_connections(2);
        assert_eq!(conn.stat("/data/a.txt").unwrap().size, 3);

        let stats = conn.retry_stats();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.repairs, 1);
        assert_eq!(stats.backoff_waits, 2);
        assert_eq!(*sleeps.lock(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_domain_errors_are_not_retried() {
        let host = MemoryHost::new("mem");
        let (conn, sleeps) = connection(&host);
        conn.connect().unwrap();

        let err = conn.path("/missing.txt").unlink(false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(conn.path("/missing.txt").unlink(true).is_ok());
        assert_eq!(conn.retry_stats().repairs, 0);
        assert!(sleeps.lock().is_empty());
    }

    #[test]
    fn test_failed_tree_copy_is_not_repeated() {
        let host = MemoryHost::new("mem");
        host.write("/data/1.txt", b"a");
        host.write("/data/2.txt", b"b");
        let (conn, _) = connection(&host);
        conn.connect().unwrap();
        host.inject_faults_after("get", ErrorKind::Io, 1, 1);

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().to_string_lossy().to_string();
        let options = TransferOptions::new().remove_after(true);
        let err = conn
            .download_tree("/data", &dest, &options, &mut |_| {})
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(conn.retry_stats().repairs, 0);
        assert!(host.exists("/data/1.txt"));
        assert!(host.exists("/data/2.txt"));
    }

    #[test]
    fn test_tree_transfer_restarts_after_lost_channel() {
        let host = MemoryHost::new("mem");
        host.write("/data/x/1.txt", b"one");
        host.write("/data/2.txt", b"two");
        let (conn, _) = connection(&host);
        conn.connect().unwrap();
        host.inject_faults_after("get", ErrorKind::ChannelClosed, 1, 1);

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().to_string_lossy().to_string();
        let plan = conn
            .download_tree("/data", &dest, &TransferOptions::new(), &mut |_| {})
            .unwrap();

        assert_eq!(plan.total_bytes, 6);
        assert_eq!(conn.retry_stats().repairs, 1);
        assert_eq!(std::fs::read(tmp.path().join("x").join("1.txt")).unwrap(), b"one");
        assert_eq!(std::fs::read(tmp.path().join("2.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_run_check_failure_is_not_retried() {
        let host = MemoryHost::new("mem");
        host.on_exec(|command, _| {
            Ok(CompletedProcess {
                args: vec![command.to_string()],
                returncode: if command.starts_with("false") { 1 } else { 0 },
                stdout: b"ok\n".to_vec(),
                stderr: Vec::new(),
            })
        });
        let (conn, _) = connection(&host);
        conn.connect().unwrap();

        let done = conn.run(&["echo", "hi there"], &RunOptions::new()).unwrap();
        assert_eq!(done.stdout_text(), "ok\n");
        assert_eq!(host.exec_log(), vec!["echo 'hi there'".to_string()]);

        let err = conn.run(&["false"], &RunOptions::new().check(true)).unwrap_err();
        assert!(matches!(err, FsError::CommandFailed { status: 1, .. }));
        assert_eq!(host.exec_log().len(), 2);
    }

    #[test]
    fn test_open_and_rmtree() {
        let host = MemoryHost::new("mem");
        host.write("/r/a/b.txt", b"hello");
        let (conn, _) = connection(&host);

        let text = conn
            .open("/r/a/b.txt", "r", None, EncodingErrors::Strict)
            .unwrap()
            .read_text()
            .unwrap();
        assert_eq!(text, "hello");
        assert!(matches!(
            conn.open("/r/none.txt", "r", None, EncodingErrors::Strict),
            Err(FsError::NotFound(_))
        ));

        conn.rmtree("/r").unwrap();
        assert!(!host.exists("/r"));
        assert!(matches!(conn.rmtree("/r"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_descriptor_and_close() {
        let host = MemoryHost::new("mem");
        let (conn, _) = connection(&host);
        conn.connect().unwrap();
        assert_eq!(conn.to_descriptor(), descriptor());
        conn.close();
        assert!(!host.is_connected());
        assert!(!conn.is_local());
    }
}
