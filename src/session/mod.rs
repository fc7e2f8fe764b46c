//! Session Management Module
//!
//! A [`Session`] owns one transport to one host and, lazily, one file channel.
//! Its primitives are raw: they fail fast and leave retrying to
//! [`crate::retry::RetryGuard`].

#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod state;
mod transport;

use std::path::Path;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FsError};
use crate::fs::{CompletedProcess, FileEntry, FileSystem, FileTransfer, ProcessRunner, RunOptions};
use crate::retry::Renegotiate;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryHost, MemoryTransport};
pub use state::SessionState;
pub use transport::{FileChannel, Transport};

/// Default number of authentication attempts made by [`Session::connect`]
pub const DEFAULT_AUTH_ATTEMPTS: u32 = 3;

/// Session construction options
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Serialize whole operations through a re-entrant lock
    pub thread_safe: bool,
    /// Authentication attempts before `connect` gives up
    pub auth_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            thread_safe: false,
            auth_attempts: DEFAULT_AUTH_ATTEMPTS,
        }
    }
}

struct SessionInner<T: Transport> {
    transport: T,
    channel: Option<T::Channel>,
    state: SessionState,
    /// A channel was opened since the last explicit close
    channel_wanted: bool,
    /// Connected at least once since construction or the last explicit close
    opened: bool,
}

impl<T: Transport> SessionInner<T> {
    fn drop_connection(&mut self) {
        self.channel = None;
        self.transport.disconnect();
        self.state = SessionState::Disconnected;
    }

    fn ensure_channel(&mut self) -> Result<(), FsError> {
        match self.state {
            SessionState::Ready if self.channel.is_some() => return Ok(()),
            SessionState::Connected | SessionState::Ready => {}
            state => {
                return Err(FsError::ConnectionLost(format!(
                    "{}: session is {}",
                    self.transport.host(),
                    state
                )))
            }
        }

        self.state = SessionState::ChannelOpening;
        match self.transport.open_channel() {
            Ok(channel) => {
                debug!("File channel opened to {}", self.transport.host());
                self.channel = Some(channel);
                self.channel_wanted = true;
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open file channel to {}: {}", self.transport.host(), e);
                self.drop_connection();
                Err(match e {
                    FsError::ChannelOpen(msg) => FsError::ChannelOpen(msg),
                    other => FsError::ChannelOpen(other.to_string()),
                })
            }
        }
    }
}

/// Transport plus lazily opened file channel for one host
pub struct Session<T: Transport> {
    inner: Mutex<SessionInner<T>>,
    op_lock: Option<ReentrantMutex<()>>,
    auth_attempts: u32,
    host: String,
}

impl<T: Transport> Session<T> {
    /// Wrap a transport. Nothing is connected yet.
    pub fn new(transport: T, options: SessionOptions) -> Self {
        let host = transport.host().to_string();
        Self {
            inner: Mutex::new(SessionInner {
                transport,
                channel: None,
                state: SessionState::Disconnected,
                channel_wanted: false,
                opened: false,
            }),
            op_lock: options.thread_safe.then(|| ReentrantMutex::new(())),
            auth_attempts: options.auth_attempts.max(1),
            host,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn is_thread_safe(&self) -> bool {
        self.op_lock.is_some()
    }

    /// Hold the operation lock (thread-safe mode only) for the guard's lifetime
    pub fn serialize(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.op_lock.as_ref().map(|lock| lock.lock())
    }

    /// Establish the transport, retrying rejected credentials up to the cap.
    ///
    /// Exhausting the cap is fatal and surfaces as [`FsError::ConnectionFailed`].
    pub fn connect(&self) -> Result<(), FsError> {
        let _serial = self.serialize();
        let mut inner = self.inner.lock();
        self.connect_locked(&mut inner)
    }

    fn connect_locked(&self, inner: &mut SessionInner<T>) -> Result<(), FsError> {
        if inner.state.is_connected() {
            return Ok(());
        }

        inner.state = SessionState::Connecting;
        let mut last_error = String::new();
        for attempt in 1..=self.auth_attempts {
            match inner.transport.authenticate() {
                Ok(()) => {
                    inner.state = SessionState::Connected;
                    inner.opened = true;
                    info!(host = %self.host, attempt, "Session connected");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Authentication => {
                    warn!(
                        host = %self.host,
                        attempt,
                        max = self.auth_attempts,
                        "Authentication failed: {}",
                        e
                    );
                    last_error = e.to_string();
                }
                Err(e) => {
                    inner.state = SessionState::Disconnected;
                    return Err(e);
                }
            }
        }

        inner.transport.disconnect();
        inner.state = SessionState::Disconnected;
        Err(FsError::ConnectionFailed(format!(
            "could not authenticate to {} after {} attempts: {}",
            self.host, self.auth_attempts, last_error
        )))
    }

    /// First use of a fresh or closed session connects in place. A session
    /// that lost its connection stays down until the guard renegotiates.
    fn connect_on_first_use(&self, inner: &mut SessionInner<T>) -> Result<(), FsError> {
        if inner.opened || inner.state.is_connected() {
            return Ok(());
        }
        debug!(host = %self.host, "Connecting on first use");
        self.connect_locked(inner)
    }

    /// Open the file channel once and cache it
    pub fn ensure_channel(&self) -> Result<(), FsError> {
        let _serial = self.serialize();
        self.inner.lock().ensure_channel()
    }

    /// Drop channel and transport. Safe to call repeatedly.
    pub fn close(&self) {
        let _serial = self.serialize();
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Disconnected || inner.channel.is_some() {
            info!(host = %self.host, "Closing session");
        }
        inner.drop_connection();
        inner.channel_wanted = false;
        inner.opened = false;
    }

    /// Run `f` against the transport, e.g. to inspect an emulated host
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock().transport)
    }

    fn with_channel<R>(
        &self,
        f: impl FnOnce(&mut T::Channel) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        let _serial = self.serialize();
        let mut inner = self.inner.lock();
        self.connect_on_first_use(&mut inner)?;
        inner.ensure_channel()?;

        let result = match inner.channel.as_mut() {
            Some(channel) => f(channel),
            None => Err(FsError::ChannelClosed(self.host.clone())),
        };

        if let Err(e) = &result {
            if e.is_transient() {
                debug!(host = %self.host, kind = %e.kind(), "Primitive failed, dropping connection");
                inner.drop_connection();
            }
        }
        result
    }

    fn exec(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        let _serial = self.serialize();
        let mut inner = self.inner.lock();
        self.connect_on_first_use(&mut inner)?;
        if !inner.state.is_connected() {
            return Err(FsError::ConnectionLost(format!(
                "{}: session is {}",
                self.host, inner.state
            )));
        }

        let result = inner.transport.exec(command, options);
        if let Err(e) = &result {
            if e.is_transient() {
                inner.drop_connection();
            }
        }
        result
    }
}

impl<T: Transport> Renegotiate for Session<T> {
    fn renegotiate(&self) -> Result<(), FsError> {
        let _serial = self.serialize();
        let reopen = {
            let mut inner = self.inner.lock();
            let reopen = inner.channel_wanted || inner.channel.is_some();
            inner.drop_connection();
            reopen
        };

        self.connect()?;
        if reopen {
            self.ensure_channel()?;
        }
        Ok(())
    }

    fn target(&self) -> &str {
        &self.host
    }

    fn lock_operation(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.serialize()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.inner.get_mut().drop_connection();
    }
}

impl<T: Transport> FileSystem for Session<T> {
    fn stat(&self, path: &str) -> Result<FileEntry, FsError> {
        self.with_channel(|c| c.stat(path))
    }

    fn lstat(&self, path: &str) -> Result<FileEntry, FsError> {
        self.with_channel(|c| c.lstat(path))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        self.with_channel(|c| c.list(path))
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.with_channel(|c| c.mkdir(path, mode))
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.with_channel(|c| c.rmdir(path))
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        self.with_channel(|c| c.remove(path))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.with_channel(|c| c.rename(src, dst))
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.with_channel(|c| c.chmod(path, mode))
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        self.with_channel(|c| c.symlink(target, link))
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.with_channel(|c| c.readlink(path))
    }

    fn realpath(&self, path: &str) -> Result<String, FsError> {
        self.with_channel(|c| c.realpath(path))
    }

    fn home(&self) -> Result<String, FsError> {
        self.with_channel(|c| c.realpath("."))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.with_channel(|c| c.read_file(path))
    }

    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        self.with_channel(|c| c.write_file(path, data, append))
    }
}

impl<T: Transport> FileTransfer for Session<T> {
    fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        self.with_channel(|c| c.get(remote, local, progress))
    }

    fn put(
        &self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        self.with_channel(|c| c.put(local, remote, progress))
    }
}

impl<T: Transport> ProcessRunner for Session<T> {
    fn execute(&self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        Session::exec(self, command, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(options: SessionOptions) -> (Session<MemoryTransport>, MemoryHost) {
        let host = MemoryHost::new("mem-1");
        let session = Session::new(MemoryTransport::new(host.clone()), options);
        session.connect().unwrap();
        (session, host)
    }

    #[test]
    fn test_state_machine() {
        let host = MemoryHost::new("mem-1");
        let session = Session::new(MemoryTransport::new(host), SessionOptions::default());
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.ensure_channel().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_ready());

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_channel_opened_lazily() {
        let (session, host) = connected(SessionOptions::default());
        assert_eq!(host.channels_opened(), 0);

        host.write("/data/a.txt", b"abc");
        assert_eq!(session.stat("/data/a.txt").unwrap().size, 3);
        session.stat("/data/a.txt").unwrap();
        assert_eq!(host.channels_opened(), 1);
    }

    #[test]
    fn test_first_use_connects_but_lost_connection_waits_for_repair() {
        let host = MemoryHost::new("mem-1");
        host.write("/f", b"1");
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());

        assert_eq!(session.stat("/f").unwrap().size, 1);
        assert_eq!(host.connects(), 1);

        host.inject_faults("stat", ErrorKind::ConnectionLost, 1);
        assert!(session.stat("/f").is_err());
        assert!(matches!(session.stat("/f"), Err(FsError::ConnectionLost(_))));
        assert_eq!(host.connects(), 1);

        session.close();
        assert_eq!(session.stat("/f").unwrap().size, 1);
        assert_eq!(host.connects(), 2);
    }

    #[test]
    fn test_auth_cap_is_fatal() {
        let host = MemoryHost::new("mem-1");
        host.reject_logins(5);
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());

        match session.connect() {
            Err(FsError::ConnectionFailed(msg)) => assert!(msg.contains("3 attempts")),
            other => panic!("Expected ConnectionFailed, got {:?}", other),
        }
        assert_eq!(host.login_attempts(), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_auth_retried_within_cap() {
        let host = MemoryHost::new("mem-1");
        host.reject_logins(2);
        let session = Session::new(MemoryTransport::new(host.clone()), SessionOptions::default());
        session.connect().unwrap();
        assert_eq!(host.login_attempts(), 3);
    }

    #[test]
    fn test_transient_failure_drops_to_disconnected() {
        let (session, host) = connected(SessionOptions::default());
        host.write("/f", b"1");
        session.stat("/f").unwrap();

        host.inject_faults("stat", ErrorKind::ConnectionLost, 1);
        assert!(matches!(session.stat("/f"), Err(FsError::ConnectionLost(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_domain_failure_keeps_channel() {
        let (session, _host) = connected(SessionOptions::default());
        assert!(matches!(session.stat("/missing"), Err(FsError::NotFound(_))));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_renegotiate_reopens_channel() {
        let (session, host) = connected(SessionOptions::default());
        session.ensure_channel().unwrap();
        host.inject_faults("list", ErrorKind::ChannelClosed, 1);
        assert!(session.list_dir("/").is_err());

        session.renegotiate().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(host.channels_opened(), 2);
    }

    #[test]
    fn test_renegotiate_without_channel_stays_connected() {
        let (session, host) = connected(SessionOptions::default());
        session.renegotiate().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(host.channels_opened(), 0);
    }

    #[test]
    fn test_thread_safe_session_is_reentrant() {
        let (session, host) = connected(SessionOptions {
            thread_safe: true,
            ..Default::default()
        });
        host.write("/x", b"12");
        let _outer = session.serialize();
        assert_eq!(session.read_file("/x").unwrap(), b"12");
    }
}
