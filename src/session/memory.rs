//! In-memory emulated host
//!
//! [`MemoryHost`] holds a POSIX-like tree and connection bookkeeping behind a
//! shared lock. [`MemoryTransport`] drives it through the same [`Transport`]
//! boundary the SSH transport implements, including scripted faults, so
//! sessions and guards can be exercised without a network.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::transport::{FileChannel, Transport};
use crate::error::{ErrorKind, FsError};
use crate::fs::path_utils::{join_remote_path, normalize, parent};
use crate::fs::{CompletedProcess, FileEntry, FileKind, RunOptions};

const MAX_SYMLINK_HOPS: usize = 40;
const GET_CHUNK_SIZE: usize = 32 * 1024;

type ExecHandler = Arc<dyn Fn(&str, &RunOptions) -> Result<CompletedProcess, FsError> + Send + Sync>;

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    mode: u32,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            kind: NodeKind::Dir,
            mode,
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            kind: NodeKind::File(data),
            mode: 0o644,
        }
    }

    fn entry(&self, path: &str) -> FileEntry {
        let (kind, size) = match &self.kind {
            NodeKind::File(data) => (FileKind::File, data.len() as u64),
            NodeKind::Dir => (FileKind::Directory, 4096),
            NodeKind::Symlink(target) => (FileKind::Symlink, target.len() as u64),
        };
        FileEntry::new(path, kind, size, self.mode)
    }
}

#[derive(Debug)]
struct Fault {
    op: String,
    kind: ErrorKind,
    skip: usize,
    remaining: usize,
}

fn fault_error(kind: ErrorKind, op: &str) -> FsError {
    let msg = format!("injected {} fault", op);
    match kind {
        ErrorKind::Authentication => FsError::Authentication(msg),
        ErrorKind::ConnectionFailed => FsError::ConnectionFailed(msg),
        ErrorKind::ConnectionLost => FsError::ConnectionLost(msg),
        ErrorKind::ChannelClosed => FsError::ChannelClosed(msg),
        ErrorKind::ChannelOpen => FsError::ChannelOpen(msg),
        ErrorKind::Io => FsError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg)),
        ErrorKind::LocalIo => FsError::LocalIo {
            path: op.to_string(),
            source: std::io::Error::other(msg),
        },
        ErrorKind::Protocol => FsError::Protocol(msg),
        ErrorKind::NotFound => FsError::NotFound(msg),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(msg),
        ErrorKind::NotADirectory => FsError::NotADirectory(msg),
        ErrorKind::IsADirectory => FsError::IsADirectory(msg),
        ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty(msg),
        ErrorKind::PermissionDenied => FsError::PermissionDenied(msg),
        ErrorKind::CommandFailed => FsError::CommandFailed {
            command: op.to_string(),
            status: 1,
        },
        ErrorKind::Timeout => FsError::Timeout {
            command: op.to_string(),
            secs: 0,
        },
        ErrorKind::InvalidArgument => FsError::InvalidArgument(msg),
        ErrorKind::Unsupported => FsError::Unsupported(msg),
    }
}

struct HostState {
    name: String,
    home: String,
    nodes: BTreeMap<String, Node>,
    connected: bool,
    /// Bumped on every connect and disconnect; channels from older generations are stale
    generation: u64,
    refusals: u32,
    login_rejects: u32,
    login_attempts: usize,
    connects: usize,
    channels_opened: usize,
    faults: Vec<Fault>,
    exec_handler: Option<ExecHandler>,
    exec_log: Vec<String>,
}

impl HostState {
    fn take_fault(&mut self, op: &str) -> Result<(), FsError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| (f.op == op || f.op == "*") && f.remaining > 0);
        if let Some(fault) = fault {
            if fault.skip > 0 {
                fault.skip -= 1;
            } else {
                fault.remaining -= 1;
                return Err(fault_error(fault.kind, op));
            }
        }
        Ok(())
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize(path)
        } else {
            normalize(&join_remote_path(&self.home, path))
        }
    }

    /// Resolve symlinks in `path`. The final component may be missing.
    fn resolve(&self, path: &str, follow_last: bool) -> Result<String, FsError> {
        let mut current = self.absolute(path);
        let mut hops = 0;

        'restart: loop {
            let parts: Vec<String> = current
                .split('/')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            let mut prefix = "/".to_string();

            for (i, part) in parts.iter().enumerate() {
                let candidate = join_remote_path(&prefix, part);
                let last = i + 1 == parts.len();

                match self.nodes.get(&candidate).map(|n| &n.kind) {
                    Some(NodeKind::Symlink(target)) if !last || follow_last => {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            return Err(FsError::InvalidArgument(format!(
                                "too many levels of symbolic links: {}",
                                path
                            )));
                        }
                        let base = join_remote_path(&prefix, target);
                        let rest = parts[i + 1..].join("/");
                        current = if rest.is_empty() {
                            normalize(&base)
                        } else {
                            normalize(&join_remote_path(&base, &rest))
                        };
                        continue 'restart;
                    }
                    Some(NodeKind::Dir) | Some(NodeKind::Symlink(_)) => {}
                    Some(NodeKind::File(_)) if last => {}
                    Some(NodeKind::File(_)) => return Err(FsError::NotADirectory(candidate)),
                    None if last => {}
                    None => return Err(FsError::NotFound(path.to_string())),
                }
                prefix = candidate;
            }
            return Ok(prefix);
        }
    }

    fn node(&self, resolved: &str, path: &str) -> Result<&Node, FsError> {
        self.nodes
            .get(resolved)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn require_parent_dir(&self, resolved: &str, path: &str) -> Result<(), FsError> {
        match self.nodes.get(&parent(resolved)).map(|n| &n.kind) {
            Some(NodeKind::Dir) => Ok(()),
            Some(_) => Err(FsError::NotADirectory(parent(path))),
            None => Err(FsError::NotFound(parent(path))),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = "/".to_string();
        for part in self.absolute(path).split('/').filter(|p| !p.is_empty()) {
            current = join_remote_path(&current, part);
            self.nodes
                .entry(current.clone())
                .or_insert_with(|| Node::dir(0o755));
        }
    }

    fn stat(&self, path: &str, follow: bool) -> Result<FileEntry, FsError> {
        let resolved = self.resolve(path, follow)?;
        Ok(self.node(&resolved, path)?.entry(path))
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        let resolved = self.resolve(path, true)?;
        match self.node(&resolved, path)?.kind {
            NodeKind::Dir => {}
            _ => return Err(FsError::NotADirectory(path.to_string())),
        }
        Ok(self
            .children(&resolved)
            .into_iter()
            .filter_map(|name| {
                let node = self.nodes.get(&join_remote_path(&resolved, &name))?;
                Some(node.entry(&join_remote_path(path, &name)))
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let resolved = self.resolve(path, false)?;
        if self.nodes.contains_key(&resolved) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        self.require_parent_dir(&resolved, path)?;
        self.nodes.insert(resolved, Node::dir(mode & 0o7777));
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, false)?;
        match self.node(&resolved, path)?.kind {
            NodeKind::Dir => {}
            _ => return Err(FsError::NotADirectory(path.to_string())),
        }
        if !self.children(&resolved).is_empty() {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        self.nodes.remove(&resolved);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, false)?;
        if let NodeKind::Dir = self.node(&resolved, path)?.kind {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.nodes.remove(&resolved);
        Ok(())
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        let from = self.resolve(src, false)?;
        let to = self.resolve(dst, false)?;
        self.node(&from, src)?;
        self.require_parent_dir(&to, dst)?;
        if to.starts_with(&format!("{}/", from)) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself",
                src
            )));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = self.nodes.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                self.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    fn write(&mut self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        let resolved = self.resolve(path, true)?;
        self.require_parent_dir(&resolved, path)?;
        match self.nodes.get_mut(&resolved) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => Err(FsError::IsADirectory(path.to_string())),
            Some(Node {
                kind: NodeKind::File(existing),
                ..
            }) => {
                if !append {
                    existing.clear();
                }
                existing.extend_from_slice(data);
                Ok(())
            }
            _ => {
                self.nodes.insert(resolved, Node::file(data.to_vec()));
                Ok(())
            }
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let resolved = self.resolve(path, true)?;
        match &self.node(&resolved, path)?.kind {
            NodeKind::File(data) => Ok(data.clone()),
            NodeKind::Dir => Err(FsError::IsADirectory(path.to_string())),
            NodeKind::Symlink(_) => Err(FsError::NotFound(path.to_string())),
        }
    }
}

/// Shared handle to an emulated host
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    /// Empty host with `/home/user` as home directory
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::dir(0o755));
        let mut state = HostState {
            name: name.into(),
            home: "/home/user".to_string(),
            nodes,
            connected: false,
            generation: 0,
            refusals: 0,
            login_rejects: 0,
            login_attempts: 0,
            connects: 0,
            channels_opened: 0,
            faults: Vec::new(),
            exec_handler: None,
            exec_log: Vec::new(),
        };
        state.mkdir_all("/home/user");
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Create a file, making missing parent directories
    pub fn write(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let parent_dir = parent(&state.absolute(path));
        state.mkdir_all(&parent_dir);
        let resolved = state.absolute(path);
        state.nodes.insert(resolved, Node::file(data.to_vec()));
    }

    pub fn mkdir_all(&self, path: &str) {
        self.state.lock().mkdir_all(path);
    }

    pub fn symlink(&self, target: &str, link: &str) {
        let mut state = self.state.lock();
        let resolved = state.absolute(link);
        state.nodes.insert(
            resolved,
            Node {
                kind: NodeKind::Symlink(target.to_string()),
                mode: 0o777,
            },
        );
    }

    /// File contents, following symlinks
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().read(path).ok()
    }

    pub fn exists(&self, path: &str) -> bool {
        let state = self.state.lock();
        match state.resolve(path, false) {
            Ok(resolved) => state.nodes.contains_key(&resolved),
            Err(_) => false,
        }
    }

    /// Every path on the host, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    /// Refuse the next `count` connection attempts as if the host were unreachable
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refusals = count;
    }

    /// Reject the next `count` logins
    pub fn reject_logins(&self, count: u32) {
        self.state.lock().login_rejects = count;
    }

    /// Fail the next `times` calls of `op` (`"*"` for any) with an error of `kind`
    pub fn inject_faults(&self, op: &str, kind: ErrorKind, times: usize) {
        self.inject_faults_after(op, kind, 0, times);
    }

    /// Like [`inject_faults`](Self::inject_faults), letting `skip` calls succeed first
    pub fn inject_faults_after(&self, op: &str, kind: ErrorKind, skip: usize, times: usize) {
        self.state.lock().faults.push(Fault {
            op: op.to_string(),
            kind,
            skip,
            remaining: times,
        });
    }

    /// Drop the connection under the session's feet
    pub fn kill_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.generation += 1;
    }

    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&str, &RunOptions) -> Result<CompletedProcess, FsError> + Send + Sync + 'static,
    {
        self.state.lock().exec_handler = Some(Arc::new(handler));
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.state.lock().exec_log.clone()
    }

    pub fn login_attempts(&self) -> usize {
        self.state.lock().login_attempts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// [`Transport`] onto a [`MemoryHost`]
pub struct MemoryTransport {
    host: MemoryHost,
    name: String,
}

impl MemoryTransport {
    pub fn new(host: MemoryHost) -> Self {
        let name = host.name();
        Self { host, name }
    }

    pub fn host_handle(&self) -> &MemoryHost {
        &self.host
    }
}

impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    fn host(&self) -> &str {
        &self.name
    }

    fn authenticate(&mut self) -> Result<(), FsError> {
        let mut state = self.host.state.lock();
        state.login_attempts += 1;
        if state.refusals > 0 {
            state.refusals -= 1;
            return Err(FsError::ConnectionLost(format!(
                "{}: connection refused",
                state.name
            )));
        }
        if state.login_rejects > 0 {
            state.login_rejects -= 1;
            return Err(FsError::Authentication(format!(
                "{}: credentials rejected",
                state.name
            )));
        }
        state.connected = true;
        state.generation += 1;
        state.connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.host.state.lock();
        if state.connected {
            state.connected = false;
            state.generation += 1;
        }
    }

    fn open_channel(&mut self) -> Result<MemoryChannel, FsError> {
        let mut state = self.host.state.lock();
        if !state.connected {
            return Err(FsError::ChannelOpen(format!("{}: not connected", state.name)));
        }
        state.take_fault("open_channel")?;
        state.channels_opened += 1;
        Ok(MemoryChannel {
            host: self.host.clone(),
            generation: state.generation,
        })
    }

    fn exec(&mut self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        let handler = {
            let mut state = self.host.state.lock();
            if !state.connected {
                return Err(FsError::ConnectionLost(format!("{}: not connected", state.name)));
            }
            state.take_fault("exec")?;
            state.exec_log.push(command.to_string());
            state.exec_handler.clone()
        };
        match handler {
            Some(handler) => handler(command, options),
            None => Err(FsError::Unsupported(format!(
                "no command handler on {}",
                self.name
            ))),
        }
    }
}

/// File channel onto a [`MemoryHost`]
pub struct MemoryChannel {
    host: MemoryHost,
    generation: u64,
}

impl MemoryChannel {
    fn with_state<R>(
        &self,
        op: &str,
        f: impl FnOnce(&mut HostState) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        let mut state = self.host.state.lock();
        if !state.connected || state.generation != self.generation {
            return Err(FsError::ChannelClosed(format!(
                "{}: stale channel handle",
                state.name
            )));
        }
        state.take_fault(op)?;
        f(&mut state)
    }
}

impl FileChannel for MemoryChannel {
    fn stat(&mut self, path: &str) -> Result<FileEntry, FsError> {
        self.with_state("stat", |s| s.stat(path, true))
    }

    fn lstat(&mut self, path: &str) -> Result<FileEntry, FsError> {
        self.with_state("lstat", |s| s.stat(path, false))
    }

    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        self.with_state("list", |s| s.list(path))
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        self.with_state("mkdir", |s| s.mkdir(path, mode))
    }

    fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        self.with_state("rmdir", |s| s.rmdir(path))
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        self.with_state("remove", |s| s.remove(path))
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        self.with_state("rename", |s| s.rename(src, dst))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        self.with_state("chmod", |s| {
            let resolved = s.resolve(path, true)?;
            match s.nodes.get_mut(&resolved) {
                Some(node) => {
                    node.mode = mode & 0o7777;
                    Ok(())
                }
                None => Err(FsError::NotFound(path.to_string())),
            }
        })
    }

    fn symlink(&mut self, target: &str, link: &str) -> Result<(), FsError> {
        self.with_state("symlink", |s| {
            let resolved = s.resolve(link, false)?;
            if s.nodes.contains_key(&resolved) {
                return Err(FsError::AlreadyExists(link.to_string()));
            }
            s.require_parent_dir(&resolved, link)?;
            s.nodes.insert(
                resolved,
                Node {
                    kind: NodeKind::Symlink(target.to_string()),
                    mode: 0o777,
                },
            );
            Ok(())
        })
    }

    fn readlink(&mut self, path: &str) -> Result<String, FsError> {
        self.with_state("readlink", |s| {
            let resolved = s.resolve(path, false)?;
            match &s.node(&resolved, path)?.kind {
                NodeKind::Symlink(target) => Ok(target.clone()),
                _ => Err(FsError::InvalidArgument(format!("not a symlink: {}", path))),
            }
        })
    }

    fn realpath(&mut self, path: &str) -> Result<String, FsError> {
        self.with_state("realpath", |s| s.resolve(path, true))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        self.with_state("read", |s| s.read(path))
    }

    fn write_file(&mut self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        self.with_state("write", |s| s.write(path, data, append))
    }

    fn get(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let data = self.with_state("get", |s| s.read(remote))?;
        let local_str = local.to_string_lossy().to_string();
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(GET_CHUNK_SIZE) {
            out.extend_from_slice(chunk);
            progress(out.len() as u64);
        }
        std::fs::write(local, &out).map_err(|e| FsError::from_io(e, &local_str))?;
        Ok(data.len() as u64)
    }

    fn put(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let local_str = local.to_string_lossy().to_string();
        let data = std::fs::read(local).map_err(|e| FsError::from_io(e, &local_str))?;
        self.with_state("put", |s| s.write(remote, &data, false))?;
        progress(data.len() as u64);
        Ok(data.len() as u64)
    }
}
