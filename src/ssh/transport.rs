//! SSH implementation of [`Transport`]
//!
//! russh is async; the session API is blocking. Each transport owns a small
//! multi-threaded runtime so the russh connection task keeps running between
//! calls, and every primitive is driven to completion with `block_on`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use russh::ChannelMsg;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::client::{self, ClientHandler};
use super::config::SshConfig;
use crate::error::FsError;
use crate::fs::path_utils::file_name;
use crate::fs::{shell_quote, CompletedProcess, FileEntry, FileKind, RunOptions, DEFAULT_DIR_MODE};
use crate::session::{FileChannel, Transport};

/// Chunk size for SFTP file copies
const CHUNK_SIZE: usize = 64 * 1024;

/// SSH connection to one host
pub struct SshTransport {
    config: SshConfig,
    host: String,
    runtime: Arc<Runtime>,
    handle: Option<Handle<ClientHandler>>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Result<Self, FsError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hostfs-ssh")
            .enable_all()
            .build()?;
        let host = format!("{}@{}", config.username, config.address());
        Ok(Self {
            config,
            host,
            runtime: Arc::new(runtime),
            handle: None,
        })
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn handle(&self) -> Result<&Handle<ClientHandler>, FsError> {
        match &self.handle {
            Some(handle) if !handle.is_closed() => Ok(handle),
            _ => Err(FsError::ConnectionLost(format!("{} is not connected", self.host))),
        }
    }
}

impl Transport for SshTransport {
    type Channel = SshFileChannel;

    fn host(&self) -> &str {
        &self.host
    }

    fn authenticate(&mut self) -> Result<(), FsError> {
        self.disconnect();

        let config = &self.config;
        let handle = self.runtime.block_on(async {
            let mut handle = client::connect(config).await?;
            client::authenticate(&mut handle, config).await?;
            Ok::<_, FsError>(handle)
        })?;

        self.handle = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Disconnecting from {}", self.host);
            let result = self.runtime.block_on(async {
                handle
                    .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                    .await
            });
            if let Err(e) = result {
                debug!("Disconnect from {} was not clean: {}", self.host, e);
            }
        }
    }

    fn open_channel(&mut self) -> Result<SshFileChannel, FsError> {
        let handle = self.handle()?;
        let sftp = self.runtime.block_on(async {
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| FsError::ChannelOpen(e.to_string()))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| FsError::ChannelOpen(format!("Failed to request SFTP subsystem: {}", e)))?;
            SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| FsError::ChannelOpen(e.to_string()))
        })?;

        info!("SFTP subsystem opened on {}", self.host);
        Ok(SshFileChannel {
            sftp: Some(sftp),
            runtime: Arc::clone(&self.runtime),
        })
    }

    fn exec(&mut self, command: &str, options: &RunOptions) -> Result<CompletedProcess, FsError> {
        let handle = self.handle()?;
        let line = build_command(command, options);
        debug!("Executing on {}: {}", self.host, line);

        let completed = self.runtime.block_on(async {
            let run = run_channel(handle, &line, options.input.as_deref());
            match options.timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                    .await
                    .map_err(|_| FsError::Timeout {
                        command: command.to_string(),
                        secs,
                    })?,
                None => run.await,
            }
        })?;

        Ok(CompletedProcess {
            args: vec![command.to_string()],
            ..completed
        })
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Prefix `command` with the environment and working directory from `options`
fn build_command(command: &str, options: &RunOptions) -> String {
    let mut line = String::new();
    for (key, value) in &options.env {
        line.push_str(&format!("export {}={}; ", key, shell_quote(value)));
    }
    if let Some(cwd) = &options.cwd {
        line.push_str(&format!("cd {} && ", shell_quote(cwd)));
    }
    line.push_str(command);
    line
}

async fn run_channel(
    handle: &Handle<ClientHandler>,
    line: &str,
    input: Option<&[u8]>,
) -> Result<CompletedProcess, FsError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FsError::ChannelOpen(e.to_string()))?;

    channel.exec(true, line).await?;
    if let Some(input) = input {
        channel.data(input).await?;
    }
    channel.eof().await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut returncode = None;

    // Exit status may arrive after EOF, so only Close ends the loop
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => returncode = Some(exit_status as i32),
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                warn!("Remote command killed by signal {:?}", signal_name);
                returncode.get_or_insert(-1);
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let returncode = returncode.ok_or_else(|| {
        FsError::ChannelClosed(format!("'{}' ended without an exit status", line))
    })?;

    Ok(CompletedProcess {
        args: vec![line.to_string()],
        returncode,
        stdout,
        stderr,
    })
}

/// Map an SFTP failure onto the error kinds, keeping the offending path
fn map_sftp_error(err: SftpErrorInner, path: &str) -> FsError {
    match FsError::from(err) {
        FsError::NotFound(_) => FsError::NotFound(path.to_string()),
        FsError::PermissionDenied(_) => FsError::PermissionDenied(path.to_string()),
        FsError::ChannelClosed(msg) => FsError::ChannelClosed(format!("{}: {}", path, msg)),
        FsError::Protocol(msg) => FsError::Protocol(format!("{}: {}", path, msg)),
        other => other,
    }
}

fn entry_from_attrs(path: &str, name: &str, attrs: &FileAttributes) -> FileEntry {
    let mut mode = attrs.permissions.unwrap_or(0);
    if FileKind::from_mode(mode) == FileKind::Other {
        // Some servers omit the type bits
        let kind = if attrs.is_dir() {
            FileKind::Directory
        } else if attrs.is_symlink() {
            FileKind::Symlink
        } else if attrs.is_regular() {
            FileKind::File
        } else {
            FileKind::Other
        };
        mode = kind.mode_bits() | (mode & 0o7777);
    }

    FileEntry {
        path: path.to_string(),
        name: name.to_string(),
        kind: FileKind::from_mode(mode),
        size: attrs.size.unwrap_or(0),
        mode,
        mtime: attrs.mtime.map(|t| t as i64).unwrap_or(0),
    }
}

fn local_error(err: std::io::Error, path: &Path) -> FsError {
    FsError::from_io(err, &path.to_string_lossy())
}

/// Reads and writes on an open SFTP file only fail when the channel does
fn stream_error(err: std::io::Error, path: &str) -> FsError {
    FsError::ChannelClosed(format!("{}: {}", path, err))
}

/// SFTP subsystem channel
pub struct SshFileChannel {
    sftp: Option<SftpSession>,
    runtime: Arc<Runtime>,
}

impl SshFileChannel {
    fn sftp(&self) -> Result<&SftpSession, FsError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| FsError::ChannelClosed("SFTP session closed".to_string()))
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Drop for SshFileChannel {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        self.sftp.take();
    }
}

impl FileChannel for SshFileChannel {
    fn stat(&mut self, path: &str) -> Result<FileEntry, FsError> {
        let sftp = self.sftp()?;
        let attrs = self
            .block_on(sftp.metadata(path))
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(entry_from_attrs(path, file_name(path), &attrs))
    }

    fn lstat(&mut self, path: &str) -> Result<FileEntry, FsError> {
        let sftp = self.sftp()?;
        let attrs = self
            .block_on(sftp.symlink_metadata(path))
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(entry_from_attrs(path, file_name(path), &attrs))
    }

    fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        let sftp = self.sftp()?;
        let read_dir = self
            .block_on(sftp.read_dir(path))
            .map_err(|e| match map_sftp_error(e, path) {
                // Listing a file fails with a generic status
                FsError::Protocol(msg) => match self.block_on(sftp.metadata(path)) {
                    Ok(attrs) if !attrs.is_dir() => FsError::NotADirectory(path.to_string()),
                    _ => FsError::Protocol(msg),
                },
                other => other,
            })?;

        let entries = read_dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| {
                let name = entry.file_name();
                let full = crate::fs::path_utils::join_remote_path(path, &name);
                entry_from_attrs(&full, &name, &entry.metadata())
            })
            .collect();
        Ok(entries)
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        if let Err(e) = self.block_on(sftp.create_dir(path)) {
            return Err(match self.block_on(sftp.symlink_metadata(path)) {
                Ok(_) => FsError::AlreadyExists(path.to_string()),
                Err(_) => map_sftp_error(e, path),
            });
        }
        if mode != DEFAULT_DIR_MODE {
            self.chmod(path, mode)?;
        }
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        match self.block_on(sftp.remove_dir(path)) {
            Ok(()) => Ok(()),
            Err(e) => match map_sftp_error(e, path) {
                FsError::Protocol(msg) => match self.block_on(sftp.read_dir(path)) {
                    Ok(mut entries) => {
                        if entries.any(|e| e.file_name() != "." && e.file_name() != "..") {
                            Err(FsError::DirectoryNotEmpty(path.to_string()))
                        } else {
                            Err(FsError::Protocol(msg))
                        }
                    }
                    Err(_) => Err(FsError::Protocol(msg)),
                },
                other => Err(other),
            },
        }
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        self.block_on(sftp.remove_file(path))
            .map_err(|e| map_sftp_error(e, path))
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        self.block_on(sftp.rename(src, dst))
            .map_err(|e| map_sftp_error(e, src))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        let attrs = FileAttributes {
            permissions: Some(mode & 0o7777),
            ..FileAttributes::empty()
        };
        self.block_on(sftp.set_metadata(path, attrs))
            .map_err(|e| map_sftp_error(e, path))
    }

    fn symlink(&mut self, target: &str, link: &str) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        self.block_on(sftp.symlink(link, target))
            .map_err(|e| map_sftp_error(e, link))
    }

    fn readlink(&mut self, path: &str) -> Result<String, FsError> {
        let sftp = self.sftp()?;
        self.block_on(sftp.read_link(path))
            .map_err(|e| map_sftp_error(e, path))
    }

    fn realpath(&mut self, path: &str) -> Result<String, FsError> {
        let sftp = self.sftp()?;
        self.block_on(sftp.canonicalize(path))
            .map_err(|e| map_sftp_error(e, path))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let sftp = self.sftp()?;
        self.block_on(async {
            let mut file = sftp.open(path).await.map_err(|e| map_sftp_error(e, path))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .await
                .map_err(|e| stream_error(e, path))?;
            Ok(data)
        })
    }

    fn write_file(&mut self, path: &str, data: &[u8], append: bool) -> Result<(), FsError> {
        let sftp = self.sftp()?;
        let flags = if append {
            OpenFlags::CREATE | OpenFlags::APPEND | OpenFlags::WRITE
        } else {
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
        };
        self.block_on(async {
            let mut file = sftp
                .open_with_flags(path, flags)
                .await
                .map_err(|e| map_sftp_error(e, path))?;
            file.write_all(data).await.map_err(|e| stream_error(e, path))?;
            file.flush().await.map_err(|e| stream_error(e, path))?;
            file.shutdown().await.map_err(|e| stream_error(e, path))?;
            Ok(())
        })
    }

    fn get(
        &mut self,
        remote: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let sftp = self.sftp()?;

        let copied = self.block_on(async {
            let mut file = sftp
                .open(remote)
                .await
                .map_err(|e| map_sftp_error(e, remote))?;
            let mut out = std::fs::File::create(local).map_err(|e| local_error(e, local))?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut copied = 0u64;
            loop {
                let n = file.read(&mut buf).await.map_err(|e| stream_error(e, remote))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).map_err(|e| local_error(e, local))?;
                copied += n as u64;
                progress(copied);
            }
            out.flush().map_err(|e| local_error(e, local))?;
            Ok::<_, FsError>(copied)
        })?;

        debug!("Downloaded {} ({} bytes)", remote, copied);
        Ok(copied)
    }

    fn put(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FsError> {
        let sftp = self.sftp()?;
        let mut input = std::fs::File::open(local).map_err(|e| local_error(e, local))?;

        let copied = self.block_on(async {
            let mut file = sftp
                .open_with_flags(
                    remote,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| map_sftp_error(e, remote))?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut copied = 0u64;
            loop {
                let n = input.read(&mut buf).map_err(|e| local_error(e, local))?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])
                    .await
                    .map_err(|e| stream_error(e, remote))?;
                copied += n as u64;
                progress(copied);
            }
            file.flush().await.map_err(|e| stream_error(e, remote))?;
            file.shutdown().await.map_err(|e| stream_error(e, remote))?;
            Ok::<_, FsError>(copied)
        })?;

        debug!("Uploaded {} ({} bytes)", remote, copied);
        Ok(copied)
    }
}
