//! The local machine behind the connection surface

use tracing::debug;

use super::Connection;
use crate::config::ConnectionDescriptor;
use crate::error::FsError;
use crate::fs::{open, EncodingErrors, FileObject, FileSystem, FileTransfer, LocalFs, ProcessRunner};
use crate::transfer::{Direction, TransferOptions, TransferPlan, TransferProgress, TreeTransferEngine};
use crate::tree::remove_tree;

/// Connection to the machine the process runs on.
///
/// Tree "transfers" are local copies.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    server_name: String,
    user_name: String,
    fs: LocalFs,
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

impl LocalConnection {
    pub fn new(server_name: &str) -> Self {
        Self::with_user(server_name, &current_user())
    }

    pub fn with_user(server_name: &str, user_name: &str) -> Self {
        Self {
            server_name: server_name.to_lowercase(),
            user_name: user_name.to_string(),
            fs: LocalFs,
        }
    }

    fn copy_tree(
        &self,
        source: &str,
        dest: &str,
        direction: Direction,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        TreeTransferEngine::new(&self.fs, &self.fs, &self.fs).transfer(source, dest, direction, options, progress)
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl Connection for LocalConnection {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn is_local(&self) -> bool {
        true
    }

    fn filesystem(&self) -> &dyn FileSystem {
        &self.fs
    }

    fn transfer(&self) -> &dyn FileTransfer {
        &self.fs
    }

    fn runner(&self) -> &dyn ProcessRunner {
        &self.fs
    }

    fn download_tree(
        &self,
        remote: &str,
        local: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        self.copy_tree(remote, local, Direction::Get, options, progress)
    }

    fn upload_tree(
        &self,
        local: &str,
        remote: &str,
        options: &TransferOptions,
        progress: &mut dyn FnMut(&TransferProgress),
    ) -> Result<TransferPlan, FsError> {
        self.copy_tree(local, remote, Direction::Put, options, progress)
    }

    fn rmtree(&self, path: &str) -> Result<(), FsError> {
        remove_tree(&self.fs, path)
    }

    fn open(
        &self,
        path: &str,
        mode: &str,
        encoding: Option<&str>,
        errors: EncodingErrors,
    ) -> Result<FileObject<'_>, FsError> {
        open(&self.fs, path, mode, encoding, errors)
    }

    fn close(&self) {
        debug!("Closing local connection");
    }

    fn to_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::local(&self.server_name, &self.user_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RunOptions;

    #[test]
    fn test_local_tree_copy_and_rmtree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("deep")).unwrap();
        std::fs::write(src.join("deep").join("a.dat"), b"1234").unwrap();
        std::fs::write(src.join("b.txt"), b"5").unwrap();
        let dst = tmp.path().join("dst");

        let conn = LocalConnection::default();
        let plan = conn
            .upload_tree(
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
                &TransferOptions::new().exclude("*.txt"),
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(plan.total_bytes, 4);
        assert_eq!(std::fs::read(dst.join("deep").join("a.dat")).unwrap(), b"1234");
        assert!(!dst.join("b.txt").exists());

        conn.rmtree(&dst.to_string_lossy()).unwrap();
        assert!(!dst.exists());
    }

    #[test]
    fn test_local_path_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new("Box");
        assert_eq!(conn.server_name(), "box");

        let file = conn.path(&tmp.path().to_string_lossy()).join("note.txt");
        file.write_text("héllo", None, EncodingErrors::Strict).unwrap();
        let mut reader = conn
            .open(file.as_str(), "r", None, EncodingErrors::Strict)
            .unwrap();
        assert_eq!(reader.read_text().unwrap(), "héllo");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_runner() {
        let conn = LocalConnection::default();
        let done = conn
            .runner()
            .run(&["echo", "hi"], &RunOptions::new())
            .unwrap();
        assert_eq!(done.stdout_text(), "hi\n");
    }
}
