//! Fan-out over several connections

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{from_descriptor, open_host, Connection, ConnectionOptions};
use crate::config::{ConnectionDescriptor, HostRegistry};
use crate::error::FsError;
use crate::fs::{CompletedProcess, RunOptions};

/// Connections served concurrently by default
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Several connections addressed by server name.
///
/// Calls are fanned out on a private runtime, at most `max_parallel` at a
/// time. Results come back in connection order. The fan-out methods block
/// and must not be called from inside an async context.
pub struct MultiConnection {
    connections: Vec<Arc<dyn Connection>>,
    max_parallel: usize,
    runtime: Runtime,
}

impl MultiConnection {
    pub fn new(connections: Vec<Arc<dyn Connection>>, max_parallel: usize) -> Result<Self, FsError> {
        let max_parallel = max_parallel.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_parallel)
            .thread_name("hostfs-multi")
            .enable_all()
            .build()?;
        Ok(Self {
            connections,
            max_parallel,
            runtime,
        })
    }

    /// Open every alias from the registry
    pub fn from_registry(
        registry: &HostRegistry,
        aliases: &[&str],
        allow_agent: bool,
        options: ConnectionOptions,
    ) -> Result<Self, FsError> {
        let connections = aliases
            .iter()
            .map(|alias| open_host(registry, alias, false, allow_agent, options.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        info!("Opened {} connection(s)", connections.len());
        Self::new(connections, DEFAULT_MAX_PARALLEL)
    }

    /// Reopen connections from [`MultiConnection::to_map`] output
    pub fn from_map(
        map: &BTreeMap<usize, ConnectionDescriptor>,
        password: Option<&str>,
    ) -> Result<Self, FsError> {
        let connections = map
            .values()
            .map(|descriptor| from_descriptor(descriptor, password))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(connections, DEFAULT_MAX_PARALLEL)
    }

    pub fn to_map(&self) -> BTreeMap<usize, ConnectionDescriptor> {
        self.connections
            .iter()
            .map(|c| c.to_descriptor())
            .enumerate()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Server names in connection order, repeated for duplicate hosts
    pub fn server_names(&self) -> Vec<&str> {
        self.connections.iter().map(|c| c.server_name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Connection>> {
        self.connections.iter()
    }

    /// First connection to `server_name`
    pub fn get(&self, server_name: &str) -> Option<Arc<dyn Connection>> {
        let name = server_name.to_lowercase();
        self.connections
            .iter()
            .find(|c| c.server_name() == name)
            .cloned()
    }

    pub fn push(&mut self, connection: Arc<dyn Connection>) {
        debug!("Adding connection to {}", connection.server_name());
        self.connections.push(connection);
    }

    /// Take every connection to `server_name` out of the set
    pub fn remove(&mut self, server_name: &str) -> Vec<Arc<dyn Connection>> {
        let name = server_name.to_lowercase();
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .connections
            .drain(..)
            .partition(|c| c.server_name() == name);
        self.connections = kept;
        removed
    }

    /// Call `f` on every connection, in parallel
    pub fn map<R, F>(&self, f: F) -> Vec<Result<R, FsError>>
    where
        R: Send + 'static,
        F: Fn(&dyn Connection) -> Result<R, FsError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        let tasks = self.connections.iter().map(|connection| {
            let connection = Arc::clone(connection);
            let f = Arc::clone(&f);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| FsError::Unsupported(e.to_string()))?;
                let server = connection.server_name().to_string();
                tokio::task::spawn_blocking(move || (*f)(connection.as_ref()))
                    .await
                    .map_err(|e| {
                        FsError::Io(std::io::Error::other(format!("task for {} failed: {}", server, e)))
                    })?
            }
        });

        self.runtime.block_on(join_all(tasks))
    }

    /// Run the same command on every host
    pub fn run(&self, args: &[&str], options: &RunOptions) -> Vec<Result<CompletedProcess, FsError>> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let options = options.clone();
        self.map(move |connection| {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            connection.runner().run(&args, &options)
        })
    }

    pub fn close(&self) {
        for connection in &self.connections {
            connection.close();
        }
    }
}

impl std::fmt::Debug for MultiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiConnection")
            .field("servers", &self.server_names())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionKind;
    use crate::connection::{LocalConnection, SshConnection};
    use crate::fs::FileSystem;
    use crate::session::{MemoryHost, MemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn memory_connection(name: &str, host: &MemoryHost) -> Arc<dyn Connection> {
        let descriptor = ConnectionDescriptor {
            kind: ConnectionKind::Ssh,
            server_name: name.to_lowercase(),
            address: Some(format!("{}.invalid", name)),
            user_name: "user".into(),
            ssh_key: None,
            port: 22,
            thread_safe: true,
            allow_agent: true,
        };
        let options = ConnectionOptions::default().thread_safe(true);
        Arc::new(SshConnection::new(name, MemoryTransport::new(host.clone()), options, descriptor))
    }

    #[test]
    fn test_map_keeps_connection_order() {
        let hosts: Vec<MemoryHost> = (0..5)
            .map(|i| {
                let host = MemoryHost::new(format!("node{}", i));
                host.write("/etc/id", format!("node-{}", i).as_bytes());
                host
            })
            .collect();
        let connections = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| memory_connection(&format!("node{}", i), h))
            .collect();
        let multi = MultiConnection::new(connections, 2).unwrap();

        let ids: Vec<String> = multi
            .map(|c| c.filesystem().read_file("/etc/id"))
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap()).unwrap())
            .collect();
        assert_eq!(ids, vec!["node-0", "node-1", "node-2", "node-3", "node-4"]);
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let connections = (0..6)
            .map(|i| Arc::new(LocalConnection::new(&format!("l{}", i))) as Arc<dyn Connection>)
            .collect();
        let multi = MultiConnection::new(connections, 2).unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let results = multi.map(move |_| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_errors_are_per_connection() {
        let good = MemoryHost::new("good");
        good.write("/f", b"x");
        let bad = MemoryHost::new("bad");
        let multi = MultiConnection::new(
            vec![memory_connection("good", &good), memory_connection("bad", &bad)],
            DEFAULT_MAX_PARALLEL,
        )
        .unwrap();

        let results = multi.map(|c| c.filesystem().stat("/f"));
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_dict_interface_and_persistence() {
        let mut multi = MultiConnection::new(
            vec![
                Arc::new(LocalConnection::with_user("Alpha", "me")) as Arc<dyn Connection>,
                Arc::new(LocalConnection::with_user("beta", "me")),
            ],
            DEFAULT_MAX_PARALLEL,
        )
        .unwrap();
        multi.push(Arc::new(LocalConnection::with_user("alpha", "me")));

        assert_eq!(multi.server_names(), vec!["alpha", "beta", "alpha"]);
        assert!(multi.get("ALPHA").is_some());

        let map = multi.to_map();
        assert_eq!(map.len(), 3);
        let reopened = MultiConnection::from_map(&map, None).unwrap();
        assert_eq!(reopened.server_names(), multi.server_names());

        assert_eq!(multi.remove("alpha").len(), 2);
        assert_eq!(multi.server_names(), vec!["beta"]);
        multi.close();
    }
}
