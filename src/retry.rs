//! Connection Retry Logic
//!
//! [`RetryGuard`] runs an operation, classifies its failure and, for transient
//! transport faults, renegotiates the session and runs the operation again
//! from the top. Transient faults are retried without an attempt ceiling using
//! a fixed backoff between failed repairs; only authentication inside
//! `connect` is bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutexGuard;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, FsError};
use crate::session::DEFAULT_AUTH_ATTEMPTS;

/// Default wait between failed repairs
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Something the guard can repair after a transient fault
pub trait Renegotiate: Send + Sync {
    /// Close and re-establish the connection, reopening the file channel if
    /// one was open
    fn renegotiate(&self) -> Result<(), FsError>;

    /// Host identity for logs
    fn target(&self) -> &str;

    /// Operation-wide lock held for the whole guarded call, if any
    fn lock_operation(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        None
    }
}

/// Per-operation retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Kinds returned unchanged on first occurrence
    pub excluded: Vec<ErrorKind>,
    /// Fixed wait between failed repairs
    pub backoff: Duration,
    /// Authentication attempts made by each connect
    pub auth_attempts: u32,
    /// Give up repairing after this long. `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            excluded: Vec::new(),
            backoff: DEFAULT_BACKOFF,
            auth_attempts: DEFAULT_AUTH_ATTEMPTS,
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add kinds that must never be retried for this operation
    pub fn excluding(mut self, kinds: &[ErrorKind]) -> Self {
        for kind in kinds {
            if !self.excluded.contains(kind) {
                self.excluded.push(*kind);
            }
        }
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_auth_attempts(mut self, attempts: u32) -> Self {
        self.auth_attempts = attempts;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    pub fn excludes(&self, kind: ErrorKind) -> bool {
        self.excluded.contains(&kind)
    }
}

/// How the guard treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Excluded by the policy; returned unchanged
    Excluded,
    /// Renegotiate and run again
    Repair,
    /// Not a transport fault; returned unchanged
    Propagate,
}

pub fn classify(err: &FsError, policy: &RetryPolicy) -> Verdict {
    let kind = err.kind();
    if policy.excludes(kind) {
        Verdict::Excluded
    } else if kind.is_transient() {
        Verdict::Repair
    } else {
        Verdict::Propagate
    }
}

/// Counters kept for observability
#[derive(Debug, Default)]
pub struct RetryStats {
    faults: AtomicU64,
    repairs: AtomicU64,
    backoff_waits: AtomicU64,
}

/// Point-in-time copy of [`RetryStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrySnapshot {
    /// Transient faults seen
    pub faults: u64,
    /// Successful renegotiations
    pub repairs: u64,
    /// Backoff sleeps after failed renegotiations
    pub backoff_waits: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
            backoff_waits: self.backoff_waits.load(Ordering::Relaxed),
        }
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retry boundary for network-touching calls
#[derive(Clone)]
pub struct RetryGuard {
    sleeper: Sleeper,
    stats: Arc<RetryStats>,
}

impl Default for RetryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryGuard")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl RetryGuard {
    pub fn new() -> Self {
        Self::with_sleeper(std::thread::sleep)
    }

    /// Replace the blocking sleep used for backoff waits
    pub fn with_sleeper(sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        Self {
            sleeper: Arc::new(sleeper),
            stats: Arc::new(RetryStats::default()),
        }
    }

    pub fn stats(&self) -> RetrySnapshot {
        self.stats.snapshot()
    }

    /// Run `op`, repairing `session` and re-running `op` after transient faults.
    ///
    /// Each re-run starts the operation from the top; side effects committed
    /// before the fault stand.
    pub fn run<S, R, F>(
        &self,
        session: &S,
        policy: &RetryPolicy,
        op_name: &str,
        mut op: F,
    ) -> Result<R, FsError>
    where
        S: Renegotiate + ?Sized,
        F: FnMut() -> Result<R, FsError>,
    {
        let _serial = session.lock_operation();
        let started = Instant::now();
        let mut attempt: u64 = 0;

        loop {
            let err = match op() {
                Ok(value) => {
                    if attempt > 0 {
                        info!(host = session.target(), op = op_name, attempt, "Operation succeeded after repair");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            match classify(&err, policy) {
                Verdict::Excluded => {
                    debug!(host = session.target(), op = op_name, kind = %err.kind(), "Excluded fault, propagating: {}", err);
                    return Err(err);
                }
                Verdict::Propagate => {
                    debug!(host = session.target(), op = op_name, kind = %err.kind(), "Non-transient fault, propagating: {}", err);
                    return Err(err);
                }
                Verdict::Repair => {}
            }

            attempt += 1;
            self.stats.faults.fetch_add(1, Ordering::Relaxed);
            warn!(
                host = session.target(),
                op = op_name,
                kind = %err.kind(),
                attempt,
                "Transient fault, renegotiating session: {}",
                err
            );
            self.repair(session, policy, started, op_name)?;
        }
    }

    fn repair<S>(
        &self,
        session: &S,
        policy: &RetryPolicy,
        started: Instant,
        op_name: &str,
    ) -> Result<(), FsError>
    where
        S: Renegotiate + ?Sized,
    {
        loop {
            match session.renegotiate() {
                Ok(()) => {
                    self.stats.repairs.fetch_add(1, Ordering::Relaxed);
                    info!(host = session.target(), op = op_name, "Session renegotiated");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    if let Some(budget) = policy.max_elapsed {
                        if started.elapsed() >= budget {
                            error!(host = session.target(), op = op_name, "Retry budget of {:?} exhausted: {}", budget, e);
                            return Err(FsError::ConnectionLost(format!(
                                "{}: gave up after {:?}: {}",
                                session.target(),
                                budget,
                                e
                            )));
                        }
                    }
                    self.stats.backoff_waits.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        host = session.target(),
                        op = op_name,
                        kind = %e.kind(),
                        "Renegotiation failed, retrying in {:?}: {}",
                        policy.backoff,
                        e
                    );
                    (self.sleeper)(policy.backoff);
                }
                Err(e) => {
                    error!(host = session.target(), op = op_name, kind = %e.kind(), "Renegotiation failed fatally: {}", e);
                    return Err(e);
                }
            }
        }
    }
}
