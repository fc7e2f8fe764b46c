//! Tree transfer types

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Which way files move relative to the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local
    Get,
    /// Local to remote
    Put,
}

impl FromStr for Direction {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Direction::Get),
            "put" => Ok(Direction::Put),
            other => Err(FsError::InvalidArgument(format!(
                "{} is not valid direction. Choose 'put' or 'get'",
                other
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Get => write!(f, "get"),
            Direction::Put => write!(f, "put"),
        }
    }
}

/// One file scheduled for copying
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub src: String,
    pub dst: String,
    pub size: u64,
}

/// Everything a tree transfer will do, computed before any byte moves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    /// Files in walk order
    pub files: Vec<PlannedFile>,
    /// Destination directories to create
    pub dirs: BTreeSet<String>,
    /// Sum of all planned file sizes
    pub total_bytes: u64,
}

impl TransferPlan {
    pub fn push(&mut self, file: PlannedFile) {
        self.total_bytes += file.size;
        self.files.push(file);
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Options for [`TreeTransferEngine::transfer`](super::TreeTransferEngine::transfer)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Copy only files whose name matches one of these patterns
    pub include: Vec<String>,
    /// Never copy files whose name matches one of these patterns
    pub exclude: Vec<String>,
    /// Remove the source tree once every file is copied
    pub remove_after: bool,
    /// Descend into symlinked directories of the source
    pub follow_symlinks: bool,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn remove_after(mut self, remove: bool) -> Self {
        self.remove_after = remove;
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }
}

/// Aggregate progress of a tree transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub direction: Direction,
    /// Bytes copied so far over all files
    pub transferred_bytes: u64,
    /// Planned bytes over all files
    pub total_bytes: u64,
    /// Source path of the file being copied
    pub current_file: String,
    pub files_done: usize,
    pub files_total: usize,
}

impl TransferProgress {
    /// Calculate progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files_done == self.files_total
    }
}
