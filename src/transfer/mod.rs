//! Whole-directory tree transfers

pub mod engine;
pub mod types;

pub use engine::TreeTransferEngine;
pub use types::{Direction, PlannedFile, TransferOptions, TransferPlan, TransferProgress};
