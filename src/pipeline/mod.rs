//! Bounded concurrent detection-and-persistence pipeline.
//!
//! Workers pull units from a [`WorkPartitioner`], publish detected records into
//! shared [`Accumulator`]s, and an [`AccumulationMonitor`] on the calling thread
//! batch-persists those maps and evicts per-revision working sets that no
//! in-flight commit can still reference.

pub mod accumulator;
pub mod ids;
pub mod monitor;
pub mod partition;
pub mod worker;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::index::lineage::RevisionId;

pub use accumulator::{Accumulator, DependencyIndex, ProcessedCommits, WorkingSet};
pub use ids::IdAllocator;
pub use monitor::{AccumulationMonitor, MonitorError, MonitorReport, MonitorState};
pub use partition::WorkPartitioner;
pub use worker::{CompletionLatch, PoolReport, UnitFailure, WorkerPool};

pub const FLUSH_THRESHOLD_DEFAULT: usize = 10_000;
pub const POLL_INTERVAL_DEFAULT: Duration = Duration::from_millis(1_000);
pub const CLONE_SIZE_THRESHOLD_DEFAULT: u32 = 30;
pub const LINK_SIMILARITY_DEFAULT: f32 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub workers: usize,
    pub flush_threshold: usize,
    pub poll_interval: Duration,
    pub cross_project: bool,
    pub clone_size_threshold: u32,
    pub link_similarity: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            flush_threshold: FLUSH_THRESHOLD_DEFAULT,
            poll_interval: POLL_INTERVAL_DEFAULT,
            cross_project: false,
            clone_size_threshold: CLONE_SIZE_THRESHOLD_DEFAULT,
            link_similarity: LINK_SIMILARITY_DEFAULT,
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Durable sink for one record type.
pub trait Registerer<T>: Sync {
    fn register(&self, items: &[T]) -> Result<(), RegisterError>;
}

/// Source of the records present in one revision.
pub trait Retriever<T>: Sync {
    fn retrieve(&self, revision: RevisionId) -> Result<BTreeMap<i64, T>, UnitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterError {
    message: String,
    code: Option<i32>,
    causes: Vec<String>,
}

impl RegisterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            causes: Vec::new(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extended SQLite result code, when the failure came from the engine.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn causes(&self) -> &[String] {
        &self.causes
    }
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        for cause in &self.causes {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RegisterError {}

impl From<rusqlite::Error> for RegisterError {
    fn from(value: rusqlite::Error) -> Self {
        let code = match &value {
            rusqlite::Error::SqliteFailure(err, _) => Some(err.extended_code),
            _ => None,
        };
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(&value);
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        Self {
            message: value.to_string(),
            code,
            causes,
        }
    }
}

/// Failure of a single unit of work. Never escalates past the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError(pub String);

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UnitError {}

impl From<rusqlite::Error> for UnitError {
    fn from(value: rusqlite::Error) -> Self {
        Self(RegisterError::from(value).to_string())
    }
}

impl From<RegisterError> for UnitError {
    fn from(value: RegisterError) -> Self {
        Self(value.to_string())
    }
}
