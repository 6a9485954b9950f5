use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::index::lineage::Keyed;
use crate::pipeline::accumulator::{Evictable, FlushTarget, Flushable};
use crate::pipeline::{
    Accumulator, CompletionLatch, DependencyIndex, PipelineSettings, ProcessedCommits,
    RegisterError, Registerer, WorkingSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub persisted: BTreeMap<&'static str, usize>,
    pub evicted: BTreeMap<&'static str, usize>,
    pub cycles: usize,
    pub failed_cycles: usize,
    pub flushes: usize,
}

impl MonitorReport {
    pub fn persisted(&self, name: &str) -> usize {
        self.persisted.get(name).copied().unwrap_or(0)
    }

    pub fn evicted(&self, name: &str) -> usize {
        self.evicted.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The final unconditional flush failed; the caller must roll back.
    Drain {
        map: &'static str,
        source: RegisterError,
    },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drain { map, source } => {
                write!(f, "final flush of `{map}` failed: {source}")
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Drain { source, .. } => Some(source),
        }
    }
}

/// Polls the shared accumulators, persists them in batches and releases
/// per-revision working sets nobody can still read.
///
/// Accumulators are locked in registration order, which is the global lock
/// order: register a map before any map whose records reference it.
pub struct AccumulationMonitor<'a> {
    flush_threshold: usize,
    poll_interval: Duration,
    targets: Vec<Box<dyn Flushable + 'a>>,
    working_sets: Vec<&'a dyn Evictable>,
    gate: Option<(&'a DependencyIndex, &'a ProcessedCommits)>,
    state: MonitorState,
}

impl<'a> AccumulationMonitor<'a> {
    pub fn new(flush_threshold: usize, poll_interval: Duration) -> Self {
        Self {
            flush_threshold,
            poll_interval,
            targets: Vec::new(),
            working_sets: Vec::new(),
            gate: None,
            state: MonitorState::Running,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.flush_threshold, settings.poll_interval)
    }

    pub fn flush_to<T>(
        mut self,
        accumulator: &'a Accumulator<T>,
        registerer: &'a dyn Registerer<T>,
    ) -> Self
    where
        T: Keyed + Clone + Send + 'a,
    {
        self.targets.push(Box::new(FlushTarget {
            accumulator,
            registerer,
        }));
        self
    }

    pub fn evict<T>(mut self, working_set: &'a WorkingSet<T>) -> Self
    where
        T: Send + Sync + 'a,
    {
        self.working_sets.push(working_set);
        self
    }

    /// Working sets are only evicted once a dependency gate is installed.
    pub fn gated_by(
        mut self,
        dependencies: &'a DependencyIndex,
        processed: &'a ProcessedCommits,
    ) -> Self {
        self.gate = Some((dependencies, processed));
        self
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn run(&mut self, latch: &CompletionLatch) -> Result<MonitorReport, MonitorError> {
        let mut report = MonitorReport::default();
        self.state = MonitorState::Running;

        while self.state == MonitorState::Running {
            if latch.wait_timeout(self.poll_interval) {
                self.state = MonitorState::Draining;
                continue;
            }
            self.tick(&mut report);
        }

        info!("all workers have finished; flushing remaining records");
        self.drain(&mut report)?;
        self.state = MonitorState::Stopped;

        for (name, count) in &report.persisted {
            info!(map = name, count, "persisted");
        }
        Ok(report)
    }

    /// One polling cycle: threshold-gated flush, then eviction. Failures are
    /// logged and left for the next cycle.
    pub(crate) fn tick(&self, report: &mut MonitorReport) {
        report.cycles += 1;
        if let Err((map, err)) = self.flush_all(report, false) {
            report.failed_cycles += 1;
            warn!(
                map,
                error = %err,
                code = err.code(),
                "flush failed; records stay in memory until the next cycle"
            );
            for cause in err.causes() {
                warn!(map, cause = %cause, "flush failure cause");
            }
        }
        self.evict_released(report);
    }

    fn drain(&self, report: &mut MonitorReport) -> Result<(), MonitorError> {
        self.flush_all(report, true)
            .map_err(|(map, source)| MonitorError::Drain { map, source })
    }

    fn flush_all(
        &self,
        report: &mut MonitorReport,
        force: bool,
    ) -> Result<(), (&'static str, RegisterError)> {
        let mut locked = self
            .targets
            .iter()
            .map(|target| (target.name(), target.lock()))
            .collect::<Vec<_>>();

        let over_threshold = locked
            .iter()
            .any(|(_, entries)| entries.len() >= self.flush_threshold);
        if !force && !over_threshold {
            return Ok(());
        }

        for (name, entries) in locked.iter_mut() {
            let count = entries.flush().map_err(|err| (*name, err))?;
            if count > 0 {
                report.flushes += 1;
                *report.persisted.entry(*name).or_default() += count;
                info!(map = *name, count, "registered batch");
            }
        }
        Ok(())
    }

    fn evict_released(&self, report: &mut MonitorReport) {
        let Some((dependencies, processed)) = self.gate else {
            return;
        };
        for working_set in &self.working_sets {
            let evicted = working_set.evict(dependencies, processed);
            if !evicted.is_empty() {
                debug!(set = working_set.name(), revisions = ?evicted, "evicted working set");
                *report.evicted.entry(working_set.name()).or_default() += evicted.len();
            }
        }
    }
}
