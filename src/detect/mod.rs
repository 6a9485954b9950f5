//! Detection stages. Each stage runs in one transaction, clears its own
//! outputs and everything derived from them, and records a `runs` row.

pub mod clone_links;
pub mod clones;
pub mod fragment_links;
pub mod fragments;

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::genealogy::{GenealogyError, build_genealogies};
use crate::index::lineage::{ElementId, ElementKind};
use crate::index::{SharedIndex, Stage};
use crate::pipeline::{MonitorError, PipelineSettings, PoolReport, UnitFailure};

pub use clone_links::{match_clone_sets, run_clone_links};
pub use clones::{group_clones, run_clones};
pub use fragment_links::{match_fragments, run_fragment_links};
pub use fragments::run_fragments;

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub units: usize,
    pub failures: Vec<UnitFailure>,
    pub persisted: BTreeMap<&'static str, usize>,
    pub evicted: BTreeMap<&'static str, usize>,
    pub cycles: usize,
    pub failed_cycles: usize,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            units: 0,
            failures: Vec::new(),
            persisted: BTreeMap::new(),
            evicted: BTreeMap::new(),
            cycles: 0,
            failed_cycles: 0,
        }
    }

    pub fn from_pool(stage: Stage, pool: PoolReport) -> Self {
        Self {
            stage,
            units: pool.units,
            failures: pool.failures,
            persisted: pool.monitor.persisted,
            evicted: pool.monitor.evicted,
            cycles: pool.monitor.cycles,
            failed_cycles: pool.monitor.failed_cycles,
        }
    }

    pub fn persisted(&self, name: &str) -> usize {
        self.persisted.get(name).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> Value {
        let failures = self
            .failures
            .iter()
            .map(|failure| {
                json!({
                    "unit": failure.position,
                    "message": failure.message,
                })
            })
            .collect::<Vec<_>>();
        json!({
            "stage": self.stage.as_str(),
            "units": self.units,
            "persisted": self.persisted,
            "evicted_revisions": self.evicted,
            "cycles": self.cycles,
            "failed_cycles": self.failed_cycles,
            "failures": failures,
        })
    }
}

#[derive(Debug)]
pub enum StageError {
    Sqlite(rusqlite::Error),
    Monitor(MonitorError),
    Genealogy(GenealogyError),
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Monitor(err) => write!(f, "{err}"),
            Self::Genealogy(err) => write!(f, "genealogy construction failed: {err}"),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Monitor(err) => Some(err),
            Self::Genealogy(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for StageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<MonitorError> for StageError {
    fn from(value: MonitorError) -> Self {
        Self::Monitor(value)
    }
}

impl From<GenealogyError> for StageError {
    fn from(value: GenealogyError) -> Self {
        Self::Genealogy(value)
    }
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Runs `body` inside the stage transaction. Any error rolls the whole stage back.
pub(crate) fn run_stage(
    index: &SharedIndex,
    stage: Stage,
    body: impl FnOnce(&SharedIndex) -> Result<StageReport, StageError>,
) -> Result<StageReport, StageError> {
    let started_at = now_iso8601();
    info!(stage = stage.as_str(), "stage started");
    {
        let db = index.lock();
        db.begin()?;
    }

    let outcome = (|| -> Result<StageReport, StageError> {
        index.lock().clear_stage(stage)?;
        let report = body(index)?;
        index
            .lock()
            .record_run(stage.as_str(), &started_at, &now_iso8601(), &report.to_json())?;
        Ok(report)
    })();

    let db = index.lock();
    match outcome.and_then(|report| db.commit().map(|()| report).map_err(StageError::from)) {
        Ok(report) => {
            info!(
                stage = stage.as_str(),
                units = report.units,
                failures = report.failures.len(),
                "stage finished"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(stage = stage.as_str(), error = %err, "stage failed; rolling back");
            if let Err(rollback) = db.rollback() {
                warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

pub fn run_genealogies(
    index: &SharedIndex,
    kind: ElementKind,
    settings: &PipelineSettings,
) -> Result<StageReport, StageError> {
    let stage = match kind {
        ElementKind::Fragment => Stage::FragmentGenealogies,
        ElementKind::Clone => Stage::CloneGenealogies,
    };
    run_stage(index, stage, |index| {
        let built = build_genealogies(index, kind, settings)?;
        let mut report = StageReport::new(stage);
        report.units = built.elements;
        report.persisted.insert("genealogies", built.genealogies);
        report.persisted.insert("trivial_genealogies", built.trivial);
        Ok(report)
    })
}

/// Every stage in dependency order, each in its own transaction.
pub fn run_all(
    index: &SharedIndex,
    settings: &PipelineSettings,
) -> Result<Vec<StageReport>, StageError> {
    Ok(vec![
        run_fragments(index, settings)?,
        run_clones(index, settings)?,
        run_fragment_links(index, settings)?,
        run_clone_links(index, settings)?,
        run_genealogies(index, ElementKind::Fragment, settings)?,
        run_genealogies(index, ElementKind::Clone, settings)?,
    ])
}

/// A possible before/after pairing produced by a comparator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub before: ElementId,
    pub after: ElementId,
    pub score: f32,
    pub changed: bool,
}

/// Picks pairs in order, skipping any whose before or after element is
/// already taken, so every element ends up in at most one pair.
pub fn greedy_one_to_one(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|left, right| {
        left.changed
            .cmp(&right.changed)
            .then(right.score.total_cmp(&left.score))
            .then(left.before.cmp(&right.before))
            .then(left.after.cmp(&right.after))
    });
    let mut taken_before = HashSet::new();
    let mut taken_after = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            if taken_before.contains(&candidate.before) || taken_after.contains(&candidate.after) {
                return false;
            }
            taken_before.insert(candidate.before);
            taken_after.insert(candidate.after);
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteIndex;

    fn candidate(before: ElementId, after: ElementId, score: f32, changed: bool) -> Candidate {
        Candidate {
            before,
            after,
            score,
            changed,
        }
    }

    #[test]
    fn unchanged_pairs_win_over_higher_scoring_changed_pairs() {
        let picked = greedy_one_to_one(vec![
            candidate(1, 10, 0.9, true),
            candidate(1, 11, 0.6, false),
            candidate(2, 10, 0.8, true),
        ]);
        assert_eq!(
            picked,
            vec![candidate(1, 11, 0.6, false), candidate(2, 10, 0.8, true)]
        );
    }

    #[test]
    fn ties_are_broken_by_ids() {
        let picked = greedy_one_to_one(vec![
            candidate(2, 10, 0.7, true),
            candidate(1, 10, 0.7, true),
            candidate(1, 11, 0.7, true),
        ]);
        assert_eq!(
            picked,
            vec![candidate(1, 10, 0.7, true)],
            "element 2 loses 10 and element 1 already has a partner"
        );
    }

    #[test]
    fn failed_stage_rolls_back_the_clear() {
        let index = SharedIndex::new(SqliteIndex::open_in_memory().expect("sqlite"));
        index
            .lock()
            .register(&[crate::index::lineage::CloneSet {
                id: 1,
                revision_id: 1,
                members: vec![1, 2],
            }])
            .expect("seed");

        let err = run_stage(&index, Stage::Clones, |_| {
            Err(StageError::Sqlite(rusqlite::Error::InvalidQuery))
        })
        .expect_err("body fails");
        assert!(matches!(err, StageError::Sqlite(_)));

        let db = index.lock();
        assert_eq!(db.counts().expect("counts")["clone_sets"], 1);
        assert!(!db.in_transaction());
    }

    #[test]
    fn successful_stage_records_a_run() {
        let index = SharedIndex::new(SqliteIndex::open_in_memory().expect("sqlite"));
        let report = run_stage(&index, Stage::Clones, |_| Ok(StageReport::new(Stage::Clones)))
            .expect("stage");
        assert_eq!(report.stage, Stage::Clones);
        let runs = index.lock().runs().expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].stage, "clones");
    }
}
