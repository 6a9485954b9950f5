use std::collections::BTreeMap;

use tracing::info;

use super::{StageError, StageReport, run_stage};
use crate::index::lineage::{CloneSet, CodeFragment, Crd, ElementId, RepositoryId};
use crate::index::{IdTable, SharedIndex, Stage};
use crate::pipeline::{
    Accumulator, AccumulationMonitor, IdAllocator, PipelineSettings, Retriever, UnitError,
    WorkPartitioner, WorkerPool,
};

/// Groups the fragments of each revision into clone sets. One unit per revision.
pub fn run_clones(
    index: &SharedIndex,
    settings: &PipelineSettings,
) -> Result<StageReport, StageError> {
    run_stage(index, Stage::Clones, |index| {
        let (revisions, clone_ids) = {
            let db = index.lock();
            (
                db.revisions()?,
                IdAllocator::seeded(db.next_id(IdTable::CloneSets)?),
            )
        };

        let clone_sets: Accumulator<CloneSet> = Accumulator::new("clone_sets");
        let mut monitor =
            AccumulationMonitor::from_settings(settings).flush_to(&clone_sets, index);
        let partitioner = WorkPartitioner::new(revisions);

        let pool = WorkerPool::new(settings.workers).run(
            &partitioner,
            &mut monitor,
            |_, revision| {
                let fragments: BTreeMap<i64, CodeFragment> = index.retrieve(revision.id)?;
                let crds: BTreeMap<i64, Crd> = index.retrieve(revision.id)?;
                let groups = group_clones(
                    &fragments,
                    &crds,
                    settings.clone_size_threshold,
                    settings.cross_project,
                );
                info!(revision = %revision.identifier, clone_sets = groups.len(), "detected clones");
                clone_sets.extend(groups.into_iter().map(|members| CloneSet {
                    id: clone_ids.next(),
                    revision_id: revision.id,
                    members,
                }));
                Ok::<(), UnitError>(())
            },
        )?;
        Ok(StageReport::from_pool(Stage::Clones, pool))
    })
}

/// Fragments whose crd has at least `size_threshold` tokens are grouped by
/// crd digest, and by repository unless `cross_project`. Groups of two or
/// more members are returned, members ascending, groups by their first member.
pub fn group_clones(
    fragments: &BTreeMap<i64, CodeFragment>,
    crds: &BTreeMap<i64, Crd>,
    size_threshold: u32,
    cross_project: bool,
) -> Vec<Vec<ElementId>> {
    let mut groups: BTreeMap<(i64, Option<RepositoryId>), Vec<ElementId>> = BTreeMap::new();
    for fragment in fragments.values() {
        let Some(crd) = crds.get(&fragment.crd_id) else {
            continue;
        };
        if crd.token_count < size_threshold {
            continue;
        }
        let scope = (!cross_project).then_some(fragment.repository_id);
        groups
            .entry((crd.digest, scope))
            .or_default()
            .push(fragment.id);
    }

    let mut out = groups
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|mut members| {
            members.sort_unstable();
            members
        })
        .collect::<Vec<_>>();
    out.sort();
    out
}
