use std::collections::{BTreeMap, HashMap};

use tracing::info;

use super::{Candidate, StageError, StageReport, greedy_one_to_one, run_stage};
use crate::index::lineage::{CloneSet, ElementId, ElementKind, Link};
use crate::index::{SharedIndex, Stage};
use crate::pipeline::{
    Accumulator, AccumulationMonitor, DependencyIndex, IdAllocator, PipelineSettings,
    ProcessedCommits, Retriever, UnitError, WorkPartitioner, WorkerPool, WorkingSet,
};

/// Links clone sets across each commit through the commit's fragment links.
/// One unit per commit.
pub fn run_clone_links(
    index: &SharedIndex,
    settings: &PipelineSettings,
) -> Result<StageReport, StageError> {
    run_stage(index, Stage::CloneLinks, |index| {
        let (commits, link_ids) = {
            let db = index.lock();
            (
                db.commits()?,
                IdAllocator::seeded(db.next_link_id(ElementKind::Clone)?),
            )
        };

        let dependencies = DependencyIndex::from_commits(&commits);
        let processed = ProcessedCommits::new();
        let clone_sets: WorkingSet<CloneSet> = WorkingSet::new("clone_sets");
        let links: Accumulator<Link> = Accumulator::new("clone_links");
        let mut monitor = AccumulationMonitor::from_settings(settings)
            .flush_to(&links, index)
            .evict(&clone_sets)
            .gated_by(&dependencies, &processed);
        let partitioner = WorkPartitioner::new(commits);

        let pool = WorkerPool::new(settings.workers).run(
            &partitioner,
            &mut monitor,
            |_, commit| {
                let result = (|| -> Result<usize, UnitError> {
                    let Some(before) = commit.before_revision else {
                        return Ok(0);
                    };
                    let after = commit.after_revision;
                    let before_sets = clone_sets.get_or_load(before, || index.retrieve(before))?;
                    let after_sets = clone_sets.get_or_load(after, || index.retrieve(after))?;
                    if before_sets.is_empty() || after_sets.is_empty() {
                        return Ok(0);
                    }
                    let fragment_links =
                        index
                            .lock()
                            .links_between(ElementKind::Fragment, before, after)?;

                    let matched = match_clone_sets(&before_sets, &after_sets, &fragment_links);
                    let count = matched.len();
                    links.extend(matched.into_iter().map(|candidate| Link {
                        id: link_ids.next(),
                        kind: ElementKind::Clone,
                        before_element: candidate.before,
                        after_element: candidate.after,
                        before_revision: before,
                        after_revision: after,
                        changed: candidate.changed,
                    }));
                    Ok(count)
                })();
                processed.mark(commit.id);
                let count = result?;
                info!(commit = commit.id, links = count, "linked clone sets");
                Ok(())
            },
        )?;
        Ok(StageReport::from_pool(Stage::CloneLinks, pool))
    })
}

/// Pairs clone sets whose members are connected by fragment links, preferring
/// the largest overlap. A pair is unchanged only when every before member is
/// carried into the after set by an unchanged link and the sizes agree.
pub fn match_clone_sets(
    before: &BTreeMap<i64, CloneSet>,
    after: &BTreeMap<i64, CloneSet>,
    fragment_links: &[Link],
) -> Vec<Candidate> {
    let carried: HashMap<ElementId, (ElementId, bool)> = fragment_links
        .iter()
        .map(|link| (link.before_element, (link.after_element, link.changed)))
        .collect();
    let owner: HashMap<ElementId, i64> = after
        .values()
        .flat_map(|set| set.members.iter().map(move |member| (*member, set.id)))
        .collect();

    let mut candidates = Vec::new();
    for set in before.values() {
        let mut overlap: BTreeMap<i64, (usize, usize)> = BTreeMap::new();
        for member in &set.members {
            let Some((target, changed)) = carried.get(member) else {
                continue;
            };
            let Some(after_set) = owner.get(target) else {
                continue;
            };
            let entry = overlap.entry(*after_set).or_default();
            entry.0 += 1;
            if !changed {
                entry.1 += 1;
            }
        }
        for (after_id, (shared, unchanged)) in overlap {
            let after_len = after.get(&after_id).map_or(0, |set| set.members.len());
            let changed = !(unchanged == set.members.len() && after_len == set.members.len());
            candidates.push(Candidate {
                before: set.id,
                after: after_id,
                score: shared as f32,
                changed,
            });
        }
    }
    greedy_one_to_one(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(entries: &[(i64, &[ElementId])]) -> BTreeMap<i64, CloneSet> {
        entries
            .iter()
            .map(|(id, members)| {
                (
                    *id,
                    CloneSet {
                        id: *id,
                        revision_id: 1,
                        members: members.to_vec(),
                    },
                )
            })
            .collect()
    }

    fn link(before: ElementId, after: ElementId, changed: bool) -> Link {
        Link {
            id: before,
            kind: ElementKind::Fragment,
            before_element: before,
            after_element: after,
            before_revision: 1,
            after_revision: 2,
            changed,
        }
    }

    #[test]
    fn fully_carried_clone_set_is_unchanged() {
        let before = sets(&[(1, &[10, 11])]);
        let after = sets(&[(5, &[20, 21])]);
        let links = [link(10, 20, false), link(11, 21, false)];

        let matched = match_clone_sets(&before, &after, &links);
        assert_eq!(
            matched,
            vec![Candidate {
                before: 1,
                after: 5,
                score: 2.0,
                changed: false,
            }]
        );
    }

    #[test]
    fn grown_or_edited_clone_set_is_changed() {
        let before = sets(&[(1, &[10, 11]), (2, &[12, 13])]);
        let after = sets(&[(5, &[20, 21, 22]), (6, &[23, 24])]);
        let links = [
            link(10, 20, false),
            link(11, 21, false),
            link(12, 23, true),
            link(13, 24, false),
        ];

        let pairs = match_clone_sets(&before, &after, &links)
            .into_iter()
            .map(|c| (c.before, c.after, c.changed))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![(1, 5, true), (2, 6, true)]);
    }

    #[test]
    fn largest_overlap_wins_when_sets_split() {
        let before = sets(&[(1, &[10, 11, 12])]);
        let after = sets(&[(5, &[20]), (6, &[21, 22])]);
        let links = [
            link(10, 20, true),
            link(11, 21, true),
            link(12, 22, true),
        ];

        let pairs = match_clone_sets(&before, &after, &links)
            .into_iter()
            .map(|c| (c.before, c.after))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![(1, 6)]);
    }
}
