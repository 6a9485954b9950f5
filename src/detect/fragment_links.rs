use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{Candidate, StageError, StageReport, greedy_one_to_one, run_stage};
use crate::anchor::fingerprint_similarity;
use crate::index::lineage::{CodeFragment, Commit, Crd, ElementKind, Link};
use crate::index::{SharedIndex, Stage};
use crate::pipeline::{
    Accumulator, AccumulationMonitor, DependencyIndex, IdAllocator, PipelineSettings,
    ProcessedCommits, Retriever, UnitError, WorkPartitioner, WorkerPool, WorkingSet,
};

/// Links each fragment of a commit's before revision to at most one fragment
/// of its after revision. One unit per commit.
pub fn run_fragment_links(
    index: &SharedIndex,
    settings: &PipelineSettings,
) -> Result<StageReport, StageError> {
    run_stage(index, Stage::FragmentLinks, |index| {
        let (commits, link_ids) = {
            let db = index.lock();
            (
                db.commits()?,
                IdAllocator::seeded(db.next_link_id(ElementKind::Fragment)?),
            )
        };

        let dependencies = DependencyIndex::from_commits(&commits);
        let processed = ProcessedCommits::new();
        let fragment_sets: WorkingSet<CodeFragment> = WorkingSet::new("fragments");
        let crd_sets: WorkingSet<Crd> = WorkingSet::new("crds");
        let links: Accumulator<Link> = Accumulator::new("fragment_links");
        let mut monitor = AccumulationMonitor::from_settings(settings)
            .flush_to(&links, index)
            .evict(&fragment_sets)
            .evict(&crd_sets)
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
                    let before_fragments =
                        fragment_sets.get_or_load(before, || index.retrieve(before))?;
                    let after_fragments =
                        fragment_sets.get_or_load(after, || index.retrieve(after))?;
                    let before_crds = crd_sets.get_or_load(before, || index.retrieve(before))?;
                    let after_crds = crd_sets.get_or_load(after, || index.retrieve(after))?;

                    let matched = match_fragments(
                        &FragmentSide {
                            fragments: &before_fragments,
                            crds: &before_crds,
                        },
                        &FragmentSide {
                            fragments: &after_fragments,
                            crds: &after_crds,
                        },
                        settings.link_similarity,
                    );
                    let count = matched.len();
                    links.extend(
                        matched
                            .into_iter()
                            .map(|candidate| to_link(&link_ids, commit, before, candidate)),
                    );
                    Ok(count)
                })();
                // a failed commit is still done as far as eviction is concerned
                processed.mark(commit.id);
                let count = result?;
                info!(commit = commit.id, links = count, "linked fragments");
                Ok(())
            },
        )?;
        debug!(
            fragment_loads = fragment_sets.load_count(),
            crd_loads = crd_sets.load_count(),
            "working set loads"
        );
        Ok(StageReport::from_pool(Stage::FragmentLinks, pool))
    })
}

fn to_link(ids: &IdAllocator, commit: &Commit, before: i64, candidate: Candidate) -> Link {
    Link {
        id: ids.next(),
        kind: ElementKind::Fragment,
        before_element: candidate.before,
        after_element: candidate.after,
        before_revision: before,
        after_revision: commit.after_revision,
        changed: candidate.changed,
    }
}

/// The fragments of one revision together with their crds.
pub struct FragmentSide<'a> {
    pub fragments: &'a BTreeMap<i64, CodeFragment>,
    pub crds: &'a BTreeMap<i64, Crd>,
}

/// Pairs fragments of the same file and block kind. Equal digests link
/// unchanged; otherwise a similarity of at least `min_similarity` links changed.
pub fn match_fragments(
    before: &FragmentSide<'_>,
    after: &FragmentSide<'_>,
    min_similarity: f32,
) -> Vec<Candidate> {
    let mut after_by_path: BTreeMap<(i64, &str), Vec<(&CodeFragment, &Crd)>> = BTreeMap::new();
    for fragment in after.fragments.values() {
        if let Some(crd) = after.crds.get(&fragment.crd_id) {
            after_by_path
                .entry((fragment.repository_id, fragment.file_path.as_str()))
                .or_default()
                .push((fragment, crd));
        }
    }

    let mut candidates = Vec::new();
    for fragment in before.fragments.values() {
        let Some(crd) = before.crds.get(&fragment.crd_id) else {
            continue;
        };
        let Some(peers) =
            after_by_path.get(&(fragment.repository_id, fragment.file_path.as_str()))
        else {
            continue;
        };
        for (peer, peer_crd) in peers {
            if peer_crd.block_kind != crd.block_kind {
                continue;
            }
            if peer_crd.digest == crd.digest {
                candidates.push(Candidate {
                    before: fragment.id,
                    after: peer.id,
                    score: 1.0,
                    changed: false,
                });
                continue;
            }
            let Some(score) = fingerprint_similarity(&crd.fingerprint, &peer_crd.fingerprint)
            else {
                continue;
            };
            if score >= min_similarity {
                candidates.push(Candidate {
                    before: fragment.id,
                    after: peer.id,
                    score,
                    changed: true,
                });
            }
        }
    }
    greedy_one_to_one(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::fingerprint_text;

    fn side(entries: &[(i64, &str, &str)]) -> (BTreeMap<i64, CodeFragment>, BTreeMap<i64, Crd>) {
        let mut fragments = BTreeMap::new();
        let mut crds = BTreeMap::new();
        for (id, path, text) in entries {
            let fingerprint = fingerprint_text(text);
            crds.insert(
                *id,
                Crd {
                    id: *id,
                    revision_id: 1,
                    block_kind: "for".to_string(),
                    digest: fingerprint.stored_digest(),
                    fingerprint: fingerprint.text,
                    token_count: fingerprint.token_count,
                },
            );
            fragments.insert(
                *id,
                CodeFragment {
                    id: *id,
                    repository_id: 1,
                    revision_id: 1,
                    file_path: path.to_string(),
                    crd_id: *id,
                    start_line: 1,
                    end_line: 3,
                },
            );
        }
        (fragments, crds)
    }

    const LOOP: &str = "for (i = 0; i < n; i++) { total += values[i]; count++; }";
    const LOOP_EDITED: &str = "for (i = 0; i < n; i++) { total += values[i]; count += 2; }";
    const OTHER: &str = "for (j = 9; j > 0; j--) { printf(\"%d\", j); }";

    #[test]
    fn identical_and_similar_fragments_link_once() {
        let (before_fragments, before_crds) =
            side(&[(1, "a.c", LOOP), (2, "a.c", LOOP), (3, "b.c", LOOP)]);
        let (after_fragments, after_crds) =
            side(&[(11, "a.c", LOOP), (12, "a.c", LOOP_EDITED), (13, "c.c", LOOP)]);

        let matched = match_fragments(
            &FragmentSide {
                fragments: &before_fragments,
                crds: &before_crds,
            },
            &FragmentSide {
                fragments: &after_fragments,
                crds: &after_crds,
            },
            0.3,
        );
        let pairs = matched
            .iter()
            .map(|c| (c.before, c.after, c.changed))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![(1, 11, false), (2, 12, true)]);
    }

    #[test]
    fn dissimilar_fragments_stay_unlinked() {
        let (before_fragments, before_crds) = side(&[(1, "a.c", LOOP)]);
        let (after_fragments, after_crds) = side(&[(11, "a.c", OTHER)]);
        let matched = match_fragments(
            &FragmentSide {
                fragments: &before_fragments,
                crds: &before_crds,
            },
            &FragmentSide {
                fragments: &after_fragments,
                crds: &after_crds,
            },
            0.5,
        );
        assert!(matched.is_empty());
    }
}
