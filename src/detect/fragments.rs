use std::collections::BTreeMap;

use tracing::info;

use super::{StageError, StageReport, run_stage};
use crate::anchor::{extract_blocks, fingerprint_text};
use crate::index::lineage::{CodeFragment, Crd, RevisionId, SourceFile};
use crate::index::{IdTable, SharedIndex, Stage};
use crate::pipeline::{
    Accumulator, AccumulationMonitor, IdAllocator, PipelineSettings, Retriever, UnitError,
    WorkPartitioner, WorkerPool,
};

/// Extracts every brace block of every source file of every revision as a
/// fragment with its content descriptor. One unit per revision.
pub fn run_fragments(
    index: &SharedIndex,
    settings: &PipelineSettings,
) -> Result<StageReport, StageError> {
    run_stage(index, Stage::Fragments, |index| {
        let (revisions, crd_ids, fragment_ids) = {
            let db = index.lock();
            (
                db.revisions()?,
                IdAllocator::seeded(db.next_id(IdTable::Crds)?),
                IdAllocator::seeded(db.next_id(IdTable::Fragments)?),
            )
        };

        let crds: Accumulator<Crd> = Accumulator::new("crds");
        let fragments: Accumulator<CodeFragment> = Accumulator::new("fragments");
        let mut monitor = AccumulationMonitor::from_settings(settings)
            .flush_to(&crds, index)
            .flush_to(&fragments, index);
        let partitioner = WorkPartitioner::new(revisions);

        let pool = WorkerPool::new(settings.workers).run(
            &partitioner,
            &mut monitor,
            |_, revision| {
                let files: BTreeMap<i64, SourceFile> = index.retrieve(revision.id)?;
                let (new_crds, new_fragments) =
                    fragments_of_revision(revision.id, files.values(), &crd_ids, &fragment_ids);
                info!(
                    revision = %revision.identifier,
                    files = files.len(),
                    fragments = new_fragments.len(),
                    "detected fragments"
                );
                crds.extend(new_crds);
                fragments.extend(new_fragments);
                Ok::<(), UnitError>(())
            },
        )?;
        Ok(StageReport::from_pool(Stage::Fragments, pool))
    })
}

fn fragments_of_revision<'f>(
    revision_id: RevisionId,
    files: impl Iterator<Item = &'f SourceFile>,
    crd_ids: &IdAllocator,
    fragment_ids: &IdAllocator,
) -> (Vec<Crd>, Vec<CodeFragment>) {
    let mut crds = Vec::new();
    let mut fragments = Vec::new();
    for file in files {
        for block in extract_blocks(&file.content) {
            let fingerprint = fingerprint_text(&block.text);
            let crd = Crd {
                id: crd_ids.next(),
                revision_id,
                block_kind: block.kind,
                digest: fingerprint.stored_digest(),
                fingerprint: fingerprint.text,
                token_count: fingerprint.token_count,
            };
            fragments.push(CodeFragment {
                id: fragment_ids.next(),
                repository_id: file.repository_id,
                revision_id,
                file_path: file.path.clone(),
                crd_id: crd.id,
                start_line: block.start_line,
                end_line: block.end_line,
            });
            crds.push(crd);
        }
    }
    (crds, fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_block_gets_its_own_crd() {
        let file = SourceFile {
            id: 1,
            repository_id: 3,
            revision_id: 9,
            path: "src/a.c".to_string(),
            content: "int f(void) {\n  if (x) {\n    y();\n  }\n}\n".to_string(),
        };
        let (crds, fragments) = fragments_of_revision(
            9,
            [&file].into_iter(),
            &IdAllocator::seeded(100),
            &IdAllocator::seeded(1),
        );

        assert_eq!(fragments.len(), 2);
        assert_eq!(crds.len(), 2);
        assert_eq!(
            fragments
                .iter()
                .map(|f| (f.id, f.crd_id, f.start_line, f.end_line))
                .collect::<Vec<_>>(),
            vec![(1, 100, 1, 5), (2, 101, 2, 4)]
        );
        assert_eq!(crds[0].block_kind, "int");
        assert_eq!(crds[1].block_kind, "if");
        assert!(fragments.iter().all(|f| f.repository_id == 3 && f.revision_id == 9));
    }
}
