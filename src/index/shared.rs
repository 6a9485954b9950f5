use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Persist, SqliteIndex};
use crate::index::lineage::{CloneSet, CodeFragment, Crd, Keyed, RevisionId, SourceFile};
use crate::pipeline::{RegisterError, Registerer, Retriever, UnitError};

/// The index behind one lock, shared by workers (reads) and the monitor (writes).
///
/// Callers never hold this lock while acquiring an accumulator or working-set lock.
pub struct SharedIndex {
    inner: Mutex<SqliteIndex>,
}

impl SharedIndex {
    pub fn new(index: SqliteIndex) -> Self {
        Self {
            inner: Mutex::new(index),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SqliteIndex> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> SqliteIndex {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Persist + Sync> Registerer<T> for SharedIndex {
    fn register(&self, items: &[T]) -> Result<(), RegisterError> {
        self.lock().register(items).map_err(RegisterError::from)
    }
}

fn keyed<T: Keyed>(items: Vec<T>) -> BTreeMap<i64, T> {
    items.into_iter().map(|item| (item.key(), item)).collect()
}

impl Retriever<CodeFragment> for SharedIndex {
    fn retrieve(&self, revision: RevisionId) -> Result<BTreeMap<i64, CodeFragment>, UnitError> {
        Ok(keyed(self.lock().fragments_in_revision(revision)?))
    }
}

impl Retriever<Crd> for SharedIndex {
    fn retrieve(&self, revision: RevisionId) -> Result<BTreeMap<i64, Crd>, UnitError> {
        Ok(keyed(self.lock().crds_in_revision(revision)?))
    }
}

impl Retriever<CloneSet> for SharedIndex {
    fn retrieve(&self, revision: RevisionId) -> Result<BTreeMap<i64, CloneSet>, UnitError> {
        Ok(keyed(self.lock().clone_sets_in_revision(revision)?))
    }
}

impl Retriever<SourceFile> for SharedIndex {
    fn retrieve(&self, revision: RevisionId) -> Result<BTreeMap<i64, SourceFile>, UnitError> {
        Ok(keyed(self.lock().source_files_in_revision(revision)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_fragments_are_retrieved_by_revision() {
        let shared = SharedIndex::new(SqliteIndex::open_in_memory().expect("sqlite"));
        let fragments = (1..=3)
            .map(|id| CodeFragment {
                id,
                repository_id: 1,
                revision_id: if id == 3 { 2 } else { 1 },
                file_path: "a.c".to_string(),
                crd_id: id,
                start_line: 1,
                end_line: 2,
            })
            .collect::<Vec<_>>();

        Registerer::register(&shared, &fragments).expect("register");

        let first: BTreeMap<i64, CodeFragment> = shared.retrieve(1).expect("retrieve");
        assert_eq!(first.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        let second: BTreeMap<i64, CodeFragment> = shared.retrieve(2).expect("retrieve");
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn duplicate_ids_surface_as_register_error() {
        let shared = SharedIndex::new(SqliteIndex::open_in_memory().expect("sqlite"));
        let crd = Crd {
            id: 1,
            revision_id: 1,
            block_kind: "if".to_string(),
            fingerprint: "winnow:".to_string(),
            digest: 0,
            token_count: 3,
        };
        Registerer::register(&shared, &[crd.clone()]).expect("first batch");
        let err = Registerer::register(&shared, &[crd]).expect_err("duplicate id");
        assert!(err.code().is_some());
    }
}
