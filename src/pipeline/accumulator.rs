use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::index::lineage::{Commit, CommitId, Keyed, RevisionId};
use crate::pipeline::{RegisterError, Registerer};

/// Shared map of detected records awaiting persistence, keyed by record id.
///
/// Ids are globally unique, so inserting is a set union: two workers can never
/// race on the same key.
#[derive(Debug)]
pub struct Accumulator<T> {
    name: &'static str,
    entries: Mutex<BTreeMap<i64, T>>,
}

impl<T: Keyed> Accumulator<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn insert(&self, item: T) {
        self.lock().insert(item.key(), item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let mut entries = self.lock();
        for item in items {
            entries.insert(item.key(), item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An accumulator paired with the registerer its contents are flushed to.
pub(crate) trait Flushable: Sync {
    fn name(&self) -> &'static str;
    fn lock(&self) -> Box<dyn LockedFlush + '_>;
}

/// A flushable map held under its lock for the duration of one flush.
pub(crate) trait LockedFlush {
    fn len(&self) -> usize;
    /// Persists a snapshot of the current entries, then removes exactly the
    /// snapshotted ids. On failure nothing is removed.
    fn flush(&mut self) -> Result<usize, RegisterError>;
}

pub(crate) struct FlushTarget<'a, T> {
    pub(crate) accumulator: &'a Accumulator<T>,
    pub(crate) registerer: &'a dyn Registerer<T>,
}

struct LockedTarget<'a, T> {
    entries: MutexGuard<'a, BTreeMap<i64, T>>,
    registerer: &'a dyn Registerer<T>,
}

impl<T: Keyed + Clone + Send> Flushable for FlushTarget<'_, T> {
    fn name(&self) -> &'static str {
        self.accumulator.name
    }

    fn lock(&self) -> Box<dyn LockedFlush + '_> {
        Box::new(LockedTarget {
            entries: self.accumulator.lock(),
            registerer: self.registerer,
        })
    }
}

impl<T: Keyed + Clone> LockedFlush for LockedTarget<'_, T> {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn flush(&mut self) -> Result<usize, RegisterError> {
        let snapshot = self.entries.values().cloned().collect::<Vec<_>>();
        self.registerer.register(&snapshot)?;
        for item in &snapshot {
            self.entries.remove(&item.key());
        }
        Ok(snapshot.len())
    }
}

/// Revision id -> commits whose processing needs that revision resident.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyIndex {
    related: HashMap<RevisionId, BTreeSet<CommitId>>,
}

impl DependencyIndex {
    pub fn from_commits(commits: &[Commit]) -> Self {
        let mut related: HashMap<RevisionId, BTreeSet<CommitId>> = HashMap::new();
        for commit in commits {
            for revision in commit.revisions() {
                related.entry(revision).or_default().insert(commit.id);
            }
        }
        Self { related }
    }

    pub fn related(&self, revision: RevisionId) -> Option<&BTreeSet<CommitId>> {
        self.related.get(&revision)
    }

    /// A revision no commit depends on is releasable immediately.
    pub fn is_releasable(&self, revision: RevisionId, processed: &HashSet<CommitId>) -> bool {
        self.related
            .get(&revision)
            .is_none_or(|commits| commits.iter().all(|commit| processed.contains(commit)))
    }
}

/// Commits whose workers have returned, successfully or not. Only grows.
#[derive(Debug, Default)]
pub struct ProcessedCommits {
    commits: RwLock<HashSet<CommitId>>,
}

impl ProcessedCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, commit: CommitId) {
        self.commits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(commit);
    }

    pub fn contains(&self, commit: CommitId) -> bool {
        self.commits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&commit)
    }

    pub fn len(&self) -> usize {
        self.commits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_set<R>(&self, f: impl FnOnce(&HashSet<CommitId>) -> R) -> R {
        let commits = self.commits.read().unwrap_or_else(PoisonError::into_inner);
        f(&commits)
    }
}

/// Per-revision cache of input records (fragments, crds, clone sets) read by
/// link workers.
#[derive(Debug)]
pub struct WorkingSet<T> {
    name: &'static str,
    entries: Mutex<HashMap<RevisionId, Arc<BTreeMap<i64, T>>>>,
    loads: AtomicUsize,
}

impl<T> WorkingSet<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the resident records of `revision`, loading them outside the
    /// lock on a miss. Two concurrent misses may both load; the first insert wins.
    pub fn get_or_load<E>(
        &self,
        revision: RevisionId,
        load: impl FnOnce() -> Result<BTreeMap<i64, T>, E>,
    ) -> Result<Arc<BTreeMap<i64, T>>, E> {
        if let Some(resident) = self.lock().get(&revision) {
            return Ok(Arc::clone(resident));
        }
        let loaded = Arc::new(load()?);
        self.loads.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.lock();
        Ok(Arc::clone(entries.entry(revision).or_insert(loaded)))
    }

    pub fn contains(&self, revision: RevisionId) -> bool {
        self.lock().contains_key(&revision)
    }

    pub fn resident_revisions(&self) -> Vec<RevisionId> {
        let mut revisions = self.lock().keys().copied().collect::<Vec<_>>();
        revisions.sort_unstable();
        revisions
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Drops every resident revision whose dependent commits have all finished.
    pub fn evict_releasable(
        &self,
        dependencies: &DependencyIndex,
        processed: &ProcessedCommits,
    ) -> Vec<RevisionId> {
        let mut entries = self.lock();
        let mut evicted = processed.with_set(|done| {
            entries
                .keys()
                .copied()
                .filter(|revision| dependencies.is_releasable(*revision, done))
                .collect::<Vec<_>>()
        });
        for revision in &evicted {
            entries.remove(revision);
        }
        evicted.sort_unstable();
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RevisionId, Arc<BTreeMap<i64, T>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A working set the monitor garbage-collects each cycle.
pub(crate) trait Evictable: Sync {
    fn name(&self) -> &'static str;
    fn evict(
        &self,
        dependencies: &DependencyIndex,
        processed: &ProcessedCommits,
    ) -> Vec<RevisionId>;
}

impl<T: Send + Sync> Evictable for WorkingSet<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn evict(
        &self,
        dependencies: &DependencyIndex,
        processed: &ProcessedCommits,
    ) -> Vec<RevisionId> {
        self.evict_releasable(dependencies, processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(i64);

    impl Keyed for Item {
        fn key(&self) -> i64 {
            self.0
        }
    }

    fn commit(id: CommitId, before: Option<RevisionId>, after: RevisionId) -> Commit {
        Commit {
            id,
            before_revision: before,
            after_revision: after,
        }
    }

    #[test]
    fn inserting_the_same_id_twice_keeps_one_entry() {
        let acc = Accumulator::new("items");
        acc.insert(Item(1));
        acc.extend([Item(1), Item(2)]);
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.name(), "items");
    }

    #[test]
    fn dependency_index_collects_before_and_after_revisions() {
        let deps = DependencyIndex::from_commits(&[
            commit(1, None, 10),
            commit(2, Some(10), 11),
            commit(3, Some(11), 12),
        ]);
        assert_eq!(deps.related(10).cloned(), Some(BTreeSet::from([1, 2])));
        assert_eq!(deps.related(12).cloned(), Some(BTreeSet::from([3])));
        assert!(deps.related(99).is_none());
    }

    #[test]
    fn revision_is_evicted_only_after_every_dependent_commit_finished() {
        let deps = DependencyIndex::from_commits(&[commit(1, None, 10), commit(2, Some(10), 11)]);
        let processed = ProcessedCommits::new();
        let set: WorkingSet<Item> = WorkingSet::new("fragments");
        for revision in [10, 11] {
            set.get_or_load(revision, || Ok::<_, ()>(BTreeMap::from([(revision, Item(revision))])))
                .expect("load");
        }

        assert!(set.evict_releasable(&deps, &processed).is_empty());

        processed.mark(1);
        assert!(
            set.evict_releasable(&deps, &processed).is_empty(),
            "revision 10 is still needed by commit 2"
        );

        processed.mark(2);
        assert_eq!(set.evict_releasable(&deps, &processed), vec![10, 11]);
        assert!(set.resident_revisions().is_empty());
    }

    #[test]
    fn revision_without_dependents_is_releasable() {
        let deps = DependencyIndex::default();
        let processed = ProcessedCommits::new();
        let set: WorkingSet<Item> = WorkingSet::new("orphans");
        set.get_or_load(5, || Ok::<_, ()>(BTreeMap::new())).expect("load");
        assert_eq!(set.evict_releasable(&deps, &processed), vec![5]);
    }

    #[test]
    fn resident_revision_is_not_loaded_again() {
        let set: WorkingSet<Item> = WorkingSet::new("crds");
        let first = set
            .get_or_load(3, || Ok::<_, ()>(BTreeMap::from([(1, Item(1))])))
            .expect("first load");
        let second = set
            .get_or_load(3, || Err("loader must not run on a hit"))
            .expect("cache hit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(set.load_count(), 1);
        assert!(set.contains(3));
    }

    #[test]
    fn failed_load_leaves_revision_absent() {
        let set: WorkingSet<Item> = WorkingSet::new("crds");
        let err = set.get_or_load(3, || Err::<BTreeMap<i64, Item>, _>("db down"));
        assert_eq!(err.err(), Some("db down"));
        assert!(!set.contains(3));
    }
}
