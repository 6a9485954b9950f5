//! Loads a version history into the index: repositories, revisions, one
//! commit per revision and the full source snapshot of every revision.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::index::lineage::{Commit, Repository, Revision, SourceFile};
use crate::index::{IdTable, SqliteIndex};
use crate::pipeline::IdAllocator;
use crate::vcs::{ChangeCode, GitRepository, Language, VcsCommit, VcsError, detect_changed_files};

pub const DEFAULT_REPOSITORY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Name of the imported repository, or of the container of a combined history.
    pub repository: String,
    /// The first path component of every file names its repository.
    pub combined: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.to_string(),
            combined: false,
        }
    }
}

/// (repository name, repository-relative path)
pub type FileKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub identifier: String,
    pub files: BTreeMap<FileKey, String>,
    pub changes: BTreeMap<String, ChangeCode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevisionChanges {
    pub identifier: String,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub repository: String,
    pub repositories: usize,
    pub revisions: usize,
    pub commits: usize,
    pub source_files: usize,
    pub changes: Vec<RevisionChanges>,
}

#[derive(Debug)]
pub enum ImportError {
    Io { path: PathBuf, source: std::io::Error },
    Walk(walkdir::Error),
    Vcs(VcsError),
    Sqlite(rusqlite::Error),
    Empty(PathBuf),
    AlreadyImported(String),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Walk(err) => write!(f, "{err}"),
            Self::Vcs(err) => write!(f, "{err}"),
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Empty(path) => write!(f, "no revisions found under {}", path.display()),
            Self::AlreadyImported(name) => {
                write!(f, "repository `{name}` has already been imported")
            }
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Walk(err) => Some(err),
            Self::Vcs(err) => Some(err),
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<walkdir::Error> for ImportError {
    fn from(value: walkdir::Error) -> Self {
        Self::Walk(value)
    }
}

impl From<VcsError> for ImportError {
    fn from(value: VcsError) -> Self {
        Self::Vcs(value)
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ImportError + '_ {
    move |source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every immediate subdirectory of `root`, in name order, is one revision.
pub fn read_snapshot_history(
    root: &Path,
    options: &ImportOptions,
    language: &Language,
) -> Result<History, ImportError> {
    let mut revision_dirs = Vec::new();
    for entry in fs::read_dir(root).map_err(io_error(root))? {
        let entry = entry.map_err(io_error(root))?;
        if entry.path().is_dir() {
            revision_dirs.push(entry.path());
        }
    }
    revision_dirs.sort();
    if revision_dirs.is_empty() {
        return Err(ImportError::Empty(root.to_path_buf()));
    }

    let mut history = History::default();
    let mut previous: BTreeMap<FileKey, String> = BTreeMap::new();
    for dir in revision_dirs {
        let identifier = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let files = read_snapshot_files(&dir, options, language)?;
        let changes = diff_snapshots(&previous, &files, options.combined);
        info!(revision = %identifier, files = files.len(), changes = changes.len(), "read snapshot");
        previous = files.clone();
        history.snapshots.push(Snapshot {
            identifier,
            files,
            changes,
        });
    }
    Ok(history)
}

fn read_snapshot_files(
    dir: &Path,
    options: &ImportOptions,
    language: &Language,
) -> Result<BTreeMap<FileKey, String>, ImportError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        let (repository, path) = if options.combined {
            match relative.split_first() {
                Some((repository, rest)) if !rest.is_empty() => {
                    (repository.clone(), rest.join("/"))
                }
                _ => continue,
            }
        } else {
            (options.repository.clone(), relative.join("/"))
        };
        if !language.is_target(&path) {
            continue;
        }
        let bytes = fs::read(entry.path()).map_err(io_error(entry.path()))?;
        match String::from_utf8(bytes) {
            Ok(content) => {
                files.insert((repository, path), content);
            }
            Err(_) => warn!(path = %entry.path().display(), "skipping non-UTF-8 source file"),
        }
    }
    Ok(files)
}

fn diff_snapshots(
    before: &BTreeMap<FileKey, String>,
    after: &BTreeMap<FileKey, String>,
    combined: bool,
) -> BTreeMap<String, ChangeCode> {
    let display = |key: &FileKey| {
        if combined {
            format!("{}/{}", key.0, key.1)
        } else {
            key.1.clone()
        }
    };

    let mut changes = BTreeMap::new();
    for (key, content) in after {
        match before.get(key) {
            None => {
                changes.insert(display(key), ChangeCode::Added);
            }
            Some(old) if sha256_hex(old) != sha256_hex(content) => {
                changes.insert(display(key), ChangeCode::Modified);
            }
            Some(_) => {}
        }
    }
    for key in before.keys().filter(|key| !after.contains_key(*key)) {
        changes.insert(display(key), ChangeCode::Deleted);
    }
    changes
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Replays the first-parent history of HEAD, one revision per commit.
pub fn read_git_history(
    repo: &GitRepository,
    options: &ImportOptions,
    language: &Language,
) -> Result<History, ImportError> {
    let revisions = repo.first_parent_history()?;
    if revisions.is_empty() {
        return Err(ImportError::Empty(repo.root().to_path_buf()));
    }

    let mut history = History::default();
    let mut files: BTreeMap<FileKey, String> = BTreeMap::new();
    let mut before: Option<String> = None;
    for sha in revisions {
        let commit = VcsCommit {
            before: before.clone(),
            after: sha.clone(),
        };
        let changes = detect_changed_files(repo, &commit, language)?;
        for (path, code) in &changes {
            let key = (options.repository.clone(), path.clone());
            match code {
                ChangeCode::Deleted => {
                    files.remove(&key);
                }
                ChangeCode::Added | ChangeCode::Modified => match repo.file_at(&sha, path) {
                    Ok(content) => {
                        files.insert(key, content);
                    }
                    Err(VcsError::Utf8 { .. }) => {
                        warn!(revision = %sha, path = %path, "skipping non-UTF-8 source file");
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }
        info!(revision = %sha, files = files.len(), changes = changes.len(), "replayed commit");
        history.snapshots.push(Snapshot {
            identifier: sha.clone(),
            files: files.clone(),
            changes,
        });
        before = Some(sha);
    }
    Ok(history)
}

/// Writes `history` in one transaction. A repository can only be imported once.
pub fn register_history(
    index: &SqliteIndex,
    options: &ImportOptions,
    history: &History,
) -> Result<ImportReport, ImportError> {
    index.begin()?;
    match register_history_inner(index, options, history) {
        Ok(report) => {
            index.commit()?;
            Ok(report)
        }
        Err(err) => {
            if let Err(rollback) = index.rollback() {
                warn!(error = %rollback, "rollback after failed import also failed");
            }
            Err(err)
        }
    }
}

fn register_history_inner(
    index: &SqliteIndex,
    options: &ImportOptions,
    history: &History,
) -> Result<ImportReport, ImportError> {
    if index.repository_by_name(&options.repository)?.is_some() {
        return Err(ImportError::AlreadyImported(options.repository.clone()));
    }

    let repository_ids = IdAllocator::seeded(index.next_id(IdTable::Repositories)?);
    let revision_ids = IdAllocator::seeded(index.next_id(IdTable::Revisions)?);
    let commit_ids = IdAllocator::seeded(index.next_id(IdTable::Commits)?);
    let file_ids = IdAllocator::seeded(index.next_id(IdTable::SourceFiles)?);

    let mut repositories: BTreeMap<String, i64> = BTreeMap::new();
    let container = Repository {
        id: repository_ids.next(),
        name: options.repository.clone(),
    };
    repositories.insert(container.name.clone(), container.id);
    let mut new_repositories = vec![container.clone()];
    for snapshot in &history.snapshots {
        for (repository, _) in snapshot.files.keys() {
            if !repositories.contains_key(repository) {
                if index.repository_by_name(repository)?.is_some() {
                    return Err(ImportError::AlreadyImported(repository.clone()));
                }
                let created = Repository {
                    id: repository_ids.next(),
                    name: repository.clone(),
                };
                repositories.insert(created.name.clone(), created.id);
                new_repositories.push(created);
            }
        }
    }
    index.register(&new_repositories)?;

    let mut report = ImportReport {
        repository: options.repository.clone(),
        repositories: new_repositories.len(),
        ..ImportReport::default()
    };
    let mut before_revision = None;
    for snapshot in &history.snapshots {
        let revision = Revision {
            id: revision_ids.next(),
            repository_id: container.id,
            identifier: snapshot.identifier.clone(),
        };
        let commit = Commit {
            id: commit_ids.next(),
            before_revision,
            after_revision: revision.id,
        };
        let files = snapshot
            .files
            .iter()
            .map(|((repository, path), content)| SourceFile {
                id: file_ids.next(),
                repository_id: repositories
                    .get(repository)
                    .copied()
                    .unwrap_or(container.id),
                revision_id: revision.id,
                path: path.clone(),
                content: content.clone(),
            })
            .collect::<Vec<_>>();

        index.register(std::slice::from_ref(&revision))?;
        index.register(&[commit])?;
        index.register(&files)?;

        report.revisions += 1;
        report.commits += 1;
        report.source_files += files.len();
        report.changes.push(summarize_changes(snapshot));
        before_revision = Some(revision.id);
    }

    info!(
        repository = %options.repository,
        revisions = report.revisions,
        source_files = report.source_files,
        "imported history"
    );
    Ok(report)
}

fn summarize_changes(snapshot: &Snapshot) -> RevisionChanges {
    let count = |wanted: ChangeCode| {
        snapshot
            .changes
            .values()
            .filter(|code| **code == wanted)
            .count()
    };
    RevisionChanges {
        identifier: snapshot.identifier.clone(),
        added: count(ChangeCode::Added),
        modified: count(ChangeCode::Modified),
        deleted: count(ChangeCode::Deleted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    fn c_language() -> Language {
        Language::from_globs(&["*.c"]).expect("globs")
    }

    #[test]
    fn consecutive_snapshots_are_diffed_into_change_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "r1/a.c", "int a;");
        write(dir.path(), "r1/b.c", "int b;");
        write(dir.path(), "r1/notes.txt", "ignored");
        write(dir.path(), "r2/a.c", "int a = 1;");
        write(dir.path(), "r2/src/c.c", "int c;");

        let history = read_snapshot_history(dir.path(), &ImportOptions::default(), &c_language())
            .expect("history");
        assert_eq!(history.snapshots.len(), 2);
        assert_eq!(
            history.snapshots[0].changes,
            BTreeMap::from([
                ("a.c".to_string(), ChangeCode::Added),
                ("b.c".to_string(), ChangeCode::Added),
            ])
        );
        assert_eq!(
            history.snapshots[1].changes,
            BTreeMap::from([
                ("a.c".to_string(), ChangeCode::Modified),
                ("b.c".to_string(), ChangeCode::Deleted),
                ("src/c.c".to_string(), ChangeCode::Added),
            ])
        );
    }

    #[test]
    fn combined_snapshots_split_files_by_repository() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "r1/alpha/x.c", "int x;");
        write(dir.path(), "r1/beta/y.c", "int y;");
        write(dir.path(), "r1/stray.c", "int stray;");
        let options = ImportOptions {
            repository: "suite".to_string(),
            combined: true,
        };

        let history = read_snapshot_history(dir.path(), &options, &c_language()).expect("history");
        let keys = history.snapshots[0].files.keys().cloned().collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                ("alpha".to_string(), "x.c".to_string()),
                ("beta".to_string(), "y.c".to_string()),
            ]
        );

        let index = SqliteIndex::open_in_memory().expect("sqlite");
        let report = register_history(&index, &options, &history).expect("register");
        assert_eq!(report.repositories, 3);
        let counts = index.counts().expect("counts");
        assert_eq!(counts["repositories"], 3);
        assert_eq!(counts["source_files"], 2);
    }

    #[test]
    fn registering_links_commits_to_the_previous_revision() {
        let dir = tempfile::tempdir().expect("tempdir");
        for revision in ["r1", "r2", "r3"] {
            write(dir.path(), &format!("{revision}/main.c"), revision);
        }
        let history = read_snapshot_history(dir.path(), &ImportOptions::default(), &c_language())
            .expect("history");
        let index = SqliteIndex::open_in_memory().expect("sqlite");
        let report =
            register_history(&index, &ImportOptions::default(), &history).expect("register");
        assert_eq!((report.revisions, report.commits, report.source_files), (3, 3, 3));

        let commits = index.commits().expect("commits");
        assert_eq!(commits[0].before_revision, None);
        assert_eq!(commits[1].before_revision, Some(commits[0].after_revision));
        assert_eq!(commits[2].before_revision, Some(commits[1].after_revision));
        let files = index
            .source_files_in_revision(commits[2].after_revision)
            .expect("files");
        assert_eq!(files[0].content, "r3");
    }

    #[test]
    fn importing_the_same_repository_twice_is_rejected_without_partial_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "r1/main.c", "int main;");
        let history = read_snapshot_history(dir.path(), &ImportOptions::default(), &c_language())
            .expect("history");
        let index = SqliteIndex::open_in_memory().expect("sqlite");
        register_history(&index, &ImportOptions::default(), &history).expect("first import");

        let err = register_history(&index, &ImportOptions::default(), &history)
            .expect_err("second import");
        assert!(matches!(err, ImportError::AlreadyImported(ref name) if name == "default"));
        assert_eq!(index.counts().expect("counts")["revisions"], 1);
    }

    #[test]
    fn empty_history_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_snapshot_history(dir.path(), &ImportOptions::default(), &c_language())
            .expect_err("empty");
        assert!(matches!(err, ImportError::Empty(_)));
    }
}
