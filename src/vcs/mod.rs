//! Version-control access: which source files a revision holds and which of
//! them a commit touched.

pub mod git;

use std::collections::BTreeMap;

pub use git::GitRepository;

pub const DEFAULT_INCLUDE_GLOBS: &[&str] = &[
    "*.c", "*.h", "*.cc", "*.cpp", "*.hpp", "*.java", "*.rs", "*.py",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeCode {
    Added,
    Modified,
    Deleted,
}

impl ChangeCode {
    /// `A` added, `D` deleted, anything else is a modification.
    pub fn from_char(code: char) -> Self {
        match code {
            'A' => Self::Added,
            'D' => Self::Deleted,
            _ => Self::Modified,
        }
    }

    pub const fn as_char(self) -> char {
        match self {
            Self::Added => 'A',
            Self::Modified => 'M',
            Self::Deleted => 'D',
        }
    }
}

#[derive(Debug)]
pub enum VcsError {
    Spawn(std::io::Error),
    Command { command: String, stderr: String },
    Utf8 { command: String },
    Pattern(glob::PatternError),
}

impl std::fmt::Display for VcsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "failed to spawn git: {err}"),
            Self::Command { command, stderr } => {
                write!(f, "`{command}` failed: {}", stderr.trim())
            }
            Self::Utf8 { command } => write!(f, "`{command}` produced non-UTF-8 output"),
            Self::Pattern(err) => write!(f, "invalid include glob: {err}"),
        }
    }
}

impl std::error::Error for VcsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) => Some(err),
            Self::Pattern(err) => Some(err),
            _ => None,
        }
    }
}

impl From<glob::PatternError> for VcsError {
    fn from(value: glob::PatternError) -> Self {
        Self::Pattern(value)
    }
}

/// The set of paths treated as source files.
#[derive(Debug, Clone)]
pub struct Language {
    patterns: Vec<glob::Pattern>,
}

impl Language {
    pub fn from_globs<S: AsRef<str>>(globs: &[S]) -> Result<Self, VcsError> {
        let patterns = globs
            .iter()
            .map(|raw| raw.as_ref().trim())
            .filter(|raw| !raw.is_empty())
            .map(glob::Pattern::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn default_globs() -> Vec<String> {
        DEFAULT_INCLUDE_GLOBS
            .iter()
            .map(|glob| glob.to_string())
            .collect()
    }

    pub fn is_target(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(path))
    }
}

/// One entry of a commit's changed-path list, as reported by the VCS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPath {
    pub path: String,
    pub code: char,
}

/// A commit as the VCS sees it: revision identifiers, not index ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCommit {
    pub before: Option<String>,
    pub after: String,
}

pub trait SourceLister {
    /// Source files present in `revision`, repository-relative.
    fn list_source_files(&self, revision: &str, language: &Language)
    -> Result<Vec<String>, VcsError>;

    /// Every path `revision` touched relative to its parent, directories included.
    fn changed_paths(&self, revision: &str) -> Result<Vec<ChangedPath>, VcsError>;
}

/// Source files a commit added, modified or deleted.
///
/// The first commit of a history reports every source file as added. A
/// deleted or replaced directory expands to every before-revision source file
/// beneath it.
pub fn detect_changed_files(
    lister: &dyn SourceLister,
    commit: &VcsCommit,
    language: &Language,
) -> Result<BTreeMap<String, ChangeCode>, VcsError> {
    let after_files = lister.list_source_files(&commit.after, language)?;

    let Some(before) = commit.before.as_deref() else {
        return Ok(after_files
            .into_iter()
            .map(|path| (path, ChangeCode::Added))
            .collect());
    };

    let mut result = BTreeMap::new();
    let mut deleted_dirs = Vec::new();
    for changed in lister.changed_paths(&commit.after)? {
        let raw = changed.path.trim_start_matches('/');
        if language.is_target(raw) {
            let target = normalize_changed_path(raw, &after_files);
            result.insert(target.to_string(), ChangeCode::from_char(changed.code));
        } else if matches!(changed.code, 'D' | 'R') {
            deleted_dirs.push(raw.trim_end_matches('/').to_string());
        }
    }

    if !deleted_dirs.is_empty() {
        for file in lister.list_source_files(before, language)? {
            let under_deleted = deleted_dirs.iter().any(|dir| {
                file.strip_prefix(dir.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
            });
            if under_deleted {
                result.insert(file, ChangeCode::Deleted);
            }
        }
    }

    Ok(result)
}

/// The longest after-revision source path that `raw` ends with, matched on
/// whole path components.
fn normalize_changed_path<'a>(raw: &'a str, after_files: &'a [String]) -> &'a str {
    after_files
        .iter()
        .filter(|source| is_component_suffix(raw, source))
        .max_by_key(|source| source.len())
        .map_or(raw, String::as_str)
}

fn is_component_suffix(path: &str, suffix: &str) -> bool {
    path == suffix
        || path
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('/'))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FakeLister {
        files: HashMap<&'static str, Vec<&'static str>>,
        changes: HashMap<&'static str, Vec<(&'static str, char)>>,
    }

    impl SourceLister for FakeLister {
        fn list_source_files(
            &self,
            revision: &str,
            language: &Language,
        ) -> Result<Vec<String>, VcsError> {
            Ok(self
                .files
                .get(revision)
                .into_iter()
                .flatten()
                .filter(|path| language.is_target(path))
                .map(|path| path.to_string())
                .collect())
        }

        fn changed_paths(&self, revision: &str) -> Result<Vec<ChangedPath>, VcsError> {
            Ok(self
                .changes
                .get(revision)
                .into_iter()
                .flatten()
                .map(|(path, code)| ChangedPath {
                    path: path.to_string(),
                    code: *code,
                })
                .collect())
        }
    }

    fn c_language() -> Language {
        Language::from_globs(&["*.c", "*.h"]).expect("globs")
    }

    fn commit(before: Option<&str>, after: &str) -> VcsCommit {
        VcsCommit {
            before: before.map(str::to_string),
            after: after.to_string(),
        }
    }

    #[test]
    fn change_codes_map_unknown_letters_to_modified() {
        assert_eq!(ChangeCode::from_char('A'), ChangeCode::Added);
        assert_eq!(ChangeCode::from_char('D'), ChangeCode::Deleted);
        assert_eq!(ChangeCode::from_char('M'), ChangeCode::Modified);
        assert_eq!(ChangeCode::from_char('R'), ChangeCode::Modified);
        assert_eq!(ChangeCode::Deleted.as_char(), 'D');
    }

    #[test]
    fn initial_commit_reports_every_source_file_as_added() {
        let lister = FakeLister {
            files: HashMap::from([("r1", vec!["src/a.c", "src/a.h", "README.md"])]),
            ..FakeLister::default()
        };
        let changed =
            detect_changed_files(&lister, &commit(None, "r1"), &c_language()).expect("detect");
        assert_eq!(
            changed,
            BTreeMap::from([
                ("src/a.c".to_string(), ChangeCode::Added),
                ("src/a.h".to_string(), ChangeCode::Added),
            ])
        );
    }

    #[test]
    fn source_changes_are_normalized_to_after_revision_paths() {
        let lister = FakeLister {
            files: HashMap::from([("r2", vec!["src/a.c", "src/b.c"])]),
            changes: HashMap::from([(
                "r2",
                vec![
                    ("/trunk/src/a.c", 'M'),
                    ("/trunk/src/b.c", 'A'),
                    ("/trunk/docs/x.md", 'M'),
                ],
            )]),
        };
        let changed = detect_changed_files(&lister, &commit(Some("r1"), "r2"), &c_language())
            .expect("detect");
        assert_eq!(
            changed,
            BTreeMap::from([
                ("src/a.c".to_string(), ChangeCode::Modified),
                ("src/b.c".to_string(), ChangeCode::Added),
            ])
        );
    }

    #[test]
    fn normalization_matches_whole_path_components_only() {
        let lister = FakeLister {
            files: HashMap::from([
                ("r1", vec!["a.c", "src/data.c", "lib/xa.c"]),
                ("r2", vec!["a.c", "src/data.c"]),
            ]),
            changes: HashMap::from([("r2", vec![("src/data.c", 'M'), ("lib/xa.c", 'D')])]),
        };
        let changed = detect_changed_files(&lister, &commit(Some("r1"), "r2"), &c_language())
            .expect("detect");
        assert_eq!(
            changed,
            BTreeMap::from([
                ("lib/xa.c".to_string(), ChangeCode::Deleted),
                ("src/data.c".to_string(), ChangeCode::Modified),
            ])
        );
    }

    #[test]
    fn exact_path_wins_over_a_shorter_component_suffix() {
        let lister = FakeLister {
            files: HashMap::from([("r2", vec!["a.c", "src/a.c"])]),
            changes: HashMap::from([("r2", vec![("src/a.c", 'M')])]),
        };
        let changed = detect_changed_files(&lister, &commit(Some("r1"), "r2"), &c_language())
            .expect("detect");
        assert_eq!(
            changed,
            BTreeMap::from([("src/a.c".to_string(), ChangeCode::Modified)])
        );
    }

    #[test]
    fn deleted_directory_expands_to_every_file_beneath_it() {
        let lister = FakeLister {
            files: HashMap::from([
                ("r1", vec!["lib/x.c", "lib/y.c", "lib/deep/z.h", "libz/w.c", "main.c"]),
                ("r2", vec!["main.c", "libz/w.c"]),
            ]),
            changes: HashMap::from([("r2", vec![("lib", 'D')])]),
        };
        let changed = detect_changed_files(&lister, &commit(Some("r1"), "r2"), &c_language())
            .expect("detect");
        assert_eq!(
            changed.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["lib/deep/z.h", "lib/x.c", "lib/y.c"]
        );
        assert!(changed.values().all(|code| *code == ChangeCode::Deleted));
    }
}
