pub type ElementId = i64;
pub type LinkId = i64;
pub type RevisionId = i64;
pub type CommitId = i64;
pub type RepositoryId = i64;

/// Anything held in an accumulation map is addressed by a globally unique id.
pub trait Keyed {
    fn key(&self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Fragment,
    Clone,
}

impl ElementKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fragment => "fragment",
            Self::Clone => "clone",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fragment" | "fragments" => Some(Self::Fragment),
            "clone" | "clones" | "clone_set" => Some(Self::Clone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: RevisionId,
    pub repository_id: RepositoryId,
    pub identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub before_revision: Option<RevisionId>,
    pub after_revision: RevisionId,
}

impl Commit {
    /// Revisions whose elements must stay resident while this commit is processed.
    pub fn revisions(&self) -> impl Iterator<Item = RevisionId> {
        self.before_revision
            .into_iter()
            .chain(std::iter::once(self.after_revision))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: i64,
    pub repository_id: RepositoryId,
    pub revision_id: RevisionId,
    pub path: String,
    pub content: String,
}

/// Content descriptor of one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crd {
    pub id: i64,
    pub revision_id: RevisionId,
    pub block_kind: String,
    pub fingerprint: String,
    pub digest: i64,
    pub token_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFragment {
    pub id: ElementId,
    pub repository_id: RepositoryId,
    pub revision_id: RevisionId,
    pub file_path: String,
    pub crd_id: i64,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSet {
    pub id: ElementId,
    pub revision_id: RevisionId,
    pub members: Vec<ElementId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub id: LinkId,
    pub kind: ElementKind,
    pub before_element: ElementId,
    pub after_element: ElementId,
    pub before_revision: RevisionId,
    pub after_revision: RevisionId,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genealogy {
    pub id: i64,
    pub kind: ElementKind,
    pub start_revision: RevisionId,
    pub end_revision: RevisionId,
    pub elements: Vec<ElementId>,
    pub links: Vec<LinkId>,
}

impl Genealogy {
    pub fn is_trivial(&self) -> bool {
        self.elements.len() == 1
    }
}

impl Keyed for Crd {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for CodeFragment {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for CloneSet {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for Link {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for Genealogy {
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for SourceFile {
    fn key(&self) -> i64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_kind_parses_singular_and_plural() {
        assert_eq!(ElementKind::parse("fragment"), Some(ElementKind::Fragment));
        assert_eq!(ElementKind::parse("Clones"), Some(ElementKind::Clone));
        assert_eq!(ElementKind::parse("genealogy"), None);
        assert_eq!(ElementKind::Clone.as_str(), "clone");
    }

    #[test]
    fn initial_commit_depends_only_on_its_after_revision() {
        let initial = Commit {
            id: 1,
            before_revision: None,
            after_revision: 7,
        };
        assert_eq!(initial.revisions().collect::<Vec<_>>(), vec![7]);

        let next = Commit {
            id: 2,
            before_revision: Some(7),
            after_revision: 8,
        };
        assert_eq!(next.revisions().collect::<Vec<_>>(), vec![7, 8]);
    }
}
