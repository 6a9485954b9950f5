//! Turns pairwise element links into maximal, non-overlapping chains.

use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::index::lineage::{ElementId, ElementKind, Genealogy, Link, LinkId, RevisionId};
use crate::index::{ElementRef, SharedIndex};
use crate::pipeline::{IdAllocator, PipelineSettings, RegisterError, Registerer};

pub trait ChainElement {
    fn element_id(&self) -> ElementId;
    fn revision(&self) -> RevisionId;
}

pub trait ChainLink {
    fn link_id(&self) -> LinkId;
    fn before(&self) -> ElementId;
    fn after(&self) -> ElementId;
}

impl ChainElement for ElementRef {
    fn element_id(&self) -> ElementId {
        self.id
    }

    fn revision(&self) -> RevisionId {
        self.revision_id
    }
}

impl ChainLink for Link {
    fn link_id(&self) -> LinkId {
        self.id
    }

    fn before(&self) -> ElementId {
        self.before_element
    }

    fn after(&self) -> ElementId {
        self.after_element
    }
}

/// One maximal path of linked elements, head first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub start_revision: RevisionId,
    pub end_revision: RevisionId,
    pub elements: Vec<ElementId>,
    pub links: Vec<LinkId>,
}

impl Chain {
    pub fn into_genealogy(self, id: i64, kind: ElementKind) -> Genealogy {
        Genealogy {
            id,
            kind,
            start_revision: self.start_revision,
            end_revision: self.end_revision,
            elements: self.elements,
            links: self.links,
        }
    }
}

#[derive(Debug)]
pub enum GenealogyError {
    DuplicateElement(ElementId),
    UnknownElement { link: LinkId, element: ElementId },
    Branch { element: ElementId, links: (LinkId, LinkId) },
    Merge { element: ElementId, links: (LinkId, LinkId) },
    RevisionOrder { link: LinkId, before: RevisionId, after: RevisionId },
    Cycle { elements: Vec<ElementId> },
    Sqlite(rusqlite::Error),
    Register(RegisterError),
}

impl std::fmt::Display for GenealogyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateElement(id) => write!(f, "element {id} appears twice"),
            Self::UnknownElement { link, element } => {
                write!(f, "link {link} names unknown element {element}")
            }
            Self::Branch { element, links } => write!(
                f,
                "element {element} has two outgoing links ({} and {})",
                links.0, links.1
            ),
            Self::Merge { element, links } => write!(
                f,
                "element {element} has two incoming links ({} and {})",
                links.0, links.1
            ),
            Self::RevisionOrder {
                link,
                before,
                after,
            } => write!(
                f,
                "link {link} goes from revision {before} to revision {after}"
            ),
            Self::Cycle { elements } => {
                write!(f, "{} elements are unreachable from any head (cycle)", elements.len())
            }
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Register(err) => write!(f, "failed to register genealogies: {err}"),
        }
    }
}

impl std::error::Error for GenealogyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Register(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for GenealogyError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<RegisterError> for GenealogyError {
    fn from(value: RegisterError) -> Self {
        Self::Register(value)
    }
}

/// Partitions `elements` into chains along `links`. Every element lands in
/// exactly one chain; heads are taken in ascending element id order.
pub fn build_chains<E, L>(elements: &[E], links: &[L]) -> Result<Vec<Chain>, GenealogyError>
where
    E: ChainElement,
    L: ChainLink,
{
    let mut revisions: BTreeMap<ElementId, RevisionId> = BTreeMap::new();
    for element in elements {
        if revisions
            .insert(element.element_id(), element.revision())
            .is_some()
        {
            return Err(GenealogyError::DuplicateElement(element.element_id()));
        }
    }

    let mut outgoing: HashMap<ElementId, (LinkId, ElementId)> = HashMap::new();
    let mut incoming: HashMap<ElementId, LinkId> = HashMap::new();
    for link in links {
        let id = link.link_id();
        let (before, after) = (link.before(), link.after());
        let before_revision = *revisions
            .get(&before)
            .ok_or(GenealogyError::UnknownElement {
                link: id,
                element: before,
            })?;
        let after_revision = *revisions
            .get(&after)
            .ok_or(GenealogyError::UnknownElement {
                link: id,
                element: after,
            })?;
        if after_revision <= before_revision {
            return Err(GenealogyError::RevisionOrder {
                link: id,
                before: before_revision,
                after: after_revision,
            });
        }
        if let Some((existing, _)) = outgoing.insert(before, (id, after)) {
            return Err(GenealogyError::Branch {
                element: before,
                links: (existing, id),
            });
        }
        if let Some(existing) = incoming.insert(after, id) {
            return Err(GenealogyError::Merge {
                element: after,
                links: (existing, id),
            });
        }
    }

    let mut visited = 0usize;
    let mut chains = Vec::new();
    for (&head, &start_revision) in &revisions {
        if incoming.contains_key(&head) {
            continue;
        }
        let mut chain = Chain {
            start_revision,
            end_revision: start_revision,
            elements: vec![head],
            links: Vec::new(),
        };
        let mut current = head;
        while let Some(&(link, next)) = outgoing.get(&current) {
            chain.links.push(link);
            chain.elements.push(next);
            chain.end_revision = revisions[&next];
            current = next;
        }
        visited += chain.elements.len();
        chains.push(chain);
    }

    if visited != revisions.len() {
        let mut reached = chains
            .iter()
            .flat_map(|chain| chain.elements.iter().copied())
            .collect::<Vec<_>>();
        reached.sort_unstable();
        let elements = revisions
            .keys()
            .copied()
            .filter(|id| reached.binary_search(id).is_err())
            .collect();
        return Err(GenealogyError::Cycle { elements });
    }

    Ok(chains)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenealogyReport {
    pub genealogies: usize,
    pub trivial: usize,
    pub elements: usize,
}

/// Rebuilds every genealogy of `kind` from the stored elements and links.
/// The caller owns the surrounding transaction and clears old genealogies.
pub fn build_genealogies(
    index: &SharedIndex,
    kind: ElementKind,
    settings: &PipelineSettings,
) -> Result<GenealogyReport, GenealogyError> {
    let (elements, links, first_id) = {
        let db = index.lock();
        (
            db.element_refs(kind)?,
            db.links(kind)?,
            db.next_genealogy_id(kind)?,
        )
    };
    info!(
        kind = kind.as_str(),
        elements = elements.len(),
        links = links.len(),
        "building genealogies"
    );

    let chains = build_chains(&elements, &links)?;
    let ids = IdAllocator::seeded(first_id);
    let mut report = GenealogyReport {
        elements: elements.len(),
        ..GenealogyReport::default()
    };

    let genealogies = chains
        .into_iter()
        .map(|chain| chain.into_genealogy(ids.next(), kind))
        .collect::<Vec<_>>();
    for batch in genealogies.chunks(settings.flush_threshold.max(1)) {
        Registerer::register(index, batch)?;
        report.genealogies += batch.len();
        report.trivial += batch.iter().filter(|g| g.is_trivial()).count();
        info!(kind = kind.as_str(), count = batch.len(), "registered genealogies");
    }
    Ok(report)
}
