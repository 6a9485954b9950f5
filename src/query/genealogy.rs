use std::collections::{HashSet, VecDeque};

use crate::index::SqliteIndex;
use crate::index::lineage::{ElementId, ElementKind, Genealogy, Link};

pub const MAX_LINKS_DEFAULT: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct GenealogyView {
    pub genealogy: Genealogy,
    /// Links reachable forward from the queried element, breadth first.
    pub trail: Vec<Link>,
}

/// Follows outbound links from `start` until no new element is reached or
/// `max_links` links have been collected.
pub fn forward_trail(
    index: &SqliteIndex,
    kind: ElementKind,
    start: ElementId,
    max_links: usize,
) -> rusqlite::Result<Vec<Link>> {
    let mut queue = VecDeque::from([start]);
    let mut visited = HashSet::new();
    let mut out = Vec::new();

    while let Some(element) = queue.pop_front() {
        if !visited.insert(element) {
            continue;
        }
        for link in index.outbound_links(kind, element)? {
            if out.len() >= max_links {
                return Ok(out);
            }
            if !visited.contains(&link.after_element) {
                queue.push_back(link.after_element);
            }
            out.push(link);
        }
    }
    Ok(out)
}

/// The genealogy holding `element`, or `None` when genealogies of `kind`
/// have not been built or the element is unknown.
pub fn genealogy_of(
    index: &SqliteIndex,
    kind: ElementKind,
    element: ElementId,
) -> rusqlite::Result<Option<GenealogyView>> {
    let Some(genealogy) = index.genealogy_containing(kind, element)? else {
        return Ok(None);
    };
    let trail = forward_trail(index, kind, element, MAX_LINKS_DEFAULT)?;
    Ok(Some(GenealogyView { genealogy, trail }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: i64, before: ElementId, after: ElementId, revision: i64) -> Link {
        Link {
            id,
            kind: ElementKind::Fragment,
            before_element: before,
            after_element: after,
            before_revision: revision,
            after_revision: revision + 1,
            changed: id % 2 == 0,
        }
    }

    #[test]
    fn trail_follows_links_from_the_queried_element() {
        let index = SqliteIndex::open_in_memory().expect("sqlite");
        index
            .register(&[link(1, 10, 11, 1), link(2, 11, 12, 2), link(3, 20, 21, 1)])
            .expect("links");

        let trail = forward_trail(&index, ElementKind::Fragment, 10, MAX_LINKS_DEFAULT)
            .expect("trail");
        assert_eq!(trail.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2]);

        let middle = forward_trail(&index, ElementKind::Fragment, 11, MAX_LINKS_DEFAULT)
            .expect("trail");
        assert_eq!(middle.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2]);

        let capped = forward_trail(&index, ElementKind::Fragment, 10, 1).expect("trail");
        assert_eq!(capped.len(), 1);
        assert!(
            forward_trail(&index, ElementKind::Clone, 10, MAX_LINKS_DEFAULT)
                .expect("trail")
                .is_empty()
        );
    }

    #[test]
    fn unknown_element_has_no_genealogy() {
        let index = SqliteIndex::open_in_memory().expect("sqlite");
        assert_eq!(
            genealogy_of(&index, ElementKind::Fragment, 42).expect("query"),
            None
        );
    }
}
