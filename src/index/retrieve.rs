use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};

use super::{SqliteIndex, decode_kind, encode_kind};
use crate::index::lineage::{
    CloneSet, CodeFragment, Commit, Crd, ElementId, ElementKind, Genealogy, Link, Repository,
    Revision, RevisionId, SourceFile,
};

/// The slice of an element the chain builder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRef {
    pub id: ElementId,
    pub revision_id: RevisionId,
}

impl SqliteIndex {
    pub fn repository_by_name(&self, name: &str) -> rusqlite::Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, name FROM repositories WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Repository {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    pub fn revisions(&self) -> rusqlite::Result<Vec<Revision>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, repository_id, identifier FROM revisions ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Revision {
                id: row.get(0)?,
                repository_id: row.get(1)?,
                identifier: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn commits(&self) -> rusqlite::Result<Vec<Commit>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, before_revision, after_revision FROM commits ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Commit {
                id: row.get(0)?,
                before_revision: row.get(1)?,
                after_revision: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn source_files_in_revision(
        &self,
        revision_id: RevisionId,
    ) -> rusqlite::Result<Vec<SourceFile>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, repository_id, revision_id, path, content
             FROM source_files
             WHERE revision_id = ?1
             ORDER BY repository_id ASC, path ASC",
        )?;
        let mut rows = stmt.query(params![revision_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let compressed: Vec<u8> = row.get(4)?;
            out.push(SourceFile {
                id: row.get(0)?,
                repository_id: row.get(1)?,
                revision_id: row.get(2)?,
                path: row.get(3)?,
                content: decompress_content(&compressed)?,
            });
        }
        Ok(out)
    }

    pub fn crds_in_revision(&self, revision_id: RevisionId) -> rusqlite::Result<Vec<Crd>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, revision_id, block_kind, fingerprint, digest, token_count
             FROM crds
             WHERE revision_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![revision_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Crd {
                id: row.get(0)?,
                revision_id: row.get(1)?,
                block_kind: row.get(2)?,
                fingerprint: row.get(3)?,
                digest: row.get(4)?,
                token_count: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn fragments_in_revision(
        &self,
        revision_id: RevisionId,
    ) -> rusqlite::Result<Vec<CodeFragment>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, repository_id, revision_id, file_path, crd_id, start_line, end_line
             FROM fragments
             WHERE revision_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![revision_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(fragment_from_row(row)?);
        }
        Ok(out)
    }

    pub fn fragment(&self, id: ElementId) -> rusqlite::Result<Option<CodeFragment>> {
        self.conn
            .query_row(
                "SELECT id, repository_id, revision_id, file_path, crd_id, start_line, end_line
                 FROM fragments
                 WHERE id = ?1",
                params![id],
                fragment_from_row,
            )
            .optional()
    }

    pub fn clone_sets_in_revision(
        &self,
        revision_id: RevisionId,
    ) -> rusqlite::Result<Vec<CloneSet>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT s.id, m.fragment_id
             FROM clone_sets s
             JOIN clone_members m ON m.clone_set_id = s.id
             WHERE s.revision_id = ?1
             ORDER BY s.id ASC, m.position ASC",
        )?;
        let mut rows = stmt.query(params![revision_id])?;
        let mut out: Vec<CloneSet> = Vec::new();
        while let Some(row) = rows.next()? {
            let id: ElementId = row.get(0)?;
            let member: ElementId = row.get(1)?;
            match out.last_mut() {
                Some(current) if current.id == id => current.members.push(member),
                _ => out.push(CloneSet {
                    id,
                    revision_id,
                    members: vec![member],
                }),
            }
        }
        Ok(out)
    }

    pub fn element_refs(&self, kind: ElementKind) -> rusqlite::Result<Vec<ElementRef>> {
        let sql = match kind {
            ElementKind::Fragment => "SELECT id, revision_id FROM fragments ORDER BY id ASC",
            ElementKind::Clone => "SELECT id, revision_id FROM clone_sets ORDER BY id ASC",
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ElementRef {
                id: row.get(0)?,
                revision_id: row.get(1)?,
            });
        }
        Ok(out)
    }

    pub fn links(&self, kind: ElementKind) -> rusqlite::Result<Vec<Link>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, id, before_element, after_element, before_revision, after_revision, changed
             FROM links
             WHERE kind = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![encode_kind(kind)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(link_from_row(row)?);
        }
        Ok(out)
    }

    pub fn links_between(
        &self,
        kind: ElementKind,
        before_revision: RevisionId,
        after_revision: RevisionId,
    ) -> rusqlite::Result<Vec<Link>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT kind, id, before_element, after_element, before_revision, after_revision, changed
             FROM links
             WHERE kind = ?1 AND before_revision = ?2 AND after_revision = ?3
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![encode_kind(kind), before_revision, after_revision])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(link_from_row(row)?);
        }
        Ok(out)
    }

    pub fn outbound_links(
        &self,
        kind: ElementKind,
        element: ElementId,
    ) -> rusqlite::Result<Vec<Link>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT kind, id, before_element, after_element, before_revision, after_revision, changed
             FROM links
             WHERE kind = ?1 AND before_element = ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![encode_kind(kind), element])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(link_from_row(row)?);
        }
        Ok(out)
    }

    pub fn genealogy_containing(
        &self,
        kind: ElementKind,
        element: ElementId,
    ) -> rusqlite::Result<Option<Genealogy>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT genealogy_id FROM genealogy_elements WHERE kind = ?1 AND element_id = ?2",
                params![encode_kind(kind), element],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.genealogy(kind, id),
            None => Ok(None),
        }
    }

    pub fn genealogy(&self, kind: ElementKind, id: i64) -> rusqlite::Result<Option<Genealogy>> {
        let kind_raw = encode_kind(kind);
        let header: Option<(String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT kind, start_revision, end_revision FROM genealogies WHERE kind = ?1 AND id = ?2",
                params![kind_raw, id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((stored_kind, start_revision, end_revision)) = header else {
            return Ok(None);
        };

        let elements = self.genealogy_members(
            "SELECT element_id FROM genealogy_elements
             WHERE kind = ?1 AND genealogy_id = ?2 ORDER BY position ASC",
            kind_raw,
            id,
        )?;
        let links = self.genealogy_members(
            "SELECT link_id FROM genealogy_links
             WHERE kind = ?1 AND genealogy_id = ?2 ORDER BY position ASC",
            kind_raw,
            id,
        )?;

        Ok(Some(Genealogy {
            id,
            kind: decode_kind(&stored_kind),
            start_revision,
            end_revision,
            elements,
            links,
        }))
    }

    fn genealogy_members(&self, sql: &str, kind: &str, id: i64) -> rusqlite::Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params![kind, id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }
}

fn fragment_from_row(row: &Row<'_>) -> rusqlite::Result<CodeFragment> {
    Ok(CodeFragment {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        revision_id: row.get(2)?,
        file_path: row.get(3)?,
        crd_id: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<Link> {
    Ok(Link {
        kind: decode_kind(&row.get::<_, String>(0)?),
        id: row.get(1)?,
        before_element: row.get(2)?,
        after_element: row.get(3)?,
        before_revision: row.get(4)?,
        after_revision: row.get(5)?,
        changed: row.get::<_, i64>(6)? != 0,
    })
}

fn decompress_content(bytes: &[u8]) -> rusqlite::Result<String> {
    let decoded = zstd::stream::decode_all(bytes)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Blob, Box::new(err)))?;
    String::from_utf8(decoded)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Blob, Box::new(err)))
}
