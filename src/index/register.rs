use rusqlite::{Connection, params};
use tracing::warn;

use super::{SqliteIndex, encode_kind};
use crate::index::lineage::{
    CloneSet, CodeFragment, Commit, Crd, Genealogy, Link, Repository, Revision, SourceFile,
};

/// A record the index knows how to insert.
pub trait Persist {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()>;
}

impl SqliteIndex {
    /// Inserts a batch inside a savepoint: either every record lands or none does.
    pub fn register<T: Persist>(&self, items: &[T]) -> rusqlite::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.conn.execute_batch("SAVEPOINT register_batch;")?;
        let result = items.iter().try_for_each(|item| item.insert_on(&self.conn));
        match result {
            Ok(()) => self.conn.execute_batch("RELEASE register_batch;"),
            Err(err) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO register_batch; RELEASE register_batch;")
                {
                    warn!(error = %rollback, insert_error = %err, "batch rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl Persist for Repository {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached("INSERT INTO repositories (id, name) VALUES (?1, ?2)")?
            .execute(params![self.id, self.name])?;
        Ok(())
    }
}

impl Persist for Revision {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached(
            "INSERT INTO revisions (id, repository_id, identifier) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![self.id, self.repository_id, self.identifier])?;
        Ok(())
    }
}

impl Persist for Commit {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached(
            "INSERT INTO commits (id, before_revision, after_revision) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![self.id, self.before_revision, self.after_revision])?;
        Ok(())
    }
}

impl Persist for SourceFile {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        let compressed = zstd::stream::encode_all(self.content.as_bytes(), 0)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        conn.prepare_cached(
            "INSERT INTO source_files (id, repository_id, revision_id, path, content)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            self.id,
            self.repository_id,
            self.revision_id,
            self.path,
            compressed
        ])?;
        Ok(())
    }
}

impl Persist for Crd {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached(
            "INSERT INTO crds (id, revision_id, block_kind, fingerprint, digest, token_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            self.id,
            self.revision_id,
            self.block_kind,
            self.fingerprint,
            self.digest,
            self.token_count
        ])?;
        Ok(())
    }
}

impl Persist for CodeFragment {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached(
            "INSERT INTO fragments (id, repository_id, revision_id, file_path, crd_id, start_line, end_line)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            self.id,
            self.repository_id,
            self.revision_id,
            self.file_path,
            self.crd_id,
            self.start_line,
            self.end_line
        ])?;
        Ok(())
    }
}

impl Persist for CloneSet {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached("INSERT INTO clone_sets (id, revision_id) VALUES (?1, ?2)")?
            .execute(params![self.id, self.revision_id])?;
        let mut member_stmt = conn.prepare_cached(
            "INSERT INTO clone_members (clone_set_id, position, fragment_id) VALUES (?1, ?2, ?3)",
        )?;
        for (position, member) in self.members.iter().enumerate() {
            member_stmt.execute(params![self.id, position as i64, member])?;
        }
        Ok(())
    }
}

impl Persist for Link {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.prepare_cached(
            "INSERT INTO links (
                kind, id, before_element, after_element, before_revision, after_revision, changed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            encode_kind(self.kind),
            self.id,
            self.before_element,
            self.after_element,
            self.before_revision,
            self.after_revision,
            if self.changed { 1_i64 } else { 0_i64 }
        ])?;
        Ok(())
    }
}

impl Persist for Genealogy {
    fn insert_on(&self, conn: &Connection) -> rusqlite::Result<()> {
        let kind = encode_kind(self.kind);
        conn.prepare_cached(
            "INSERT INTO genealogies (kind, id, start_revision, end_revision) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![kind, self.id, self.start_revision, self.end_revision])?;

        let mut element_stmt = conn.prepare_cached(
            "INSERT INTO genealogy_elements (kind, genealogy_id, position, element_id)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, element) in self.elements.iter().enumerate() {
            element_stmt.execute(params![kind, self.id, position as i64, element])?;
        }

        let mut link_stmt = conn.prepare_cached(
            "INSERT INTO genealogy_links (kind, genealogy_id, position, link_id)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, link) in self.links.iter().enumerate() {
            link_stmt.execute(params![kind, self.id, position as i64, link])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(id: i64, name: &str) -> Repository {
        Repository {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn failed_batch_leaves_no_partial_rows() {
        let index = SqliteIndex::open_in_memory().expect("sqlite");
        index.register(&[repository(1, "core")]).expect("seed");

        let err = index
            .register(&[repository(2, "tools"), repository(1, "core-again")])
            .expect_err("duplicate id");
        assert!(matches!(err, rusqlite::Error::SqliteFailure(..)));
        assert_eq!(index.counts().expect("counts")["repositories"], 1);
        assert!(!index.in_transaction());

        index.register(&[repository(2, "tools")]).expect("usable after rollback");
        assert_eq!(index.counts().expect("counts")["repositories"], 2);
    }
}
