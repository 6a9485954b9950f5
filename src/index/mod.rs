pub mod lineage;
mod register;
mod retrieve;
mod shared;

use std::collections::BTreeMap;

use rusqlite::{Connection, params};

use crate::index::lineage::ElementKind;

pub use register::Persist;
pub use retrieve::ElementRef;
pub use shared::SharedIndex;

const SCHEMA_VERSION: i64 = 1;

/// Stages in pipeline order. Clearing a stage clears everything derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Fragments,
    Clones,
    FragmentLinks,
    CloneLinks,
    FragmentGenealogies,
    CloneGenealogies,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fragments => "fragments",
            Self::Clones => "clones",
            Self::FragmentLinks => "link-fragments",
            Self::CloneLinks => "link-clones",
            Self::FragmentGenealogies => "fragment-genealogies",
            Self::CloneGenealogies => "clone-genealogies",
        }
    }

    fn clear_statements(self) -> &'static str {
        match self {
            Self::Fragments => {
                "DELETE FROM crds;
                 DELETE FROM fragments;"
            }
            Self::Clones => {
                "DELETE FROM clone_members;
                 DELETE FROM clone_sets;"
            }
            Self::FragmentLinks => "DELETE FROM links WHERE kind = 'fragment';",
            Self::CloneLinks => "DELETE FROM links WHERE kind = 'clone';",
            Self::FragmentGenealogies => {
                "DELETE FROM genealogy_elements WHERE kind = 'fragment';
                 DELETE FROM genealogy_links WHERE kind = 'fragment';
                 DELETE FROM genealogies WHERE kind = 'fragment';"
            }
            Self::CloneGenealogies => {
                "DELETE FROM genealogy_elements WHERE kind = 'clone';
                 DELETE FROM genealogy_links WHERE kind = 'clone';
                 DELETE FROM genealogies WHERE kind = 'clone';"
            }
        }
    }

    fn derived(self) -> &'static [Stage] {
        match self {
            Self::Fragments => &[
                Self::Fragments,
                Self::Clones,
                Self::FragmentLinks,
                Self::CloneLinks,
                Self::FragmentGenealogies,
                Self::CloneGenealogies,
            ],
            Self::Clones => &[Self::Clones, Self::CloneLinks, Self::CloneGenealogies],
            Self::FragmentLinks => &[
                Self::FragmentLinks,
                Self::CloneLinks,
                Self::FragmentGenealogies,
                Self::CloneGenealogies,
            ],
            Self::CloneLinks => &[Self::CloneLinks, Self::CloneGenealogies],
            Self::FragmentGenealogies => &[Self::FragmentGenealogies],
            Self::CloneGenealogies => &[Self::CloneGenealogies],
        }
    }
}

pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self { conn };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let index = Self { conn };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            _ => return Err(rusqlite::Error::InvalidQuery),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS revisions (
                id INTEGER PRIMARY KEY,
                repository_id INTEGER NOT NULL,
                identifier TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS commits (
                id INTEGER PRIMARY KEY,
                before_revision INTEGER,
                after_revision INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS source_files (
                id INTEGER PRIMARY KEY,
                repository_id INTEGER NOT NULL,
                revision_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                content BLOB NOT NULL,
                UNIQUE(revision_id, repository_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_source_files_revision ON source_files(revision_id);

            CREATE TABLE IF NOT EXISTS crds (
                id INTEGER PRIMARY KEY,
                revision_id INTEGER NOT NULL,
                block_kind TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                digest INTEGER NOT NULL,
                token_count INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_crds_revision ON crds(revision_id);

            CREATE TABLE IF NOT EXISTS fragments (
                id INTEGER PRIMARY KEY,
                repository_id INTEGER NOT NULL,
                revision_id INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                crd_id INTEGER NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL CHECK (end_line >= start_line)
            );

            CREATE INDEX IF NOT EXISTS idx_fragments_revision ON fragments(revision_id);

            CREATE TABLE IF NOT EXISTS clone_sets (
                id INTEGER PRIMARY KEY,
                revision_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clone_sets_revision ON clone_sets(revision_id);

            CREATE TABLE IF NOT EXISTS clone_members (
                clone_set_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                fragment_id INTEGER NOT NULL,
                PRIMARY KEY(clone_set_id, position)
            );

            CREATE TABLE IF NOT EXISTS links (
                kind TEXT NOT NULL,
                id INTEGER NOT NULL,
                before_element INTEGER NOT NULL,
                after_element INTEGER NOT NULL,
                before_revision INTEGER NOT NULL,
                after_revision INTEGER NOT NULL CHECK (after_revision > before_revision),
                changed INTEGER NOT NULL CHECK (changed IN (0, 1)),
                PRIMARY KEY(kind, id)
            );

            CREATE INDEX IF NOT EXISTS idx_links_revisions
                ON links(kind, before_revision, after_revision);

            CREATE TABLE IF NOT EXISTS genealogies (
                kind TEXT NOT NULL,
                id INTEGER NOT NULL,
                start_revision INTEGER NOT NULL,
                end_revision INTEGER NOT NULL CHECK (end_revision >= start_revision),
                PRIMARY KEY(kind, id)
            );

            CREATE TABLE IF NOT EXISTS genealogy_elements (
                kind TEXT NOT NULL,
                genealogy_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                element_id INTEGER NOT NULL,
                PRIMARY KEY(kind, genealogy_id, position)
            );

            CREATE INDEX IF NOT EXISTS idx_genealogy_elements_element
                ON genealogy_elements(kind, element_id);

            CREATE TABLE IF NOT EXISTS genealogy_links (
                kind TEXT NOT NULL,
                genealogy_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                link_id INTEGER NOT NULL,
                PRIMARY KEY(kind, genealogy_id, position)
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                counts TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn begin(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")
    }

    pub fn commit(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("COMMIT;")
    }

    pub fn rollback(&self) -> rusqlite::Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Deletes the outputs of `stage` and of every stage derived from it.
    pub fn clear_stage(&self, stage: Stage) -> rusqlite::Result<()> {
        for derived in stage.derived() {
            self.conn.execute_batch(derived.clear_statements())?;
        }
        Ok(())
    }

    pub fn record_run(
        &self,
        stage: &str,
        started_at: &str,
        finished_at: &str,
        counts: &serde_json::Value,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO runs (stage, started_at, finished_at, counts) VALUES (?1, ?2, ?3, ?4)",
            params![stage, started_at, finished_at, counts.to_string()],
        )?;
        Ok(())
    }

    pub fn runs(&self) -> rusqlite::Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, stage, started_at, finished_at, counts FROM runs ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let counts: String = row.get(4)?;
            out.push(RunRecord {
                id: row.get(0)?,
                stage: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                counts: serde_json::from_str(&counts).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }

    /// First unused id of an id-keyed table; seeds the per-run id allocators.
    pub fn next_id(&self, table: IdTable) -> rusqlite::Result<i64> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table.as_str());
        self.conn.query_row(&sql, [], |row| row.get(0))
    }

    pub fn next_link_id(&self, kind: ElementKind) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM links WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )
    }

    pub fn next_genealogy_id(&self, kind: ElementKind) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM genealogies WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )
    }

    pub fn counts(&self) -> rusqlite::Result<BTreeMap<&'static str, i64>> {
        let mut out = BTreeMap::new();
        for (name, sql) in [
            ("repositories", "SELECT COUNT(*) FROM repositories"),
            ("revisions", "SELECT COUNT(*) FROM revisions"),
            ("commits", "SELECT COUNT(*) FROM commits"),
            ("source_files", "SELECT COUNT(*) FROM source_files"),
            ("crds", "SELECT COUNT(*) FROM crds"),
            ("fragments", "SELECT COUNT(*) FROM fragments"),
            ("clone_sets", "SELECT COUNT(*) FROM clone_sets"),
            (
                "fragment_links",
                "SELECT COUNT(*) FROM links WHERE kind = 'fragment'",
            ),
            ("clone_links", "SELECT COUNT(*) FROM links WHERE kind = 'clone'"),
            (
                "fragment_genealogies",
                "SELECT COUNT(*) FROM genealogies WHERE kind = 'fragment'",
            ),
            (
                "clone_genealogies",
                "SELECT COUNT(*) FROM genealogies WHERE kind = 'clone'",
            ),
        ] {
            let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            out.insert(name, count);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub stage: String,
    pub started_at: String,
    pub finished_at: String,
    pub counts: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTable {
    Repositories,
    Revisions,
    Commits,
    SourceFiles,
    Crds,
    Fragments,
    CloneSets,
}

impl IdTable {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Repositories => "repositories",
            Self::Revisions => "revisions",
            Self::Commits => "commits",
            Self::SourceFiles => "source_files",
            Self::Crds => "crds",
            Self::Fragments => "fragments",
            Self::CloneSets => "clone_sets",
        }
    }
}

fn encode_kind(kind: ElementKind) -> &'static str {
    kind.as_str()
}

fn decode_kind(raw: &str) -> ElementKind {
    ElementKind::parse(raw).unwrap_or(ElementKind::Fragment)
}
