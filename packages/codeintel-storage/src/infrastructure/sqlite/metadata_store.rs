//! SQLite metadata store
//!
//! Tables:
//! - `dumps`: one row per ingested upload, unique on `(repository_id, commit_hash, root, indexer)`
//! - `commit_dates`: first observed commit date per `(repository_id, commit_hash)`
//! - `packages` / `package_references`: replaced wholesale per upload
//! - `dependency_sync_jobs`: queued work for the dependency scheduler
//! - `dirty_repositories`: monotonically increasing dirty token per repository

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

use super::transaction::SqliteTransaction;
use super::{from_millis, open_connection, open_in_memory, to_millis};
use crate::domain::bundle::{Package, PackageReference};
use crate::domain::dump::{DependencySyncJob, Dump};
use crate::domain::ports::{MetadataStore, MetadataTransaction, NestedTransaction};
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dumps (
    upload_id INTEGER PRIMARY KEY,
    repository_id INTEGER NOT NULL,
    commit_hash TEXT NOT NULL,
    root TEXT NOT NULL,
    indexer TEXT NOT NULL,
    finished_at INTEGER NOT NULL,
    UNIQUE (repository_id, commit_hash, root, indexer)
);

CREATE TABLE IF NOT EXISTS commit_dates (
    repository_id INTEGER NOT NULL,
    commit_hash TEXT NOT NULL,
    committed_at INTEGER NOT NULL,
    PRIMARY KEY (repository_id, commit_hash)
);

CREATE TABLE IF NOT EXISTS packages (
    upload_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (upload_id, scheme, manager, name, version)
);

CREATE TABLE IF NOT EXISTS package_references (
    upload_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    manager TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (upload_id, scheme, manager, name, version)
);

CREATE TABLE IF NOT EXISTS dependency_sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    queued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS dependency_sync_jobs_upload_idx ON dependency_sync_jobs(upload_id);

CREATE TABLE IF NOT EXISTS dirty_repositories (
    repository_id INTEGER PRIMARY KEY,
    dirty_token INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// SQLite-backed metadata store
#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(open_connection(db_path)?)
    }

    /// In-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_dump(row: &Row<'_>) -> rusqlite::Result<Dump> {
        Ok(Dump {
            upload_id: row.get(0)?,
            repository_id: row.get(1)?,
            commit: row.get(2)?,
            root: row.get(3)?,
            indexer: row.get(4)?,
            finished_at: from_millis(row.get(5)?),
        })
    }

    fn row_to_package(row: &Row<'_>) -> rusqlite::Result<Package> {
        Ok(Package {
            scheme: row.get(0)?,
            manager: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
        })
    }

    fn list_packages(&self, table: &str, upload_id: i64) -> Result<Vec<Package>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT scheme, manager, name, version FROM {table}
             WHERE upload_id = ?1
             ORDER BY scheme, manager, name, version"
        ))?;
        let packages = stmt
            .query_map(params![upload_id], Self::row_to_package)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(packages)
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn update_committed_at(
        &self,
        repository_id: i64,
        commit: &str,
        committed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO commit_dates (repository_id, commit_hash, committed_at)
             VALUES (?1, ?2, ?3)",
            params![repository_id, commit, to_millis(committed_at)],
        )?;
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn MetadataTransaction + '_>> {
        let tx = SqliteTransaction::begin(self.conn.lock())?;
        Ok(Box::new(SqliteMetadataTransaction { tx }))
    }

    fn get_dump(&self, upload_id: i64) -> Result<Option<Dump>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT upload_id, repository_id, commit_hash, root, indexer, finished_at
                 FROM dumps WHERE upload_id = ?1",
                params![upload_id],
                Self::row_to_dump,
            )
            .optional()?)
    }

    fn list_dumps(&self, repository_id: i64) -> Result<Vec<Dump>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT upload_id, repository_id, commit_hash, root, indexer, finished_at
             FROM dumps WHERE repository_id = ?1 ORDER BY upload_id",
        )?;
        let dumps = stmt
            .query_map(params![repository_id], Self::row_to_dump)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(dumps)
    }

    fn committed_at(&self, repository_id: i64, commit: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let millis: Option<i64> = conn
            .query_row(
                "SELECT committed_at FROM commit_dates
                 WHERE repository_id = ?1 AND commit_hash = ?2",
                params![repository_id, commit],
                |row| row.get(0),
            )
            .optional()?;
        Ok(millis.map(from_millis))
    }

    fn dirty_token(&self, repository_id: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let token: Option<i64> = conn
            .query_row(
                "SELECT dirty_token FROM dirty_repositories WHERE repository_id = ?1",
                params![repository_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.unwrap_or(0) as u64)
    }

    fn dependency_sync_jobs(&self, upload_id: i64) -> Result<Vec<DependencySyncJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, upload_id, state, queued_at FROM dependency_sync_jobs
             WHERE upload_id = ?1 ORDER BY id",
        )?;
        let jobs = stmt
            .query_map(params![upload_id], |row| {
                Ok(DependencySyncJob {
                    id: row.get(0)?,
                    upload_id: row.get(1)?,
                    state: row.get(2)?,
                    queued_at: from_millis(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn packages(&self, upload_id: i64) -> Result<Vec<Package>> {
        self.list_packages("packages", upload_id)
    }

    fn package_references(&self, upload_id: i64) -> Result<Vec<PackageReference>> {
        Ok(self
            .list_packages("package_references", upload_id)?
            .into_iter()
            .map(|package| PackageReference { package })
            .collect())
    }
}

struct SqliteMetadataTransaction<'a> {
    tx: SqliteTransaction<'a>,
}

impl SqliteMetadataTransaction<'_> {
    fn replace_packages<'p>(
        &mut self,
        table: &str,
        upload_id: i64,
        packages: impl Iterator<Item = &'p Package>,
    ) -> Result<()> {
        let conn = self.tx.conn();
        conn.execute(
            &format!("DELETE FROM {table} WHERE upload_id = ?1"),
            params![upload_id],
        )?;

        let mut stmt = conn.prepare(&format!(
            "INSERT OR IGNORE INTO {table} (upload_id, scheme, manager, name, version)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ))?;
        for p in packages {
            stmt.execute(params![upload_id, p.scheme, p.manager, p.name, p.version])?;
        }
        Ok(())
    }
}

impl NestedTransaction for SqliteMetadataTransaction<'_> {
    fn mark(&mut self, name: &str) -> Result<()> {
        self.tx.mark(name)
    }

    fn rollback_to_mark(&mut self, name: &str) -> Result<()> {
        self.tx.rollback_to_mark(name)
    }

    fn release_mark(&mut self, name: &str) -> Result<()> {
        self.tx.release_mark(name)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.tx.finish_commit()
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.tx.finish_rollback()
    }
}

impl MetadataTransaction for SqliteMetadataTransaction<'_> {
    fn delete_overlapping_dumps(
        &mut self,
        upload_id: i64,
        repository_id: i64,
        commit: &str,
        root: &str,
        indexer: &str,
    ) -> Result<u64> {
        let deleted = self.tx.conn().execute(
            "DELETE FROM dumps
             WHERE repository_id = ?1 AND commit_hash = ?2 AND root = ?3 AND indexer = ?4
               AND upload_id != ?5",
            params![repository_id, commit, root, indexer, upload_id],
        )?;
        Ok(deleted as u64)
    }

    fn update_packages(&mut self, upload_id: i64, packages: &[Package]) -> Result<()> {
        self.replace_packages("packages", upload_id, packages.iter())
    }

    fn update_package_references(
        &mut self,
        upload_id: i64,
        references: &[PackageReference],
    ) -> Result<()> {
        self.replace_packages(
            "package_references",
            upload_id,
            references.iter().map(|r| &r.package),
        )
    }

    fn insert_dependency_sync_job(&mut self, upload_id: i64) -> Result<i64> {
        let conn = self.tx.conn();
        conn.execute(
            "INSERT INTO dependency_sync_jobs (upload_id, state, queued_at)
             VALUES (?1, 'queued', ?2)",
            params![upload_id, to_millis(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn set_repository_dirty(&mut self, repository_id: i64) -> Result<()> {
        self.tx.conn().execute(
            "INSERT INTO dirty_repositories (repository_id, dirty_token, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT (repository_id) DO UPDATE
             SET dirty_token = dirty_token + 1, updated_at = excluded.updated_at",
            params![repository_id, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    fn install_dump(&mut self, dump: &Dump) -> Result<()> {
        self.tx.conn().execute(
            "INSERT INTO dumps (upload_id, repository_id, commit_hash, root, indexer, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (upload_id) DO UPDATE
             SET repository_id = excluded.repository_id, commit_hash = excluded.commit_hash,
                 root = excluded.root, indexer = excluded.indexer,
                 finished_at = excluded.finished_at",
            params![
                dump.upload_id,
                dump.repository_id,
                dump.commit,
                dump.root,
                dump.indexer,
                to_millis(dump.finished_at)
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_date_first_write_wins() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let first = from_millis(1_600_000_000_000);
        let second = from_millis(1_700_000_000_000);

        store.update_committed_at(50, "deadbeef1", first).unwrap();
        store.update_committed_at(50, "deadbeef1", second).unwrap();
        assert_eq!(store.committed_at(50, "deadbeef1").unwrap(), Some(first));
        assert_eq!(store.committed_at(50, "other").unwrap(), None);
    }

    #[test]
    fn test_install_replaces_overlapping_dump() {
        let store = SqliteMetadataStore::in_memory().unwrap();

        let mut tx = store.begin().unwrap();
        tx.install_dump(&Dump::new(1, 50, "deadbeef1", "sub3/", "lsif-go"))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(
            tx.delete_overlapping_dumps(2, 50, "deadbeef1", "sub3/", "lsif-go")
                .unwrap(),
            1
        );
        tx.install_dump(&Dump::new(2, 50, "deadbeef1", "sub3/", "lsif-go"))
            .unwrap();
        tx.commit().unwrap();

        let dumps = store.list_dumps(50).unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].upload_id, 2);
    }

    #[test]
    fn test_overlap_delete_keeps_own_dump() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.install_dump(&Dump::new(1, 50, "c", "", "lsif-go")).unwrap();
        assert_eq!(tx.delete_overlapping_dumps(1, 50, "c", "", "lsif-go").unwrap(), 0);
        tx.commit().unwrap();
        assert!(store.get_dump(1).unwrap().is_some());
    }

    #[test]
    fn test_packages_are_replaced() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.update_packages(1, &[Package::new("npm", "npm", "left-pad", "1.0.0")])
            .unwrap();
        tx.update_packages(1, &[Package::new("npm", "npm", "right-pad", "2.0.0")])
            .unwrap();
        tx.update_package_references(
            1,
            &[PackageReference {
                package: Package::new("npm", "npm", "lodash", "^4"),
            }],
        )
        .unwrap();
        tx.commit().unwrap();

        let packages = store.packages(1).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "right-pad");
        assert_eq!(store.package_references(1).unwrap()[0].package.name, "lodash");
    }

    #[test]
    fn test_dirty_token_increments() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        assert_eq!(store.dirty_token(50).unwrap(), 0);

        for _ in 0..2 {
            let mut tx = store.begin().unwrap();
            tx.set_repository_dirty(50).unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(store.dirty_token(50).unwrap(), 2);
    }

    #[test]
    fn test_rollback_to_mark_discards_partial_work() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.mark("install_dump").unwrap();
        tx.insert_dependency_sync_job(1).unwrap();
        tx.set_repository_dirty(50).unwrap();
        tx.rollback_to_mark("install_dump").unwrap();
        tx.release_mark("install_dump").unwrap();
        tx.commit().unwrap();

        assert!(store.dependency_sync_jobs(1).unwrap().is_empty());
        assert_eq!(store.dirty_token(50).unwrap(), 0);
    }

    #[test]
    fn test_explicit_rollback() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.insert_dependency_sync_job(1).unwrap();
        tx.rollback().unwrap();

        assert!(store.dependency_sync_jobs(1).unwrap().is_empty());
    }
}
