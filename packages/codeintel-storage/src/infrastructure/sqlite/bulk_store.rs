//! SQLite bulk analysis store
//!
//! Every table is keyed by `upload_id` plus the natural key of its rows, with
//! the payload stored as JSON. Inserts are plain `INSERT`s: replaying an upload
//! that was already written surfaces as a unique violation.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::transaction::SqliteTransaction;
use super::{open_connection, open_in_memory};
use crate::domain::bundle::{DocumentData, MetaData, MonikerLocations, ResultChunkData};
use crate::domain::dump::BulkRowCounts;
use crate::domain::ports::{BulkStore, BulkTransaction};
use crate::error::Result;

const META_TABLE: &str = "codeintel_meta";
const DOCUMENTS_TABLE: &str = "codeintel_documents";
const RESULT_CHUNKS_TABLE: &str = "codeintel_result_chunks";
const DEFINITIONS_TABLE: &str = "codeintel_definitions";
const REFERENCES_TABLE: &str = "codeintel_references";
const IMPLEMENTATIONS_TABLE: &str = "codeintel_implementations";

const ALL_TABLES: [&str; 6] = [
    META_TABLE,
    DOCUMENTS_TABLE,
    RESULT_CHUNKS_TABLE,
    DEFINITIONS_TABLE,
    REFERENCES_TABLE,
    IMPLEMENTATIONS_TABLE,
];

/// SQLite-backed bulk store
#[derive(Clone)]
pub struct SqliteBulkStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBulkStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(open_connection(db_path)?)
    }

    /// In-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (
                upload_id INTEGER PRIMARY KEY,
                lsif_version TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                tool_version TEXT NOT NULL,
                num_result_chunks INTEGER NOT NULL,
                content_digest TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {DOCUMENTS_TABLE} (
                upload_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (upload_id, path)
            );

            CREATE TABLE IF NOT EXISTS {RESULT_CHUNKS_TABLE} (
                upload_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (upload_id, idx)
            );"
        ))?;

        for table in [DEFINITIONS_TABLE, REFERENCES_TABLE, IMPLEMENTATIONS_TABLE] {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    upload_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    scheme TEXT NOT NULL,
                    identifier TEXT NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (upload_id, kind, scheme, identifier)
                );"
            ))?;
        }

        Ok(())
    }

    fn count(conn: &Connection, table: &str, upload_id: i64) -> Result<u64> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE upload_id = ?1"),
            params![upload_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl BulkStore for SqliteBulkStore {
    fn begin(&self) -> Result<Box<dyn BulkTransaction + '_>> {
        let tx = SqliteTransaction::begin(self.conn.lock())?;
        Ok(Box::new(SqliteBulkTransaction { tx }))
    }

    fn content_digest(&self, upload_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT content_digest FROM {META_TABLE} WHERE upload_id = ?1"),
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn purge_upload(&self, upload_id: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut removed = 0u64;
        for table in ALL_TABLES {
            removed += tx.execute(
                &format!("DELETE FROM {table} WHERE upload_id = ?1"),
                params![upload_id],
            )? as u64;
        }

        tx.commit()?;
        Ok(removed)
    }

    fn row_counts(&self, upload_id: i64) -> Result<BulkRowCounts> {
        let conn = self.conn.lock();
        Ok(BulkRowCounts {
            meta: Self::count(&conn, META_TABLE, upload_id)?,
            documents: Self::count(&conn, DOCUMENTS_TABLE, upload_id)?,
            result_chunks: Self::count(&conn, RESULT_CHUNKS_TABLE, upload_id)?,
            definitions: Self::count(&conn, DEFINITIONS_TABLE, upload_id)?,
            references: Self::count(&conn, REFERENCES_TABLE, upload_id)?,
            implementations: Self::count(&conn, IMPLEMENTATIONS_TABLE, upload_id)?,
        })
    }

    fn document(&self, upload_id: i64, path: &str) -> Result<Option<DocumentData>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {DOCUMENTS_TABLE} WHERE upload_id = ?1 AND path = ?2"),
                params![upload_id, path],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

struct SqliteBulkTransaction<'a> {
    tx: SqliteTransaction<'a>,
}

impl SqliteBulkTransaction<'_> {
    fn write_monikers(
        &mut self,
        table: &str,
        upload_id: i64,
        monikers: &[MonikerLocations],
    ) -> Result<u32> {
        let mut stmt = self.tx.conn().prepare(&format!(
            "INSERT INTO {table} (upload_id, kind, scheme, identifier, data)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ))?;

        let mut written = 0u32;
        for moniker in monikers {
            let data = serde_json::to_string(&moniker.locations)?;
            stmt.execute(params![
                upload_id,
                moniker.kind,
                moniker.scheme,
                moniker.identifier,
                data
            ])?;
            written += 1;
        }
        Ok(written)
    }
}

impl BulkTransaction for SqliteBulkTransaction<'_> {
    fn write_meta(&mut self, upload_id: i64, meta: &MetaData, content_digest: &str) -> Result<()> {
        self.tx.conn().execute(
            &format!(
                "INSERT INTO {META_TABLE}
                 (upload_id, lsif_version, tool_name, tool_version, num_result_chunks, content_digest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                upload_id,
                meta.lsif_version,
                meta.tool_name,
                meta.tool_version,
                meta.num_result_chunks,
                content_digest
            ],
        )?;
        Ok(())
    }

    fn write_documents(
        &mut self,
        upload_id: i64,
        documents: &BTreeMap<String, DocumentData>,
    ) -> Result<u32> {
        let mut stmt = self.tx.conn().prepare(&format!(
            "INSERT INTO {DOCUMENTS_TABLE} (upload_id, path, data) VALUES (?1, ?2, ?3)"
        ))?;

        let mut written = 0u32;
        for (path, document) in documents {
            stmt.execute(params![upload_id, path, serde_json::to_string(document)?])?;
            written += 1;
        }
        Ok(written)
    }

    fn write_result_chunks(
        &mut self,
        upload_id: i64,
        result_chunks: &BTreeMap<u32, ResultChunkData>,
    ) -> Result<u32> {
        let mut stmt = self.tx.conn().prepare(&format!(
            "INSERT INTO {RESULT_CHUNKS_TABLE} (upload_id, idx, data) VALUES (?1, ?2, ?3)"
        ))?;

        let mut written = 0u32;
        for (idx, chunk) in result_chunks {
            stmt.execute(params![upload_id, idx, serde_json::to_string(chunk)?])?;
            written += 1;
        }
        Ok(written)
    }

    fn write_definitions(&mut self, upload_id: i64, monikers: &[MonikerLocations]) -> Result<u32> {
        self.write_monikers(DEFINITIONS_TABLE, upload_id, monikers)
    }

    fn write_references(&mut self, upload_id: i64, monikers: &[MonikerLocations]) -> Result<u32> {
        self.write_monikers(REFERENCES_TABLE, upload_id, monikers)
    }

    fn write_implementations(
        &mut self,
        upload_id: i64,
        monikers: &[MonikerLocations],
    ) -> Result<u32> {
        self.write_monikers(IMPLEMENTATIONS_TABLE, upload_id, monikers)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.tx.finish_commit()
    }
}
