//! SQLite transaction with named savepoints
//!
//! Shared by the bulk and metadata stores. The connection stays locked for
//! the lifetime of the transaction; dropping it unfinished rolls back.

use parking_lot::MutexGuard;
use rusqlite::Connection;
use tracing::warn;

use super::validate_identifier;
use crate::domain::ports::NestedTransaction;
use crate::error::{Result, StorageError};

/// Explicit `BEGIN IMMEDIATE … COMMIT` over a locked connection, with named
/// savepoints. Rolled back on drop unless finished.
pub(crate) struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    marks: Vec<String>,
    finished: bool,
}

impl<'a> SqliteTransaction<'a> {
    pub(crate) fn begin(conn: MutexGuard<'a, Connection>) -> Result<Self> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            StorageError::transaction(format!("Failed to begin transaction: {}", e)).with_source(e)
        })?;
        Ok(Self {
            conn,
            marks: Vec::new(),
            finished: false,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(StorageError::transaction("Transaction already finished"));
        }
        Ok(())
    }

    fn ensure_mark(&self, name: &str) -> Result<()> {
        if !self.marks.iter().any(|m| m == name) {
            return Err(StorageError::transaction(format!("Unknown savepoint: {}", name)));
        }
        Ok(())
    }

    pub(crate) fn finish_commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.conn.execute_batch("COMMIT").map_err(|e| {
            StorageError::transaction(format!("Failed to commit transaction: {}", e))
                .with_source(e)
        })?;
        self.finished = true;
        Ok(())
    }

    pub(crate) fn finish_rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.finished = true;
        self.conn.execute_batch("ROLLBACK").map_err(|e| {
            StorageError::transaction(format!("Failed to roll back transaction: {}", e))
                .with_source(e)
        })
    }
}

impl NestedTransaction for SqliteTransaction<'_> {
    fn mark(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_identifier(name)?;
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        self.marks.push(name.to_string());
        Ok(())
    }

    fn rollback_to_mark(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.ensure_mark(name)?;
        self.conn.execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", name))?;
        Ok(())
    }

    fn release_mark(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.ensure_mark(name)?;
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {}", name))?;
        // Releasing a savepoint also releases every savepoint set after it
        if let Some(pos) = self.marks.iter().rposition(|m| m == name) {
            self.marks.truncate(pos);
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish_commit()
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish_rollback()
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}
