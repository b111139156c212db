//! SQLite adapters
//!
//! - `SqliteJobStore`: one queue table per store instance
//! - `SqliteBulkStore`: bulk analysis tables
//! - `SqliteMetadataStore`: relational bookkeeping
//!
//! Every store owns its own connection. Several stores may point at the same
//! database file; writers take `BEGIN IMMEDIATE` and wait on `busy_timeout`.

mod bulk_store;
mod job_store;
mod metadata_store;
mod transaction;

pub use bulk_store::SqliteBulkStore;
pub use job_store::SqliteJobStore;
pub use metadata_store::SqliteMetadataStore;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;

use crate::error::{Result, StorageError};

const BUSY_TIMEOUT_MS: u32 = 5_000;

pub(crate) fn open_connection(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
        BUSY_TIMEOUT_MS
    ))?;
    Ok(conn)
}

pub(crate) fn open_in_memory() -> Result<Connection> {
    Ok(Connection::open_in_memory()?)
}

/// Table and savepoint names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StorageError::config(format!("Invalid SQL identifier: {:?}", name)))
    }
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
