//! The `digest → record` index, backed by SQLite.
//!
//! This is the single source of truth for object existence. Every mutation
//! is one statement or one IMMEDIATE transaction, so concurrent workers
//! (threads or processes sharing the file) never lose an update.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};

use crate::error::Result;
use crate::hash::Digest;
use crate::record::{ObjectId, ObjectRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    digest TEXT NOT NULL UNIQUE,
    media_type TEXT NOT NULL,
    size INTEGER NOT NULL CHECK (size >= 0),
    reference_count INTEGER NOT NULL CHECK (reference_count >= 0),
    created_at TEXT NOT NULL,
    last_access_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0 CHECK (access_count >= 0)
);
CREATE INDEX IF NOT EXISTS idx_objects_size ON objects(size DESC);
"#;

const COLUMNS: &str =
    "id, digest, media_type, size, reference_count, created_at, last_access_at, access_count";

/// Fields for a record that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewObject<'a> {
    pub digest: &'a Digest,
    pub media_type: &'a str,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an insert attempt.
#[derive(Debug)]
pub enum Insert {
    Created(ObjectRecord),
    /// Another record already owns this digest.
    DigestTaken,
}

/// How a release changes the reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// Subtract one.
    One,
    /// Drop straight to zero.
    ToZero,
}

/// Outcome of a decrement.
#[derive(Debug)]
pub enum Decremented<T> {
    /// The record survives with this state.
    Kept(ObjectRecord),
    /// The record reached zero and was deleted; carries the `on_zero` result.
    Deleted(ObjectRecord, T),
}

/// SQLite-backed object index with connection-per-call.
#[derive(Debug, Clone)]
pub struct ObjectIndex {
    path: PathBuf,
}

impl ObjectIndex {
    /// Open the index at path, creating the file and schema if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::Error::from_io(parent, e))?;
        }

        let index = Self { path };
        index.conn()?.execute_batch(SCHEMA)?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a connection with WAL mode and busy timeout.
    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA journal_mode = WAL;
        ",
        )?;

        Ok(conn)
    }

    pub fn get(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM objects WHERE id = ?1"),
                [id.0],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_digest(&self, digest: &Digest) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM objects WHERE digest = ?1"),
                [digest.as_str()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a new record with one reference.
    ///
    /// The UNIQUE constraint on `digest` decides concurrent creators: the
    /// loser gets `Insert::DigestTaken` and should fetch the winner.
    pub fn insert(&self, new: &NewObject<'_>) -> Result<Insert> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!(
                "INSERT INTO objects (digest, media_type, size, reference_count, created_at, access_count)
                 VALUES (?1, ?2, ?3, 1, ?4, 0)
                 RETURNING {COLUMNS}"
            ),
            params![
                new.digest.as_str(),
                new.media_type,
                new.size as i64,
                timestamp(&new.created_at),
            ],
            record_from_row,
        );

        match result {
            Ok(record) => Ok(Insert::Created(record)),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(Insert::DigestTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically add one reference. `None` if the record is gone.
    pub fn increment_references(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "UPDATE objects SET reference_count = reference_count + 1
                     WHERE id = ?1 RETURNING {COLUMNS}"
                ),
                [id.0],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Overwrite the reference count. Zero is allowed here; callers that set
    /// zero own the decision to keep or delete the record.
    pub fn set_reference_count(&self, id: ObjectId, count: u64) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "UPDATE objects SET reference_count = ?2
                     WHERE id = ?1 RETURNING {COLUMNS}"
                ),
                params![id.0, count as i64],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Atomically bump the access counter and stamp the access time.
    pub fn update_access_stats(
        &self,
        id: ObjectId,
        at: DateTime<Utc>,
    ) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "UPDATE objects SET access_count = access_count + 1, last_access_at = ?2
                     WHERE id = ?1 RETURNING {COLUMNS}"
                ),
                params![id.0, timestamp(&at)],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Decrement the reference count and delete the record if it reaches zero.
    ///
    /// Runs in one IMMEDIATE transaction: concurrent releases are serialized
    /// and exactly one of them sees the transition to zero. `on_zero` runs
    /// inside the transaction before the row is deleted (this is where the
    /// blob goes); if it fails the whole release is rolled back. With
    /// `keep_on_zero` the record is floored at zero and kept.
    pub fn decrement_references<T, F>(
        &self,
        id: ObjectId,
        decrement: Decrement,
        keep_on_zero: bool,
        on_zero: F,
    ) -> Result<Option<Decremented<T>>>
    where
        F: FnOnce(&ObjectRecord) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = tx
            .query_row(
                &format!(
                    "UPDATE objects SET reference_count =
                        CASE WHEN ?2 THEN 0 ELSE MAX(reference_count - 1, 0) END
                     WHERE id = ?1 RETURNING {COLUMNS}"
                ),
                params![id.0, decrement == Decrement::ToZero],
                record_from_row,
            )
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };

        if record.reference_count > 0 || keep_on_zero {
            tx.commit()?;
            return Ok(Some(Decremented::Kept(record)));
        }

        let outcome = on_zero(&record)?;
        tx.execute("DELETE FROM objects WHERE id = ?1", [id.0])?;
        tx.commit()?;

        Ok(Some(Decremented::Deleted(record, outcome)))
    }

    /// Remove a record regardless of its count. Blobs are the caller's business.
    pub fn delete(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("DELETE FROM objects WHERE id = ?1 RETURNING {COLUMNS}"),
                [id.0],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Delete a record only while its reference count is zero.
    ///
    /// Same transaction shape as [`decrement_references`](Self::decrement_references):
    /// `on_delete` runs before the row goes and a failure rolls back.
    pub fn delete_unreferenced<T, F>(&self, id: ObjectId, on_delete: F) -> Result<Option<(ObjectRecord, T)>>
    where
        F: FnOnce(&ObjectRecord) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM objects WHERE id = ?1 AND reference_count = 0"),
                [id.0],
                record_from_row,
            )
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };

        let outcome = on_delete(&record)?;
        tx.execute("DELETE FROM objects WHERE id = ?1", [id.0])?;
        tx.commit()?;

        Ok(Some((record, outcome)))
    }

    /// Ids of records nothing references.
    pub fn unreferenced(&self) -> Result<Vec<ObjectId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM objects WHERE reference_count = 0 ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| Ok(ObjectId(row.get(0)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<ObjectRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM objects ORDER BY id ASC"))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The biggest records first.
    pub fn largest(&self, limit: usize) -> Result<Vec<ObjectRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM objects ORDER BY size DESC, id ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let digest: String = row.get(1)?;
    let digest = digest.parse::<Digest>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_access_at = match row.get::<_, Option<String>>(6)? {
        Some(s) => Some(parse_timestamp(6, &s)?),
        None => None,
    };

    Ok(ObjectRecord {
        id: ObjectId(row.get(0)?),
        digest,
        media_type: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        reference_count: row.get::<_, i64>(4)? as u64,
        created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        last_access_at,
        access_count: row.get::<_, i64>(7)? as u64,
    })
}
