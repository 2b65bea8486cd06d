//! Blob stores: raw payload storage keyed by digest.
//!
//! Two backends implement [`BlobStore`]:
//!
//! ```text
//! FileBlobStore                      ColumnBlobStore
//! {objects_dir}/                     blobs.db
//! ├── ab/                            └── blobs(digest, bytes)
//! │   └── cde123...  # payload
//! └── 12/
//!     └── 3456789...
//! ```
//!
//! Blob stores never decide whether an object exists; the index does. They
//! only move bytes once existence has been established.

use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tempfile::NamedTempFile;

use crate::config::BlobStoreConfig;
use crate::error::{Error, Result};
use crate::hash::Digest;

/// Trait for payload storage backends.
pub trait BlobStore: Send + Sync {
    /// Store the payload for a digest. Callers write each digest once;
    /// writing identical bytes again is harmless.
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()>;

    /// Store the payload by copying from a reader. Returns bytes written.
    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64>;

    /// Read the whole payload.
    fn read(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Read `length` bytes starting at `start`.
    fn read_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_range(digest, start, length)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Open a reader over `length` bytes starting at `start`.
    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>>;

    /// Remove the payload. `Error::BlobNotFound` if it was already gone.
    fn delete(&self, digest: &Digest) -> Result<()>;

    fn exists(&self, digest: &Digest) -> bool;
}

impl<B: BlobStore + ?Sized> BlobStore for Box<B> {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        (**self).write(digest, data)
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        (**self).write_from(digest, reader)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        (**self).read(digest)
    }

    fn read_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Vec<u8>> {
        (**self).read_range(digest, start, length)
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        (**self).open_range(digest, start, length)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        (**self).delete(digest)
    }

    fn exists(&self, digest: &Digest) -> bool {
        (**self).exists(digest)
    }
}

impl<B: BlobStore + ?Sized> BlobStore for Arc<B> {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        (**self).write(digest, data)
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        (**self).write_from(digest, reader)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        (**self).read(digest)
    }

    fn read_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Vec<u8>> {
        (**self).read_range(digest, start, length)
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        (**self).open_range(digest, start, length)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        (**self).delete(digest)
    }

    fn exists(&self, digest: &Digest) -> bool {
        (**self).exists(digest)
    }
}

/// Filesystem blob store with two-character directory sharding.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    config: BlobStoreConfig,
}

impl FileBlobStore {
    /// Create a new store, creating the objects directory unless read-only.
    pub fn new(config: BlobStoreConfig) -> Result<Self> {
        if !config.read_only {
            fs::create_dir_all(&config.objects_dir)
                .map_err(|e| Error::from_io(&config.objects_dir, e))?;
        }

        Ok(Self { config })
    }

    /// Create a store at a specific objects directory.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(BlobStoreConfig::at(path))
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    /// Get the path where a payload is (or would be) stored.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        self.config
            .objects_dir
            .join(digest.prefix())
            .join(digest.remainder())
    }

    fn map_err(digest: &Digest, path: &Path, e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::NotFound {
            Error::BlobNotFound(digest.clone())
        } else {
            Error::from_io(path, e)
        }
    }

    /// Write into a temp file next to the final path, then rename it in place.
    fn write_atomic<F>(&self, digest: &Digest, fill: F) -> Result<u64>
    where
        F: FnOnce(&mut File) -> io::Result<u64>,
    {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let path = self.object_path(digest);
        let parent = path
            .parent()
            .ok_or_else(|| Error::Io(io::Error::other("object path has no parent")))?;
        fs::create_dir_all(parent).map_err(|e| Error::from_io(parent, e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::from_io(parent, e))?;
        let written = fill(tmp.as_file_mut()).map_err(|e| Error::from_io(tmp.path(), e))?;
        tmp.as_file_mut()
            .sync_all()
            .map_err(|e| Error::from_io(tmp.path(), e))?;
        self.apply_mode(tmp.as_file())
            .map_err(|e| Error::from_io(tmp.path(), e))?;

        tmp.persist(&path).map_err(|e| Error::from_io(&path, e.error))?;
        Ok(written)
    }

    #[cfg(unix)]
    fn apply_mode(&self, file: &File) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(self.config.file_mode))
    }

    #[cfg(not(unix))]
    fn apply_mode(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.write_atomic(digest, |file| {
            file.write_all(data)?;
            Ok(data.len() as u64)
        })?;
        Ok(())
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        self.write_atomic(digest, |file| io::copy(reader, file))
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        fs::read(&path).map_err(|e| Self::map_err(digest, &path, e))
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(digest);
        let mut file = File::open(&path).map_err(|e| Self::map_err(digest, &path, e))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| Error::from_io(&path, e))?;

        Ok(Box::new(BufReader::with_capacity(
            self.config.chunk_size,
            file.take(length),
        )))
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let path = self.object_path(digest);
        fs::remove_file(&path).map_err(|e| Self::map_err(digest, &path, e))
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }
}

/// Blob store keeping payloads in a column of a SQLite database.
///
/// Uses its own database file so blob writes never contend with the
/// index's write transactions.
#[derive(Debug, Clone)]
pub struct ColumnBlobStore {
    path: PathBuf,
    read_only: bool,
}

impl ColumnBlobStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::from_io(parent, e))?;
        }

        let store = Self {
            path,
            read_only: false,
        };
        store.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                digest TEXT PRIMARY KEY,
                bytes BLOB NOT NULL
            );",
        )?;
        Ok(store)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA journal_mode = WAL;
        ",
        )?;
        Ok(conn)
    }
}

impl BlobStore for ColumnBlobStore {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        self.conn()?.execute(
            "INSERT OR REPLACE INTO blobs (digest, bytes) VALUES (?1, ?2)",
            params![digest.as_str(), data],
        )?;
        Ok(())
    }

    // A column holds the value in one piece, so this buffers.
    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.write(digest, &data)?;
        Ok(data.len() as u64)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.conn()?
            .query_row(
                "SELECT bytes FROM blobs WHERE digest = ?1",
                [digest.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or_else(|| Error::BlobNotFound(digest.clone()))
    }

    fn read_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Vec<u8>> {
        self.conn()?
            .query_row(
                "SELECT substr(bytes, ?2, ?3) FROM blobs WHERE digest = ?1",
                params![digest.as_str(), start as i64 + 1, length as i64],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or_else(|| Error::BlobNotFound(digest.clone()))
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read_range(digest, start, length)?)))
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let rows = self
            .conn()?
            .execute("DELETE FROM blobs WHERE digest = ?1", [digest.as_str()])?;
        if rows == 0 {
            return Err(Error::BlobNotFound(digest.clone()));
        }
        Ok(())
    }

    fn exists(&self, digest: &Digest) -> bool {
        let found = self.conn().and_then(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM blobs WHERE digest = ?1",
                    [digest.as_str()],
                    |_| Ok(()),
                )
                .optional()?)
        });
        matches!(found, Ok(Some(())))
    }
}
