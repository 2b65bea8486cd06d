//! DedupEngine: reference-counted, deduplicating object storage.
//!
//! Objects are identified by a stable integer id and addressed by digest.
//! Adding content that is already stored bumps the existing record's
//! reference count instead of writing a second copy; releasing the last
//! reference deletes both the record and its blob.
//!
//! ```rust,no_run
//! use filedb::{DedupEngine, StoreConfig};
//!
//! let engine = DedupEngine::open(&StoreConfig::with_base_path("/srv/filedb")).unwrap();
//!
//! let first = engine.add(b"Hello, World!", None).unwrap();
//! let second = engine.add(b"Hello, World!", None).unwrap();
//! assert_eq!(first.id, second.id);
//! assert_eq!(second.reference_count, 2);
//!
//! let data = engine.read(first.id, true).unwrap();
//! assert_eq!(data, b"Hello, World!");
//! ```

use std::io::{self, Read};
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, ColumnBlobStore, FileBlobStore};
use crate::config::{Backend, StoreConfig};
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::index::{Decrement, Decremented, Insert, NewObject, ObjectIndex};
use crate::range::{ByteRange, ObjectStream, VerifyingReader};
use crate::record::{MetaField, ObjectId, ObjectRecord, DEFAULT_TIME_FORMAT};
use crate::sniff::{sniff_media_type, SNIFF_LEN};
use crate::spool::{Spool, SpooledContent};

/// Content handed to [`DedupEngine::add`].
pub enum Content<'a> {
    /// An in-memory buffer.
    Bytes(&'a [u8]),
    /// Any reader; spooled to disk while it is hashed.
    Stream(Box<dyn Read + 'a>),
}

impl<'a> Content<'a> {
    pub fn stream(reader: impl Read + 'a) -> Self {
        Content::Stream(Box::new(reader))
    }

    /// Adapt an iterator of chunks into a stream.
    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator + 'a,
        I::IntoIter: 'a,
        I::Item: AsRef<[u8]> + 'a,
    {
        Content::Stream(Box::new(ChunkReader {
            chunks: chunks.into_iter(),
            current: None,
            pos: 0,
        }))
    }
}

impl std::fmt::Debug for Content<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Content::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl<'a> From<&'a [u8]> for Content<'a> {
    fn from(data: &'a [u8]) -> Self {
        Content::Bytes(data)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Content<'a> {
    fn from(data: &'a [u8; N]) -> Self {
        Content::Bytes(data)
    }
}

impl<'a> From<&'a Vec<u8>> for Content<'a> {
    fn from(data: &'a Vec<u8>) -> Self {
        Content::Bytes(data)
    }
}

impl<'a> From<&'a str> for Content<'a> {
    fn from(data: &'a str) -> Self {
        Content::Bytes(data.as_bytes())
    }
}

struct ChunkReader<I: Iterator> {
    chunks: I,
    current: Option<I::Item>,
    pos: usize,
}

impl<I> Read for ChunkReader<I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(chunk) = &self.current {
                let bytes = chunk.as_ref();
                if self.pos < bytes.len() {
                    let n = (bytes.len() - self.pos).min(buf.len());
                    buf[..n].copy_from_slice(&bytes[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }

            match self.chunks.next() {
                Some(chunk) => {
                    self.current = Some(chunk);
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
    }
}

/// Content after hashing, ready to be written.
enum Payload<'a> {
    Bytes { data: &'a [u8], digest: Digest },
    Spooled(SpooledContent),
}

impl Payload<'_> {
    fn digest(&self) -> &Digest {
        match self {
            Payload::Bytes { digest, .. } => digest,
            Payload::Spooled(spooled) => &spooled.digest,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Payload::Bytes { data, .. } => data.len() as u64,
            Payload::Spooled(spooled) => spooled.size,
        }
    }

    fn head(&self) -> &[u8] {
        match self {
            Payload::Bytes { data, .. } => &data[..data.len().min(SNIFF_LEN)],
            Payload::Spooled(spooled) => &spooled.head,
        }
    }

    fn write_blob<B: BlobStore>(&mut self, blobs: &B) -> Result<()> {
        match self {
            Payload::Bytes { data, digest } => blobs.write(digest, *data),
            Payload::Spooled(spooled) => {
                let digest = spooled.digest.clone();
                let file = spooled.rewind()?;
                blobs.write_from(&digest, file)?;
                Ok(())
            }
        }
    }
}

/// How [`DedupEngine::release_with`] treats the reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseMode {
    /// Drop one reference; delete on reaching zero.
    #[default]
    Decrement,
    /// Delete regardless of the count.
    Force,
    /// Drop one reference, flooring at zero, and never delete.
    KeepOnZero,
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The record survives.
    Kept { reference_count: u64 },
    /// Record and blob are gone. `blob_missing` if the blob had already vanished.
    Deleted { blob_missing: bool },
}

/// The storage engine: an index plus a blob store.
///
/// Every operation is safe to call from many threads or processes at once.
/// The index serializes writers; nothing here holds an in-process lock.
pub struct DedupEngine<B = Box<dyn BlobStore>> {
    index: ObjectIndex,
    blobs: B,
    staging_dir: PathBuf,
    chunk_size: usize,
    insert_retries: u32,
    read_only: bool,
}

impl<B> std::fmt::Debug for DedupEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("index", &self.index.path())
            .field("staging_dir", &self.staging_dir)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl DedupEngine {
    /// Open the store described by `config`, choosing the configured backend.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let index = ObjectIndex::open(config.index_path())?;
        let blobs: Box<dyn BlobStore> = match config.backend {
            Backend::Files => Box::new(FileBlobStore::new(config.blob_store())?),
            Backend::Column => Box::new(
                ColumnBlobStore::open(config.blobs_db_path())?.read_only(config.read_only),
            ),
        };

        debug!(
            base_path = %config.base_path.display(),
            backend = ?config.backend,
            "opened store"
        );
        Ok(Self::new(index, blobs, config))
    }
}

impl<B: BlobStore> DedupEngine<B> {
    /// Assemble an engine from parts. Only the staging directory, chunk
    /// size, retry bound and read-only flag are taken from `config`.
    pub fn new(index: ObjectIndex, blobs: B, config: &StoreConfig) -> Self {
        Self {
            index,
            blobs,
            staging_dir: config.staging_dir(),
            chunk_size: config.chunk_size,
            insert_retries: config.insert_retries.max(1),
            read_only: config.read_only,
        }
    }

    pub fn index(&self) -> &ObjectIndex {
        &self.index
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn require(&self, id: ObjectId) -> Result<ObjectRecord> {
        self.index.get(id)?.ok_or(Error::NotFound(id))
    }

    fn blob_error(record: &ObjectRecord, err: Error) -> Error {
        match err {
            Error::BlobNotFound(digest) => {
                warn!(id = %record.id, digest = %digest, "record has no blob");
                Error::MissingBlob {
                    id: record.id,
                    digest,
                }
            }
            other => other,
        }
    }

    /// Store content, or take another reference to an identical object.
    ///
    /// Returns the record with its updated reference count. The media type
    /// is sniffed from the leading bytes unless `known_media_type` is given;
    /// it only applies when a new record is created.
    pub fn add<'a>(
        &self,
        content: impl Into<Content<'a>>,
        known_media_type: Option<&str>,
    ) -> Result<ObjectRecord> {
        self.ensure_writable()?;

        let mut payload = match content.into() {
            Content::Bytes(data) => Payload::Bytes {
                data,
                digest: Digest::of(data),
            },
            Content::Stream(mut reader) => {
                let mut spool = Spool::create_in(&self.staging_dir)?;
                spool.fill_from(&mut reader, self.chunk_size)?;
                Payload::Spooled(spool.finish()?)
            }
        };

        if payload.size() == 0 {
            return Err(Error::EmptyContent);
        }
        let digest = payload.digest().clone();

        for attempt in 1..=self.insert_retries {
            if let Some(existing) = self.index.get_by_digest(&digest)? {
                if !self.blobs.exists(&digest) {
                    warn!(id = %existing.id, digest = %digest, "restoring missing blob");
                    payload.write_blob(&self.blobs)?;
                }

                match self.index.increment_references(existing.id)? {
                    Some(record) => {
                        debug!(
                            id = %record.id,
                            reference_count = record.reference_count,
                            "dedup hit"
                        );
                        return Ok(record);
                    }
                    None => {
                        debug!(id = %existing.id, attempt, "record released during add, retrying");
                        continue;
                    }
                }
            }

            let media_type = match known_media_type {
                Some(media_type) => media_type.to_string(),
                None => sniff_media_type(payload.head()).to_string(),
            };

            payload
                .write_blob(&self.blobs)
                .map_err(|e| Error::BlobWrite {
                    digest: digest.clone(),
                    source: Box::new(e),
                })?;

            let new = NewObject {
                digest: &digest,
                media_type: &media_type,
                size: payload.size(),
                created_at: Utc::now(),
            };

            match self.index.insert(&new)? {
                Insert::Created(record) => {
                    // A release of an older record with this digest may have
                    // removed the blob between our write and the insert.
                    if !self.blobs.exists(&digest) {
                        warn!(id = %record.id, digest = %digest, "blob removed during add, rewriting");
                        payload.write_blob(&self.blobs)?;
                    }
                    debug!(id = %record.id, size = record.size, media_type = %record.media_type, "stored new object");
                    return Ok(record);
                }
                Insert::DigestTaken => {
                    warn!(digest = %digest, attempt, "lost insert race, fetching winner");
                }
            }
        }

        Err(Error::Conflict {
            digest,
            attempts: self.insert_retries,
        })
    }

    /// Read an object's full payload.
    ///
    /// With `verify` the payload is checked against the recorded size and
    /// digest. A blob of the wrong length fails with `SizeMismatch` before
    /// its digest is compared, so callers looking for damaged data should
    /// match on [`Error::is_consistency`] rather than on `Corrupted` alone.
    /// The access counters are updated once the blob has been read.
    pub fn read(&self, id: ObjectId, verify: bool) -> Result<Vec<u8>> {
        let record = self.require(id)?;
        let data = self
            .blobs
            .read(&record.digest)
            .map_err(|e| Self::blob_error(&record, e))?;
        self.record_access(id)?;

        if verify {
            verify_payload(&record, &data)?;
        }
        debug!(id = %id, size = data.len(), "read object");
        Ok(data)
    }

    /// Stream an object, or a byte range of it, in chunks.
    ///
    /// Verification only applies to full-object streams; it fails the final
    /// read with `io::ErrorKind::InvalidData` if the bytes do not match.
    pub fn stream(&self, id: ObjectId, range: ByteRange, verify: bool) -> Result<ObjectStream> {
        let record = self.require(id)?;
        let resolved = range.resolve(record.size);
        let reader = self
            .blobs
            .open_range(&record.digest, resolved.start, resolved.length)
            .map_err(|e| Self::blob_error(&record, e))?;
        self.record_access(id)?;

        let reader: Box<dyn Read + Send> = if verify && !resolved.is_partial() {
            Box::new(VerifyingReader::new(reader, record.clone()))
        } else {
            reader
        };

        debug!(id = %id, start = resolved.start, length = resolved.length, "streaming object");
        Ok(ObjectStream::new(record, resolved, reader, self.chunk_size))
    }

    /// Whether the blob exists and matches the recorded size and digest.
    ///
    /// Never fails and never counts as an access.
    pub fn consistent(&self, id: ObjectId) -> bool {
        let Ok(Some(record)) = self.index.get(id) else {
            return false;
        };
        let Ok(reader) = self.blobs.open_range(&record.digest, 0, record.size) else {
            return false;
        };
        // A longer blob still reads `size` bytes, so check the real length too.
        let Ok(full) = self.blobs.open_range(&record.digest, record.size, 1) else {
            return false;
        };
        match (Digest::of_reader(reader), Digest::of_reader(full)) {
            (Ok((digest, size)), Ok((_, 0))) => size == record.size && digest == record.digest,
            _ => false,
        }
    }

    /// Count an access without reading anything.
    pub fn touch(&self, id: ObjectId) -> Result<ObjectRecord> {
        self.ensure_writable()?;
        self.index
            .update_access_stats(id, Utc::now())?
            .ok_or(Error::NotFound(id))
    }

    fn record_access(&self, id: ObjectId) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.index.update_access_stats(id, Utc::now())?.is_none() {
            debug!(id = %id, "record released while being read");
        }
        Ok(())
    }

    /// Take another reference to an existing object.
    pub fn retain(&self, id: ObjectId) -> Result<ObjectRecord> {
        self.ensure_writable()?;
        let record = self
            .index
            .increment_references(id)?
            .ok_or(Error::NotFound(id))?;
        debug!(id = %id, reference_count = record.reference_count, "retained object");
        Ok(record)
    }

    /// Drop one reference, or all of them with `force`.
    pub fn release(&self, id: ObjectId, force: bool) -> Result<Release> {
        let mode = if force {
            ReleaseMode::Force
        } else {
            ReleaseMode::Decrement
        };
        self.release_with(id, mode)
    }

    /// Delete the object outright, whatever its reference count.
    pub fn purge(&self, id: ObjectId) -> Result<Release> {
        self.release_with(id, ReleaseMode::Force)
    }

    /// Release with an explicit mode.
    ///
    /// The blob is deleted inside the same index transaction that removes
    /// the record. If the blob cannot be deleted (permissions, read-only)
    /// nothing changes and the error is returned, so the call can be retried.
    pub fn release_with(&self, id: ObjectId, mode: ReleaseMode) -> Result<Release> {
        self.ensure_writable()?;

        let (decrement, keep_on_zero) = match mode {
            ReleaseMode::Decrement => (Decrement::One, false),
            ReleaseMode::Force => (Decrement::ToZero, false),
            ReleaseMode::KeepOnZero => (Decrement::One, true),
        };

        let outcome = self
            .index
            .decrement_references(id, decrement, keep_on_zero, |record| self.delete_blob(record))?
            .ok_or(Error::NotFound(id))?;

        match outcome {
            Decremented::Kept(record) => {
                debug!(id = %id, reference_count = record.reference_count, "released reference");
                Ok(Release::Kept {
                    reference_count: record.reference_count,
                })
            }
            Decremented::Deleted(record, blob_missing) => {
                info!(id = %id, digest = %record.digest, size = record.size, "deleted object");
                Ok(Release::Deleted { blob_missing })
            }
        }
    }

    /// Delete every record with a zero reference count, blobs included.
    ///
    /// Records retained again while the sweep runs are left alone.
    pub fn sweep(&self) -> Result<Vec<ObjectRecord>> {
        self.ensure_writable()?;

        let mut swept = Vec::new();
        for id in self.index.unreferenced()? {
            if let Some((record, _)) = self
                .index
                .delete_unreferenced(id, |record| self.delete_blob(record))?
            {
                info!(id = %id, size = record.size, "swept unreferenced object");
                swept.push(record);
            }
        }
        Ok(swept)
    }

    /// Forget a record but leave its blob in place.
    pub fn untrack(&self, id: ObjectId) -> Result<ObjectRecord> {
        self.ensure_writable()?;
        let record = self.index.delete(id)?.ok_or(Error::NotFound(id))?;
        info!(id = %id, digest = %record.digest, "untracked object");
        Ok(record)
    }

    /// `Ok(true)` when the blob was already gone.
    fn delete_blob(&self, record: &ObjectRecord) -> Result<bool> {
        match self.blobs.delete(&record.digest) {
            Ok(()) => Ok(false),
            Err(Error::BlobNotFound(_)) => {
                warn!(id = %record.id, digest = %record.digest, "blob already gone during delete");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        self.index.get(id)
    }

    pub fn get_by_digest(&self, digest: &Digest) -> Result<Option<ObjectRecord>> {
        self.index.get_by_digest(digest)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<ObjectRecord>> {
        self.index.list()
    }

    /// The `limit` biggest records, largest first.
    pub fn largest(&self, limit: usize) -> Result<Vec<ObjectRecord>> {
        self.index.largest(limit)
    }

    /// A single metadata field rendered as text.
    pub fn field(&self, id: ObjectId, field: MetaField) -> Result<String> {
        Ok(self.require(id)?.field(field, DEFAULT_TIME_FORMAT))
    }
}

fn verify_payload(record: &ObjectRecord, data: &[u8]) -> Result<()> {
    if data.len() as u64 != record.size {
        let err = Error::SizeMismatch {
            id: record.id,
            expected: record.size,
            actual: data.len() as u64,
        };
        warn!("{}", err);
        return Err(err);
    }

    let actual = Digest::of(data);
    if actual != record.digest {
        let err = Error::Corrupted {
            id: record.id,
            expected: record.digest.clone(),
            actual,
        };
        warn!("{}", err);
        return Err(err);
    }
    Ok(())
}
