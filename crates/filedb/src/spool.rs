//! Spool: temporary on-disk staging for streamed uploads.
//!
//! A streamed `add` cannot know its digest until the last byte arrives, so
//! the stream is copied into a spool file while being hashed. Memory stays
//! bounded by the chunk size. The spool file is deleted when the handle is
//! dropped, whether the add succeeded, failed, or was abandoned.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   └── ab/cde123...     # Stored content
//! └── staging/
//!     └── .tmpXXXXXX       # In-progress upload
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::hash::{Digest, DigestWriter};
use crate::sniff::SNIFF_LEN;

/// An in-progress spool file.
#[derive(Debug)]
pub struct Spool {
    file: NamedTempFile,
    hasher: DigestWriter,
    head: Vec<u8>,
}

impl Spool {
    /// Create a new spool file inside `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::from_io(dir, e))?;
        let file = NamedTempFile::new_in(dir).map_err(|e| Error::from_io(dir, e))?;

        Ok(Self {
            file,
            hasher: DigestWriter::new(),
            head: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.hasher.len()
    }

    /// Append a chunk.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.hasher.update(data);

        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }
        Ok(())
    }

    /// Drain a reader into the spool, `chunk_size` bytes at a time.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R, chunk_size: usize) -> io::Result<u64> {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let start = self.bytes_written();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.write(&buf[..n])?;
        }
        Ok(self.bytes_written() - start)
    }

    /// Flush, rewind, and hand over the sealed spool.
    pub fn finish(mut self) -> Result<SpooledContent> {
        let path = self.file.path().to_path_buf();
        self.file.flush().map_err(|e| Error::from_io(&path, e))?;
        self.file
            .as_file_mut()
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::from_io(&path, e))?;

        let (digest, size) = self.hasher.finish();
        Ok(SpooledContent {
            file: self.file,
            digest,
            size,
            head: self.head,
        })
    }
}

/// A fully spooled upload with its digest known.
#[derive(Debug)]
pub struct SpooledContent {
    file: NamedTempFile,
    pub digest: Digest,
    pub size: u64,
    /// Leading bytes for media type sniffing.
    pub head: Vec<u8>,
}

impl SpooledContent {
    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    /// A reader over the spooled bytes, from the start.
    pub fn rewind(&mut self) -> Result<&mut File> {
        let path = self.path();
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::from_io(&path, e))?;
        Ok(file)
    }
}
