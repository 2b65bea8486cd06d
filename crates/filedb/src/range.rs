//! Byte ranges and chunked object streams for partial-content reads.

use std::io::{self, Read};

use crate::error::Error;
use crate::hash::{Digest, DigestWriter};
use crate::record::ObjectRecord;

/// A requested byte range. `end` is inclusive. Both `None` means the whole object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    pub const FULL: ByteRange = ByteRange {
        start: None,
        end: None,
    };

    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self {
            start: Some(start),
            end,
        }
    }

    pub fn resolve(&self, total_size: u64) -> ResolvedRange {
        resolve(total_size, self.start, self.end)
    }
}

/// A range clamped to an object's actual size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub length: u64,
    /// Last byte served, inclusive.
    pub end: u64,
    pub total_size: u64,
}

impl ResolvedRange {
    /// `(start, length)`
    pub fn span(&self) -> (u64, u64) {
        (self.start, self.length)
    }

    /// Whether this covers less than the whole object.
    pub fn is_partial(&self) -> bool {
        self.length < self.total_size
    }

    /// `Content-Range` header value, e.g. `bytes 50-59/100`.
    pub fn content_range(&self) -> String {
        if self.length == 0 {
            format!("bytes */{}", self.total_size)
        } else {
            format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
        }
    }
}

/// Resolve a requested range against an object of `total_size` bytes.
///
/// A start at or past the end of the object is treated as "no range" and
/// serves the whole object rather than failing. An end past the last byte is
/// clamped to it, and an end before the start is ignored.
pub fn resolve(total_size: u64, requested_start: Option<u64>, requested_end: Option<u64>) -> ResolvedRange {
    let start = match requested_start {
        Some(start) if start < total_size => start,
        _ => 0,
    };

    let length = match requested_end {
        Some(end) if end >= start && total_size > 0 => end.min(total_size - 1) - start + 1,
        _ => total_size - start,
    };

    ResolvedRange {
        start,
        length,
        end: (start + length).saturating_sub(1),
        total_size,
    }
}

/// Extract `(start, end)` from a `Range` header such as `bytes=50-59` or `bytes=50-`.
///
/// Only the first `start-end` pair is used. Returns `None` when the header
/// carries no usable pair (including suffix ranges like `bytes=-500`).
pub fn parse_range_header(header: &str) -> Option<ByteRange> {
    let bytes = header.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let start_at = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'-' {
            continue;
        }

        let start = header[start_at..i].parse().ok()?;
        let end_at = i + 1;
        let mut j = end_at;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let end = if j > end_at {
            Some(header[end_at..j].parse().ok()?)
        } else {
            None
        };
        return Some(ByteRange::new(start, end));
    }

    None
}

/// A chunked reader over (part of) an object's payload.
///
/// Reads as `io::Read`, or iterates `chunk_size` chunks.
pub struct ObjectStream {
    record: ObjectRecord,
    range: ResolvedRange,
    reader: Box<dyn Read + Send>,
    chunk_size: usize,
}

impl ObjectStream {
    pub(crate) fn new(
        record: ObjectRecord,
        range: ResolvedRange,
        reader: Box<dyn Read + Send>,
        chunk_size: usize,
    ) -> Self {
        Self {
            record,
            range,
            reader,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn record(&self) -> &ObjectRecord {
        &self.record
    }

    pub fn range(&self) -> &ResolvedRange {
        &self.range
    }

    pub fn media_type(&self) -> &str {
        &self.record.media_type
    }

    /// Read the remaining bytes into memory.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.range.length as usize);
        self.reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("id", &self.record.id)
            .field("range", &self.range)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Read for ObjectStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Iterator for ObjectStream {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < chunk.len() {
            match self.reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }

        if filled == 0 {
            return None;
        }
        chunk.truncate(filled);
        Some(Ok(chunk))
    }
}

/// Hashes bytes as they pass through and checks them at EOF.
///
/// A mismatch surfaces as an `InvalidData` error wrapping the engine's
/// consistency error, so a stream never ends cleanly on corrupted data.
pub(crate) struct VerifyingReader<R> {
    inner: R,
    hasher: Option<DigestWriter>,
    record: ObjectRecord,
}

impl<R: Read> VerifyingReader<R> {
    pub(crate) fn new(inner: R, record: ObjectRecord) -> Self {
        Self {
            inner,
            hasher: Some(DigestWriter::new()),
            record,
        }
    }

    fn check(&mut self) -> io::Result<()> {
        let Some(hasher) = self.hasher.take() else {
            return Ok(());
        };
        let (actual, size): (Digest, u64) = hasher.finish();

        let err = if size != self.record.size {
            Error::SizeMismatch {
                id: self.record.id,
                expected: self.record.size,
                actual: size,
            }
        } else if actual != self.record.digest {
            Error::Corrupted {
                id: self.record.id,
                expected: self.record.digest.clone(),
                actual,
            }
        } else {
            return Ok(());
        };

        tracing::warn!("{}", err);
        Err(io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.check()?;
        } else if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
