//! Digest: the full 256-bit BLAKE3 hash of an object's bytes (64 hex chars).
//!
//! The digest is both the dedup key and the blob address. Hashing a byte
//! slice, a sequence of chunks, or a reader all produce the same digest for
//! the same total byte sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Hex length of a digest.
pub const DIGEST_HEX_LEN: usize = 64;

const READ_CHUNK: usize = 64 * 1024;

/// A content digest - 256 bits (32 bytes, 64 hex chars) of BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

/// Errors that can occur when parsing digests.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid digest length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in digest")]
    InvalidHex,
}

impl Digest {
    /// Hash a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self::from_hash(blake3::hash(data))
    }

    /// Hash a sequence of chunks as if they were one contiguous buffer.
    pub fn of_chunks<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for chunk in chunks {
            hasher.update(chunk.as_ref());
        }
        Self::from_hash(hasher.finalize())
    }

    /// Hash everything a reader yields, reading in fixed-size chunks.
    ///
    /// Returns the digest and the number of bytes consumed.
    pub fn of_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut writer = DigestWriter::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            writer.update(&buf[..n]);
        }
        Ok(writer.finish())
    }

    fn from_hash(hash: blake3::Hash) -> Self {
        Self(hex::encode(hash.as_bytes()))
    }

    /// Create from an existing hex string (validates format, lowercases).
    pub fn from_str_checked(s: &str) -> Result<Self, HashError> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    /// First 2 characters, used for directory sharding.
    pub fn prefix(&self) -> &str {
        &self.0[0..2]
    }

    /// Remainder after the prefix, used as the file name.
    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str_checked(&s)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An `io::Write` sink that hashes and counts everything written to it.
///
/// Used to hash a stream while it is being copied somewhere else.
#[derive(Debug, Default)]
pub struct DigestWriter {
    hasher: blake3::Hasher,
    len: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> (Digest, u64) {
        (Digest::from_hash(self.hasher.finalize()), self.len)
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
