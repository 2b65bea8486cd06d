//! Store configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `FILEDB_PATH`: Base path for the store
//! - `FILEDB_READONLY`: Set to "true" for read-only mode
//! - `FILEDB_FILE_MODE`: Octal permission bits for blob files (e.g. "640")
//!
//! Default path: `~/.filedb`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_INSERT_RETRIES: u32 = 5;

/// Where blob payloads live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One file per digest under `{base_path}/objects/`.
    #[default]
    Files,
    /// Payload column in a sibling `blobs.db` SQLite file.
    Column,
}

/// Configuration for the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base path. The index lives at `{base_path}/index.db`, blobs under
    /// `{base_path}/objects/`, spooled uploads under `{base_path}/staging/`.
    pub base_path: PathBuf,

    /// Permission bits applied to new blob files.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,

    /// Chunk size for spooling uploads and streaming reads.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Read-only mode - prevents any writes.
    #[serde(default)]
    pub read_only: bool,

    /// How often a losing concurrent creator retries insert-or-fetch.
    #[serde(default = "default_insert_retries")]
    pub insert_retries: u32,

    #[serde(default)]
    pub backend: Backend,
}

fn default_file_mode() -> u32 {
    DEFAULT_FILE_MODE
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_insert_retries() -> u32 {
    DEFAULT_INSERT_RETRIES
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::with_base_path(default_store_path())
    }
}

/// Get the default store path (~/.filedb).
fn default_store_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".filedb"))
        .unwrap_or_else(|| PathBuf::from(".filedb"))
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let base_path = env::var("FILEDB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_store_path());

        let read_only = env::var("FILEDB_READONLY")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let file_mode = match env::var("FILEDB_FILE_MODE") {
            Ok(v) => u32::from_str_radix(v.trim_start_matches("0o"), 8)
                .with_context(|| format!("FILEDB_FILE_MODE is not octal: {v}"))?,
            Err(_) => DEFAULT_FILE_MODE,
        };

        Ok(Self {
            read_only,
            file_mode,
            ..Self::with_base_path(base_path)
        })
    }

    /// Load configuration from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[filedb]` section:
    /// ```toml
    /// [filedb]
    /// base_path = "/srv/filedb"
    /// file_mode = 0o640
    /// backend = "files"
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        if let Some(section) = table.get("filedb") {
            let config: StoreConfig = section
                .clone()
                .try_into()
                .context("failed to parse [filedb] section")?;
            Ok(config)
        } else {
            Self::from_env()
        }
    }

    /// Create a config with a specific base path.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            file_mode: DEFAULT_FILE_MODE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_only: false,
            insert_retries: DEFAULT_INSERT_RETRIES,
            backend: Backend::Files,
        }
    }

    /// Create a read-only config with a specific base path.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::with_base_path(path)
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join("staging")
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join("index.db")
    }

    /// Payload database for the column backend.
    pub fn blobs_db_path(&self) -> PathBuf {
        self.base_path.join("blobs.db")
    }

    /// The slice of this config a file blob store needs.
    pub fn blob_store(&self) -> BlobStoreConfig {
        BlobStoreConfig {
            objects_dir: self.objects_dir(),
            file_mode: self.file_mode,
            chunk_size: self.chunk_size,
            read_only: self.read_only,
        }
    }
}

/// Explicit configuration handed to a file blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStoreConfig {
    pub objects_dir: PathBuf,
    pub file_mode: u32,
    pub chunk_size: usize,
    pub read_only: bool,
}

impl BlobStoreConfig {
    pub fn at(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            file_mode: DEFAULT_FILE_MODE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_only: false,
        }
    }
}
