//! Behavioural properties of the store, exercised through the public API.

use std::fs;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use filedb::{
    Backend, BlobStore, ByteRange, Census, Content, DedupEngine, Digest, Error, FileBlobStore,
    ObjectId, ObjectIndex, PayloadSlot, ReconcileAction, Reconciler, Release, Result, StoreConfig,
};
use filedb::index::NewObject;
use tempfile::TempDir;

/// Counts payload writes so dedup can be observed directly.
struct CountingBlobs {
    inner: FileBlobStore,
    writes: AtomicUsize,
}

impl CountingBlobs {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlobStore for CountingBlobs {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(digest, data)
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_from(digest, reader)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.inner.read(digest)
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        self.inner.open_range(digest, start, length)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        self.inner.delete(digest)
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.inner.exists(digest)
    }
}

fn counting_engine(dir: &TempDir) -> DedupEngine<CountingBlobs> {
    let config = StoreConfig::with_base_path(dir.path());
    let index = ObjectIndex::open(config.index_path()).unwrap();
    let blobs = CountingBlobs {
        inner: FileBlobStore::new(config.blob_store()).unwrap(),
        writes: AtomicUsize::new(0),
    };
    DedupEngine::new(index, blobs, &config)
}

/// Fails writes or deletes on demand, the way a read-only mount or a
/// permissions change would.
struct FaultyBlobs {
    inner: FileBlobStore,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FaultyBlobs {
    fn denied(digest: &Digest) -> Error {
        Error::Permission {
            path: digest.as_str().into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
    }
}

impl BlobStore for FaultyBlobs {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::denied(digest));
        }
        self.inner.write(digest, data)
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::denied(digest));
        }
        self.inner.write_from(digest, reader)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.inner.read(digest)
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        self.inner.open_range(digest, start, length)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::denied(digest));
        }
        self.inner.delete(digest)
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.inner.exists(digest)
    }
}

fn faulty_engine(dir: &TempDir) -> DedupEngine<FaultyBlobs> {
    let config = StoreConfig::with_base_path(dir.path());
    let index = ObjectIndex::open(config.index_path()).unwrap();
    let blobs = FaultyBlobs {
        inner: FileBlobStore::new(config.blob_store()).unwrap(),
        fail_writes: AtomicBool::new(false),
        fail_deletes: AtomicBool::new(false),
    };
    DedupEngine::new(index, blobs, &config)
}

/// Replaces the record for a digest whenever the engine looks at it, so
/// every insert-or-fetch attempt finds a record that is gone by the time
/// it takes a reference.
struct ChurningBlobs {
    inner: FileBlobStore,
    index: ObjectIndex,
}

impl ChurningBlobs {
    fn churn(&self, digest: &Digest) -> Result<()> {
        if let Some(record) = self.index.get_by_digest(digest)? {
            self.index.delete(record.id)?;
        }
        self.index.insert(&NewObject {
            digest,
            media_type: "application/octet-stream",
            size: 1,
            created_at: chrono::Utc::now(),
        })?;
        Ok(())
    }
}

impl BlobStore for ChurningBlobs {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.inner.write(digest, data)?;
        self.churn(digest)
    }

    fn write_from(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        let size = self.inner.write_from(digest, reader)?;
        self.churn(digest)?;
        Ok(size)
    }

    fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.inner.read(digest)
    }

    fn open_range(&self, digest: &Digest, start: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        self.inner.open_range(digest, start, length)
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        self.inner.delete(digest)
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.churn(digest).is_ok() && self.inner.exists(digest)
    }
}

fn engine(dir: &TempDir) -> DedupEngine {
    DedupEngine::open(&StoreConfig::with_base_path(dir.path())).unwrap()
}

fn blob_path(dir: &TempDir, digest: &Digest) -> std::path::PathBuf {
    StoreConfig::with_base_path(dir.path())
        .objects_dir()
        .join(digest.prefix())
        .join(digest.remainder())
}

fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn adding_identical_content_writes_once() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = counting_engine(&dir);
    let data = pseudo_random(4096, 1);

    let ids: Vec<ObjectId> = (0..5)
        .map(|_| engine.add(&data, None).map(|r| r.id))
        .collect::<Result<_>>()?;

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(engine.get(ids[0])?.unwrap().reference_count, 5);
    assert_eq!(engine.list()?.len(), 1);
    assert_eq!(engine.blobs().writes(), 1);
    Ok(())
}

#[test]
fn streamed_add_equals_bytes_add() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = counting_engine(&dir);
    let data = pseudo_random(300_000, 2);

    let streamed = engine.add(Content::stream(&data[..]), None)?;
    let chunked = engine.add(Content::chunks(data.chunks(7_000)), None)?;
    let direct = engine.add(&data, None)?;

    assert_eq!(streamed.id, direct.id);
    assert_eq!(chunked.id, direct.id);
    assert_eq!(streamed.digest, Digest::of(&data));
    assert_eq!(direct.reference_count, 3);
    assert_eq!(engine.blobs().writes(), 1);
    Ok(())
}

#[test]
fn round_trip_preserves_bytes() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);

    for (seed, len) in [1usize, 511, 512, 513, 65_536, 1_000_000].into_iter().enumerate() {
        let data = pseudo_random(len, seed as u32 + 10);
        let record = engine.add(&data, None)?;
        assert_eq!(record.size, len as u64);
        assert_eq!(engine.read(record.id, true)?, data);

        let streamed: Vec<u8> = engine
            .stream(record.id, ByteRange::FULL, true)?
            .collect::<io::Result<Vec<_>>>()?
            .concat();
        assert_eq!(streamed, data);
    }
    Ok(())
}

#[test]
fn object_lives_until_last_release() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let record = engine.add(b"refcounted", None)?;
    for _ in 1..4 {
        engine.add(b"refcounted", None)?;
    }

    for remaining in (1..4).rev() {
        assert_eq!(
            engine.release(record.id, false)?,
            Release::Kept { reference_count: remaining }
        );
        assert_eq!(engine.read(record.id, true)?, b"refcounted");
    }

    assert_eq!(
        engine.release(record.id, false)?,
        Release::Deleted { blob_missing: false }
    );
    assert!(engine.get(record.id)?.is_none());
    assert!(!blob_path(&dir, &record.digest).exists());
    assert!(matches!(engine.read(record.id, true), Err(Error::NotFound(_))));
    assert!(matches!(engine.release(record.id, false), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn deleted_content_can_be_added_again() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let first = engine.add(b"phoenix", None)?;
    engine.release(first.id, false)?;

    let second = engine.add(b"phoenix", None)?;
    assert!(second.id > first.id);
    assert_eq!(second.reference_count, 1);
    assert_eq!(engine.read(second.id, true)?, b"phoenix");
    Ok(())
}

#[test]
fn range_reads_follow_resolution_rules() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let data: Vec<u8> = (0..100u8).collect();
    let record = engine.add(&data, None)?;

    let cases = [
        (ByteRange::FULL, 0..100),
        (ByteRange::new(50, Some(59)), 50..60),
        (ByteRange::new(150, None), 0..100),
        (ByteRange::new(0, None), 0..100),
        (ByteRange::new(90, Some(1_000)), 90..100),
    ];

    for (range, expected) in cases {
        let stream = engine.stream(record.id, range, false)?;
        assert_eq!(stream.range().start, expected.start as u64);
        assert_eq!(stream.range().length, (expected.end - expected.start) as u64);
        assert_eq!(stream.into_bytes()?, &data[expected]);
    }

    let header = filedb::parse_range_header("bytes=50-59").unwrap();
    let stream = engine.stream(record.id, header, false)?;
    assert_eq!(stream.range().content_range(), "bytes 50-59/100");
    Ok(())
}

#[test]
fn corruption_is_detected() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let data = pseudo_random(10_000, 3);
    let record = engine.add(&data, None)?;

    let mut rotten = data.clone();
    rotten[5_000] ^= 0x01;
    fs::write(blob_path(&dir, &record.digest), &rotten)?;

    assert!(!engine.consistent(record.id));
    let err = engine.read(record.id, true).unwrap_err();
    assert!(err.is_consistency());
    assert!(matches!(err, Error::Corrupted { .. }));
    assert_eq!(engine.read(record.id, false)?, rotten);

    let mut stream = engine.stream(record.id, ByteRange::FULL, true)?;
    let mut sink = Vec::new();
    let err = stream.read_to_end(&mut sink).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // Partial streams are not verified.
    let part = engine.stream(record.id, ByteRange::new(0, Some(9)), true)?;
    assert_eq!(part.into_bytes()?, &rotten[..10]);
    Ok(())
}

#[test]
fn reconciliation_applies_census() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let id1 = engine.add(b"unreferenced", None)?.id;
    engine.retain(id1)?;
    let id2 = engine.add(b"undercounted", None)?.id;

    let census: Census = [(id1, 0), (id2, 3)].into_iter().collect();
    let reconciler = Reconciler::new(&engine);

    let simulated = reconciler.reconcile(&census, true)?;
    assert!(simulated.simulated);
    assert_eq!(engine.get(id1)?.unwrap().reference_count, 2);
    assert_eq!(engine.get(id2)?.unwrap().reference_count, 1);

    let report = reconciler.reconcile(&census, false)?;
    assert_eq!(report.actions, simulated.actions);
    assert_eq!(
        report.actions,
        vec![
            ReconcileAction::Delete { id: id1 },
            ReconcileAction::Update { id: id2, from: 1, to: 3 },
        ]
    );
    assert_eq!((report.processed, report.deleted, report.kept, report.updated), (2, 1, 0, 1));
    assert!(engine.get(id1)?.is_none());
    assert_eq!(engine.get(id2)?.unwrap().reference_count, 3);
    Ok(())
}

#[test]
fn empty_content_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = counting_engine(&dir);

    assert!(matches!(engine.add(b"", None), Err(Error::EmptyContent)));
    assert!(matches!(
        engine.add(Content::chunks(Vec::<Vec<u8>>::new()), None),
        Err(Error::EmptyContent)
    ));
    assert!(engine.list()?.is_empty());
    assert_eq!(engine.blobs().writes(), 0);
    Ok(())
}

#[test]
fn concurrent_adds_share_one_record() -> Result<()> {
    const WORKERS: usize = 8;
    let dir = TempDir::new()?;
    let engine = Arc::new(engine(&dir));
    let barrier = Arc::new(Barrier::new(WORKERS));
    let data = Arc::new(pseudo_random(50_000, 4));

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let data = data.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.add(&*data, None).expect("add failed").id
            })
        })
        .collect();

    let ids: Vec<ObjectId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));

    let records = engine.list()?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reference_count, WORKERS as u64);
    assert_eq!(engine.read(ids[0], true)?, *data);
    Ok(())
}

#[test]
fn concurrent_releases_delete_exactly_once() -> Result<()> {
    const WORKERS: usize = 8;
    let dir = TempDir::new()?;
    let engine = Arc::new(engine(&dir));
    let record = engine.add(b"contended", None)?;
    for _ in 1..WORKERS {
        engine.retain(record.id)?;
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.release(record.id, false).expect("release failed")
            })
        })
        .collect();

    let outcomes: Vec<Release> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let deletions = outcomes
        .iter()
        .filter(|o| matches!(o, Release::Deleted { .. }))
        .count();
    assert_eq!(deletions, 1);
    assert!(engine.get(record.id)?.is_none());
    assert!(!blob_path(&dir, &record.digest).exists());
    Ok(())
}

#[test]
fn add_restores_missing_blob() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let record = engine.add(b"self-healing", None)?;
    fs::remove_file(blob_path(&dir, &record.digest))?;
    assert!(matches!(
        engine.read(record.id, true),
        Err(Error::MissingBlob { .. })
    ));

    let again = engine.add(b"self-healing", None)?;
    assert_eq!(again.id, record.id);
    assert_eq!(again.reference_count, 2);
    assert!(engine.consistent(record.id));
    assert_eq!(engine.read(record.id, true)?, b"self-healing");
    Ok(())
}

#[test]
fn column_backend_behaves_like_files() -> Result<()> {
    let dir = TempDir::new()?;
    let config = StoreConfig {
        backend: Backend::Column,
        ..StoreConfig::with_base_path(dir.path())
    };
    let engine = DedupEngine::open(&config)?;
    let data: Vec<u8> = (0..=255u8).cycle().take(1_000).collect();

    let record = engine.add(&data, None)?;
    assert_eq!(engine.add(Content::stream(&data[..]), None)?.id, record.id);
    assert!(config.blobs_db_path().exists());
    assert!(!config.objects_dir().exists());

    assert_eq!(engine.read(record.id, true)?, data);
    assert!(engine.consistent(record.id));
    let part = engine.stream(record.id, ByteRange::new(10, Some(19)), false)?;
    assert_eq!(part.into_bytes()?, &data[10..20]);

    assert_eq!(engine.release(record.id, false)?, Release::Kept { reference_count: 1 });
    assert_eq!(
        engine.release(record.id, false)?,
        Release::Deleted { blob_missing: false }
    );
    assert!(!engine.blobs().exists(&record.digest));
    Ok(())
}

#[test]
fn payload_slot_replaces_and_releases() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let mut slot = PayloadSlot::empty();
    assert_eq!(slot.load_payload(&engine)?, None);

    let old = slot
        .replace_payload(&engine, Some(Content::Bytes(b"version one")))?
        .unwrap();
    let new = slot
        .replace_payload(&engine, Some(Content::Bytes(b"version two")))?
        .unwrap();

    assert_ne!(old, new);
    assert!(engine.get(old)?.is_none());
    assert_eq!(slot.load_payload(&engine)?, Some(b"version two".to_vec()));

    // A payload shared with another owner survives the slot letting go.
    engine.retain(new)?;
    slot.replace_payload(&engine, None)?;
    assert_eq!(engine.get(new)?.unwrap().reference_count, 1);
    Ok(())
}

#[test]
fn failed_blob_write_creates_no_record() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = faulty_engine(&dir);
    engine.blobs().fail_writes.store(true, Ordering::SeqCst);

    let err = engine.add(b"unwritable", None).unwrap_err();
    match err {
        Error::BlobWrite { digest, source } => {
            assert_eq!(digest, Digest::of(b"unwritable"));
            assert!(matches!(*source, Error::Permission { .. }));
        }
        other => panic!("expected BlobWrite, got {other:?}"),
    }
    assert!(engine.list()?.is_empty());

    let streamed = engine.add(Content::stream(&b"unwritable"[..]), None);
    assert!(matches!(streamed, Err(Error::BlobWrite { .. })));
    assert!(engine.list()?.is_empty());

    engine.blobs().fail_writes.store(false, Ordering::SeqCst);
    let record = engine.add(b"unwritable", None)?;
    assert_eq!(record.reference_count, 1);
    assert_eq!(engine.read(record.id, true)?, b"unwritable");
    Ok(())
}

#[test]
fn failed_blob_delete_keeps_the_reference() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = faulty_engine(&dir);
    let record = engine.add(b"stubborn", None)?;
    engine.blobs().fail_deletes.store(true, Ordering::SeqCst);

    let err = engine.release(record.id, false).unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));
    assert!(err.is_retryable());
    assert_eq!(engine.get(record.id)?.unwrap().reference_count, 1);
    assert!(engine.blobs().exists(&record.digest));

    assert!(matches!(engine.purge(record.id), Err(Error::Permission { .. })));
    assert_eq!(engine.get(record.id)?.unwrap().reference_count, 1);

    engine.blobs().fail_deletes.store(false, Ordering::SeqCst);
    assert_eq!(
        engine.release(record.id, false)?,
        Release::Deleted { blob_missing: false }
    );
    assert!(engine.get(record.id)?.is_none());
    assert!(!engine.blobs().exists(&record.digest));
    Ok(())
}

#[test]
fn touch_counts_accesses() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let record = engine.add(b"popular", None)?;
    assert_eq!(record.access_count, 0);
    assert!(record.last_access_at.is_none());

    let touched = engine.touch(record.id)?;
    assert_eq!(touched.access_count, 1);
    let first_access = touched.last_access_at.expect("touch sets last access");
    assert!(first_access >= record.created_at);

    assert_eq!(engine.touch(record.id)?.access_count, 2);
    engine.read(record.id, true)?;
    let after_read = engine.get(record.id)?.unwrap();
    assert_eq!(after_read.access_count, 3);
    assert!(after_read.last_access_at.unwrap() >= first_access);

    // Touching never changes the reference count.
    assert_eq!(after_read.reference_count, 1);
    assert!(matches!(engine.touch(ObjectId(999)), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn endless_insert_races_give_up_with_conflict() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = StoreConfig::with_base_path(dir.path());
    config.insert_retries = 3;
    let blobs = ChurningBlobs {
        inner: FileBlobStore::new(config.blob_store())?,
        index: ObjectIndex::open(config.index_path())?,
    };
    let engine = DedupEngine::new(ObjectIndex::open(config.index_path())?, blobs, &config);

    let err = engine.add(b"contested", None).unwrap_err();
    match &err {
        Error::Conflict { digest, attempts } => {
            assert_eq!(*digest, Digest::of(b"contested"));
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert!(err.is_retryable());
    Ok(())
}

#[test]
fn truncated_blob_is_a_consistency_error() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = engine(&dir);
    let data = pseudo_random(4_096, 11);
    let record = engine.add(&data, None)?;

    fs::write(blob_path(&dir, &record.digest), &data[..4_000])?;

    assert!(!engine.consistent(record.id));
    let err = engine.read(record.id, true).unwrap_err();
    assert!(err.is_consistency());
    assert!(matches!(
        err,
        Error::SizeMismatch {
            expected: 4_096,
            actual: 4_000,
            ..
        }
    ));
    Ok(())
}

#[test]
fn payload_slot_moves_on_when_old_release_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = faulty_engine(&dir);
    let mut slot = PayloadSlot::empty();
    let old = slot
        .replace_payload(&engine, Some(Content::Bytes(b"draft")))?
        .unwrap();

    engine.blobs().fail_deletes.store(true, Ordering::SeqCst);
    let err = slot
        .replace_payload(&engine, Some(Content::Bytes(b"final")))
        .unwrap_err();
    assert!(matches!(err, Error::Permission { .. }));

    let new = slot.id.unwrap();
    assert_ne!(new, old);
    assert_eq!(slot.load_payload(&engine)?, Some(b"final".to_vec()));
    assert_eq!(engine.get(old)?.unwrap().reference_count, 1);

    engine.blobs().fail_deletes.store(false, Ordering::SeqCst);
    engine.release(old, false)?;
    assert!(engine.get(old)?.is_none());
    Ok(())
}
