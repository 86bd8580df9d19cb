//! Persistent Store - Disk-based Warm Tier
//!
//! Durable, digest-addressed storage of chunk bytes on local disk.
//!
//! # File Layout
//!
//! ```text
//! <cache-root>/
//! └── ab/                 # hash[0:2]
//!     └── cd/             # hash[2:4]
//!         └── ef0123...   # hash[4:], raw chunk bytes, no header
//! ```
//!
//! # Design
//!
//! - Writes go to a unique `*.tmp` sibling, are synced, then renamed over the
//!   target, so a reader never observes a partial chunk
//! - In-memory index (digest -> size, last access) rebuilt from the directory
//!   tree on open; total size is maintained incrementally
//! - Index guards are never held across filesystem calls: copy what is
//!   needed, release, then do the I/O

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::chunk::{ChunkId, ChunkKey};
use crate::error::{Error, Result};

/// Extension of in-flight write files
pub const TEMP_EXTENSION: &str = "tmp";

/// Index record for one stored chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Location of the chunk file
    pub path: PathBuf,
    /// Size of the chunk in bytes
    pub size: u64,
    /// Last successful read or write
    pub last_access: SystemTime,
    /// Monotonic access stamp, breaks `last_access` ties
    pub access_seq: u64,
}

/// Persistent Store - disk-based warm tier
pub struct PersistentStore {
    /// Cache root directory
    root: PathBuf,
    /// In-memory index (digest -> entry)
    index: RwLock<HashMap<ChunkKey, DiskEntry>>,
    /// Sum of all indexed entry sizes
    total_bytes: AtomicU64,
    /// Source of access stamps
    access_clock: AtomicU64,
    /// Source of unique temp file suffixes
    temp_counter: AtomicU64,
    /// Chunk files read
    reads: AtomicU64,
    /// Chunk files written
    writes: AtomicU64,
}

impl PersistentStore {
    /// Open (or create) a store at `root`, rebuilding the index from disk
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::storage(&root, e))?;

        let recovered = scan_root(&root)?;

        let mut index = HashMap::with_capacity(recovered.entries.len());
        let mut total_bytes = 0u64;
        for (seq, (key, mut entry)) in recovered.entries.into_iter().enumerate() {
            entry.access_seq = seq as u64;
            total_bytes += entry.size;
            index.insert(key, entry);
        }

        info!(
            root = %root.display(),
            entries = index.len(),
            bytes = total_bytes,
            orphaned_temp_files = recovered.orphans_removed,
            skipped = recovered.skipped,
            "Persistent store opened"
        );

        let next_seq = index.len() as u64;
        Ok(Self {
            root,
            index: RwLock::new(index),
            total_bytes: AtomicU64::new(total_bytes),
            access_clock: AtomicU64::new(next_seq),
            temp_counter: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Storage path for a chunk; pure, never touches disk
    pub fn locate(&self, id: &ChunkId) -> PathBuf {
        self.path_for(&id.key())
    }

    fn path_for(&self, key: &ChunkKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn next_seq(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Unique sibling for an in-flight write to `target`
    fn temp_path(&self, target: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(
            "{}.{}-{}.{}",
            name,
            std::process::id(),
            n,
            TEMP_EXTENSION
        ))
    }

    /// Durably store a chunk, replacing any previous bytes for the identity
    pub fn write(&self, id: &ChunkId, data: &[u8]) -> Result<()> {
        let key = id.key();
        let target = self.path_for(&key);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }

        let temp = self.temp_path(&target);
        if let Err(e) = write_synced(&temp, data) {
            let _ = fs::remove_file(&temp);
            return Err(Error::storage(&temp, e));
        }

        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(Error::storage(&target, e));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = data.len() as u64;
        let entry = DiskEntry {
            path: target,
            size,
            last_access: SystemTime::now(),
            access_seq: self.next_seq(),
        };

        {
            let mut index = self.index.write();
            if let Some(old) = index.insert(key, entry) {
                self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
            }
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
        }

        trace!(chunk = %id, bytes = size, "persistent store: wrote chunk");
        Ok(())
    }

    /// Read a chunk
    ///
    /// `Ok(None)` means the chunk is not stored. An error means the index
    /// listed the chunk but its file could not be read; the stale record is
    /// dropped before returning.
    pub fn read(&self, id: &ChunkId) -> Result<Option<Bytes>> {
        let key = id.key();
        let entry = self.index.read().get(&key).cloned();

        let Some(entry) = entry else {
            return Ok(None);
        };

        self.reads.fetch_add(1, Ordering::Relaxed);
        match fs::read(&entry.path) {
            Ok(data) => {
                let now = SystemTime::now();
                let seq = self.next_seq();
                if let Some(e) = self.index.write().get_mut(&key) {
                    e.last_access = now;
                    e.access_seq = seq;
                }

                trace!(chunk = %id, bytes = data.len(), "persistent store: read chunk");
                Ok(Some(Bytes::from(data)))
            }
            Err(source) => {
                self.take_entry(&key, Some(entry.access_seq));
                Err(Error::IndexDivergence {
                    path: entry.path,
                    source,
                })
            }
        }
    }

    /// Check if a chunk is indexed (no disk access)
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.contains_key(&id.key())
    }

    /// Check if a digest is indexed (no disk access)
    pub fn contains_key(&self, key: &ChunkKey) -> bool {
        self.index.read().contains_key(key)
    }

    /// Remove a chunk
    pub fn remove(&self, id: &ChunkId) -> Result<Option<u64>> {
        self.remove_key(&id.key())
    }

    /// Remove a chunk by digest, returning the bytes released
    pub fn remove_key(&self, key: &ChunkKey) -> Result<Option<u64>> {
        match self.take_entry(key, None) {
            Some(entry) => self.unlink(entry).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a chunk only if it has not been read or rewritten since
    /// `access_seq` was observed
    pub fn remove_if_unchanged(&self, key: &ChunkKey, access_seq: u64) -> Result<Option<u64>> {
        match self.take_entry(key, Some(access_seq)) {
            Some(entry) => self.unlink(entry).map(Some),
            None => Ok(None),
        }
    }

    /// Drop an index record, optionally only if its stamp still matches
    fn take_entry(&self, key: &ChunkKey, expected_seq: Option<u64>) -> Option<DiskEntry> {
        let mut index = self.index.write();

        let current_seq = index.get(key)?.access_seq;
        if expected_seq.is_some_and(|seq| seq != current_seq) {
            return None;
        }

        let entry = index.remove(key)?;
        self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry)
    }

    fn unlink(&self, entry: DiskEntry) -> Result<u64> {
        match fs::remove_file(&entry.path) {
            Ok(()) => Ok(entry.size),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %entry.path.display(), "chunk file already gone");
                Ok(entry.size)
            }
            Err(e) => Err(Error::storage(&entry.path, e)),
        }
    }

    /// Snapshot of all entries, least recently accessed first
    pub fn entries_by_access_time(&self) -> Vec<(ChunkKey, DiskEntry)> {
        let mut entries: Vec<_> = self
            .index
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        entries.sort_by_key(|(_, e)| (e.last_access, e.access_seq));
        entries
    }

    /// Total indexed bytes
    pub fn total_size(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of indexed chunks
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Chunk files read so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Chunk files written so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Remove every chunk, continuing past individual failures
    pub fn clear(&self) -> Result<()> {
        let keys: Vec<ChunkKey> = self.index.read().keys().copied().collect();

        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove_key(&key) {
                warn!(chunk = %key, error = %e, "failed to remove chunk during clear");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Write `data` to a fresh file at `path` and force it to stable storage
fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

// =============================================================================
// Startup Recovery
// =============================================================================

#[derive(Default)]
struct Recovered {
    /// Entries sorted oldest first
    entries: Vec<(ChunkKey, DiskEntry)>,
    orphans_removed: usize,
    skipped: usize,
}

/// Walk `root/xx/yy/rest` once, rebuilding index records
///
/// Leftover temp files are deleted; anything else that does not decode to a
/// digest, or whose metadata is unreadable, is skipped.
fn scan_root(root: &Path) -> Result<Recovered> {
    let mut recovered = Recovered::default();

    for level1 in fs::read_dir(root).map_err(|e| Error::storage(root, e))? {
        let Some((prefix1, dir1)) = subdirectory(level1, &mut recovered) else {
            continue;
        };

        let Some(level2) = read_dir_logged(&dir1, &mut recovered) else {
            continue;
        };
        for entry2 in level2 {
            let Some((prefix2, dir2)) = subdirectory(entry2, &mut recovered) else {
                continue;
            };

            let Some(files) = read_dir_logged(&dir2, &mut recovered) else {
                continue;
            };
            for file in files.flatten() {
                recover_file(&prefix1, &prefix2, file, &mut recovered);
            }
        }
    }

    recovered.entries.sort_by_key(|(_, e)| e.last_access);
    Ok(recovered)
}

fn subdirectory(
    entry: std::io::Result<fs::DirEntry>,
    recovered: &mut Recovered,
) -> Option<(String, PathBuf)> {
    let entry = entry.ok()?;
    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
    match entry.file_name().into_string() {
        Ok(name) if is_dir => Some((name, entry.path())),
        _ => {
            recovered.skipped += 1;
            None
        }
    }
}

fn read_dir_logged(dir: &Path, recovered: &mut Recovered) -> Option<fs::ReadDir> {
    match fs::read_dir(dir) {
        Ok(rd) => Some(rd),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable cache directory");
            recovered.skipped += 1;
            None
        }
    }
}

fn recover_file(prefix1: &str, prefix2: &str, file: fs::DirEntry, recovered: &mut Recovered) {
    let path = file.path();
    let Ok(name) = file.file_name().into_string() else {
        recovered.skipped += 1;
        return;
    };

    if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed orphaned temp file");
                recovered.orphans_removed += 1;
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to remove orphaned temp file"
                );
            }
        }
        return;
    }

    let Some(key) = ChunkKey::from_segments(prefix1, prefix2, &name) else {
        debug!(path = %path.display(), "ignoring non-chunk file in cache root");
        recovered.skipped += 1;
        return;
    };

    let metadata = match file.metadata() {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            recovered.skipped += 1;
            return;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping chunk with unreadable metadata");
            recovered.skipped += 1;
            return;
        }
    };

    let last_access = metadata.modified().unwrap_or(UNIX_EPOCH);
    recovered.entries.push((
        key,
        DiskEntry {
            path,
            size: metadata.len(),
            last_access,
            access_seq: 0,
        },
    ));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, PersistentStore) {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn chunk(path: &str, index: u64) -> ChunkId {
        ChunkId::new(path, index)
    }

    #[test]
    fn test_write_read() {
        let (_dir, store) = open_store();
        let id = chunk("docs/a.txt", 0);

        store.write(&id, &[1, 2, 3, 4, 5]).unwrap();
        assert!(store.contains(&id));

        let data = store.read(&id).unwrap().unwrap();
        assert_eq!(data.as_ref(), &[1, 2, 3, 4, 5]);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_read_absent_is_not_an_error() {
        let (_dir, store) = open_store();
        assert_matches!(store.read(&chunk("nope", 0)), Ok(None));
        assert_eq!(store.reads(), 0);
    }

    #[test]
    fn test_empty_and_full_size_chunks() {
        let (_dir, store) = open_store();

        let empty = chunk("empty", 0);
        store.write(&empty, &[]).unwrap();
        assert_eq!(store.read(&empty).unwrap().unwrap().len(), 0);

        let full = chunk("full", 0);
        let payload: Vec<u8> = (0..crate::cache::DEFAULT_CHUNK_SIZE)
            .map(|i| (i % 251) as u8)
            .collect();
        store.write(&full, &payload).unwrap();
        assert_eq!(store.read(&full).unwrap().unwrap().as_ref(), &payload[..]);
        assert_eq!(store.total_size(), payload.len() as u64);
    }

    #[test]
    fn test_total_size_tracks_writes_and_overwrites() {
        let (_dir, store) = open_store();
        assert_eq!(store.total_size(), 0);

        store.write(&chunk("f", 0), &[1; 100]).unwrap();
        store.write(&chunk("f", 1), &[2; 200]).unwrap();
        assert_eq!(store.total_size(), 300);

        // Rewriting replaces, never appends
        store.write(&chunk("f", 0), &[3; 50]).unwrap();
        assert_eq!(store.total_size(), 250);
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(&chunk("f", 0)).unwrap().unwrap().as_ref(), &[3; 50]);
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = open_store();
        let id = chunk("f", 0);
        store.write(&id, &[0; 5]).unwrap();
        let path = store.locate(&id);

        assert_eq!(store.remove(&id).unwrap(), Some(5));
        assert!(!store.contains(&id));
        assert!(!path.exists());
        assert_eq!(store.total_size(), 0);

        assert_eq!(store.remove(&id).unwrap(), None);
    }

    #[test]
    fn test_remove_tolerates_missing_file() {
        let (_dir, store) = open_store();
        let id = chunk("f", 0);
        store.write(&id, &[0; 5]).unwrap();
        fs::remove_file(store.locate(&id)).unwrap();

        assert_eq!(store.remove(&id).unwrap(), Some(5));
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn test_locate_layout() {
        let (dir, store) = open_store();
        let id = chunk("some/deep/path.bin", 42);
        let hex = id.key().to_hex();

        let path = store.locate(&id);
        assert_eq!(path, store.locate(&id));
        assert_eq!(
            path,
            dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex[4..])
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_raw_bytes_on_disk() {
        let (_dir, store) = open_store();
        let id = chunk("raw", 0);
        store.write(&id, b"exact bytes").unwrap();

        assert_eq!(fs::read(store.locate(&id)).unwrap(), b"exact bytes");
    }

    #[test]
    fn test_no_temp_files_left_after_write() {
        let (_dir, store) = open_store();
        let id = chunk("f", 0);
        store.write(&id, &[9; 64]).unwrap();
        store.write(&id, &[8; 64]).unwrap();

        let parent = store.locate(&id).parent().unwrap().to_path_buf();
        let names: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_index_rebuilt_on_reopen() {
        let dir = TempDir::new().unwrap();
        let id = chunk("persist/me", 7);

        {
            let store = PersistentStore::open(dir.path()).unwrap();
            store.write(&id, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
            store.write(&chunk("persist/me", 8), &[1; 10]).unwrap();
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_size(), 14);
        assert!(store.contains(&id));
        assert_eq!(
            store.read(&id).unwrap().unwrap().as_ref(),
            &[0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_interrupted_write_reads_absent() {
        let dir = TempDir::new().unwrap();
        let id = chunk("crash", 0);

        {
            let store = PersistentStore::open(dir.path()).unwrap();
            // Simulate a crash after the temp file was written but before rename
            let target = store.locate(&id);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            let temp = store.temp_path(&target);
            fs::write(&temp, b"partial").unwrap();

            assert_matches!(store.read(&id), Ok(None));
            assert!(!store.contains(&id));
        }

        // A restart removes the orphan and still reports absence
        let store = PersistentStore::open(dir.path()).unwrap();
        assert_matches!(store.read(&id), Ok(None));
        assert_eq!(store.len(), 0);

        let parent = store.locate(&id).parent().unwrap().to_path_buf();
        assert_eq!(fs::read_dir(parent).unwrap().count(), 0);
    }

    #[test]
    fn test_foreign_files_skipped_on_open() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("ab").join("cd")).unwrap();
        fs::write(dir.path().join("ab").join("cd").join("not-a-digest"), b"x").unwrap();
        fs::write(dir.path().join("README"), b"x").unwrap();

        let store = PersistentStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn test_divergence_drops_index_entry() {
        let (_dir, store) = open_store();
        let id = chunk("f", 0);
        store.write(&id, &[1; 10]).unwrap();

        fs::remove_file(store.locate(&id)).unwrap();

        assert_matches!(store.read(&id), Err(Error::IndexDivergence { .. }));
        assert!(!store.contains(&id));
        assert_eq!(store.total_size(), 0);
        assert_matches!(store.read(&id), Ok(None));
    }

    #[test]
    fn test_entries_ordered_by_access() {
        let (_dir, store) = open_store();
        let a = chunk("f", 0);
        let b = chunk("f", 1);
        let c = chunk("f", 2);
        store.write(&a, &[0]).unwrap();
        store.write(&b, &[0]).unwrap();
        store.write(&c, &[0]).unwrap();

        // Reading `a` makes it the most recently used
        store.read(&a).unwrap();

        let order: Vec<_> = store
            .entries_by_access_time()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(order, vec![b.key(), c.key(), a.key()]);
    }

    #[test]
    fn test_remove_if_unchanged_spares_touched_entries() {
        let (_dir, store) = open_store();
        let id = chunk("f", 0);
        store.write(&id, &[0; 4]).unwrap();

        let (key, entry) = store.entries_by_access_time().remove(0);
        store.read(&id).unwrap();

        assert_eq!(store.remove_if_unchanged(&key, entry.access_seq).unwrap(), None);
        assert!(store.contains(&id));

        let (_, fresh) = store.entries_by_access_time().remove(0);
        assert_eq!(
            store.remove_if_unchanged(&key, fresh.access_seq).unwrap(),
            Some(4)
        );
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = open_store();
        for i in 0..5 {
            store.write(&chunk("f", i), &[0; 10]).unwrap();
        }
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.total_size(), 0);
    }
}
