//! Detached Disk Writer
//!
//! Fixed pool of threads that persist inserted chunks after the caller has
//! already returned.
//!
//! # Design
//!
//! - One bounded channel per worker; a chunk is routed by its digest, so
//!   writes of the same identity are applied in submission order
//! - A full queue drops the write (the memory tier already holds the data)
//! - Failures are logged and counted, never surfaced to the inserter

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::chunk::ChunkId;
use super::disk::PersistentStore;
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

struct WriteJob {
    id: ChunkId,
    data: Bytes,
}

/// Count of accepted-but-unfinished writes
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }
}

/// Background writer pool for the persistent tier
pub struct DiskWriter {
    senders: Vec<Sender<WriteJob>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    metrics: Arc<CacheMetrics>,
}

impl DiskWriter {
    /// Start `threads` workers sharing `queue_depth` pending-write slots
    pub fn new(
        store: Arc<PersistentStore>,
        threads: usize,
        queue_depth: usize,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Config(
                "writer threads must be greater than 0".to_string(),
            ));
        }

        let per_worker = (queue_depth / threads).max(1);
        let in_flight = Arc::new(InFlight::default());

        let mut senders = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let (tx, rx) = channel::bounded(per_worker);
            let store = store.clone();
            let in_flight = in_flight.clone();
            let metrics = metrics.clone();

            let handle = std::thread::Builder::new()
                .name(format!("chunkcache-writer-{}", i))
                .spawn(move || worker_loop(rx, store, in_flight, metrics))?;

            senders.push(tx);
            workers.push(handle);
        }

        debug!(threads, queue_depth_per_worker = per_worker, "disk writer pool started");

        Ok(Self {
            senders,
            workers,
            in_flight,
            metrics,
        })
    }

    /// Queue a chunk for persistence without blocking
    ///
    /// Returns `false` if the write was dropped.
    pub fn submit(&self, id: ChunkId, data: Bytes) -> bool {
        let worker = id.key().as_bytes()[0] as usize % self.senders.len();

        self.in_flight.begin();
        match self.senders[worker].try_send(WriteJob { id, data }) {
            Ok(()) => {
                self.metrics.record_write_queued();
                true
            }
            Err(TrySendError::Full(job)) => {
                self.in_flight.finish();
                self.metrics.record_write_dropped();
                debug!(chunk = %job.id, "disk write queue full, dropping write");
                false
            }
            Err(TrySendError::Disconnected(job)) => {
                self.in_flight.finish();
                self.metrics.record_write_dropped();
                warn!(chunk = %job.id, "disk writer stopped, dropping write");
                false
            }
        }
    }

    /// Block until every accepted write has finished
    pub fn flush(&self) {
        self.in_flight.wait_idle();
    }

    /// Writes accepted but not yet finished
    pub fn pending(&self) -> usize {
        self.in_flight.get()
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        // Closing the channels lets each worker drain its queue and exit
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("disk writer thread panicked");
            }
        }
    }
}

fn worker_loop(
    jobs: Receiver<WriteJob>,
    store: Arc<PersistentStore>,
    in_flight: Arc<InFlight>,
    metrics: Arc<CacheMetrics>,
) {
    for job in jobs.iter() {
        let start = Instant::now();
        match store.write(&job.id, &job.data) {
            Ok(()) => {
                metrics.record_write_completed(start.elapsed());
                trace!(chunk = %job.id, "detached disk write complete");
            }
            Err(e) => {
                metrics.record_write_failure();
                warn!(chunk = %job.id, error = %e, "detached disk write failed");
            }
        }
        in_flight.finish();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(
        threads: usize,
        depth: usize,
    ) -> (TempDir, Arc<PersistentStore>, Arc<CacheMetrics>, DiskWriter) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistentStore::open(dir.path()).unwrap());
        let metrics = Arc::new(CacheMetrics::new());
        let writer = DiskWriter::new(store.clone(), threads, depth, metrics.clone()).unwrap();
        (dir, store, metrics, writer)
    }

    #[test]
    fn test_zero_threads_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistentStore::open(dir.path()).unwrap());
        let result = DiskWriter::new(store, 0, 8, Arc::new(CacheMetrics::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_submit_then_flush_persists() {
        let (_dir, store, metrics, writer) = setup(2, 64);

        for i in 0..20 {
            assert!(writer.submit(ChunkId::new("f", i), Bytes::from(vec![i as u8; 32])));
        }
        writer.flush();

        assert_eq!(writer.pending(), 0);
        assert_eq!(store.len(), 20);
        assert_eq!(store.total_size(), 20 * 32);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.disk_writes_queued, 20);
        assert_eq!(snapshot.disk_writes_completed, 20);
    }

    #[test]
    fn test_same_identity_writes_apply_in_order() {
        let (_dir, store, _metrics, writer) = setup(4, 64);
        let id = ChunkId::new("f", 0);

        for v in 0..10u8 {
            writer.submit(id.clone(), Bytes::from(vec![v; 8]));
        }
        writer.flush();

        assert_eq!(store.read(&id).unwrap().unwrap().as_ref(), &[9u8; 8]);
    }

    #[test]
    fn test_drop_drains_queue() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PersistentStore::open(dir.path()).unwrap());
        {
            let writer =
                DiskWriter::new(store.clone(), 1, 16, Arc::new(CacheMetrics::new())).unwrap();
            for i in 0..8 {
                writer.submit(ChunkId::new("f", i), Bytes::from_static(b"data"));
            }
        }
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn test_failed_write_is_counted_not_raised() {
        let (dir, store, metrics, writer) = setup(1, 4);
        let id = ChunkId::new("blocked", 0);

        // Occupy the first directory level with a file so create_dir_all fails
        let first = store.locate(&id).parent().unwrap().parent().unwrap().to_path_buf();
        std::fs::write(&first, b"in the way").unwrap();

        assert!(writer.submit(id.clone(), Bytes::from_static(b"x")));
        writer.flush();

        assert!(!store.contains(&id));
        assert_eq!(metrics.snapshot().disk_write_failures, 1);
        drop(dir);
    }
}
