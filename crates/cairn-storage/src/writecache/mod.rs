//! Write-cache: fast staging tier in front of the blob store and metabase
//!
//! Small objects land in a keyed redb database, bigger ones in a file tree.
//! Background threads move them to the main storage:
//!
//! - the small-object loop scans the database in batches every flush
//!   interval and hands objects to a pool of flush workers;
//! - the big-object loop walks the file tree at a coarser interval and
//!   writes entries itself;
//! - [`WriteCache::flush`] drains both tiers synchronously, but only while
//!   the cache is read-only.
//!
//! Every path claims an entry in the [`FlushedSet`] before writing it, so
//! an object reaches the main storage once no matter which path gets to it
//! first. Flushed entries stay cached until the set evicts them.

mod flush;
mod flushed;
mod put;

pub use flushed::{FlushClaim, FlushedSet};

use crate::blobstor::{BlobStor, PutPrm, StorageId};
use crate::error::{Result, StorageError};
use crate::fstree::FsTree;
use crate::metabase::Metabase;
use cairn_common::config::WriteCacheConfig;
use cairn_common::{Mode, Object, ObjectAddress};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Cached small objects: address string → marshaled object
const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

/// Destination of flushed bytes
pub trait MainStorage: Send + Sync {
    fn store(&self, prm: PutPrm<'_>) -> Result<StorageId>;
}

/// Destination of flushed index records
pub trait ObjectIndex: Send + Sync {
    fn index(&self, obj: &Object, storage_id: &StorageId) -> Result<()>;
}

impl MainStorage for BlobStor {
    fn store(&self, prm: PutPrm<'_>) -> Result<StorageId> {
        self.put(prm)
    }
}

impl ObjectIndex for Metabase {
    fn index(&self, obj: &Object, storage_id: &StorageId) -> Result<()> {
        self.put(obj, Some(storage_id))
    }
}

/// Write-cache options
#[derive(Clone, Debug)]
pub struct Options {
    pub path: PathBuf,
    pub small_object_size: u64,
    pub max_object_size: u64,
    pub size_limit: u64,
    pub workers: usize,
    pub flush_interval: Duration,
    pub big_flush_interval: Duration,
    pub flush_batch_size: usize,
    pub flushed_capacity: usize,
    /// Ask the blob store to compress big objects on flush
    pub compress: bool,
}

impl Options {
    #[must_use]
    pub fn from_config(config: &WriteCacheConfig, path: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            path: path.into(),
            small_object_size: config.small_object_size,
            max_object_size: config.max_object_size,
            size_limit: config.size_limit,
            workers: config.flush_workers.max(1),
            flush_interval: config.flush_interval(),
            big_flush_interval: config.big_flush_interval(),
            flush_batch_size: config.flush_batch_size.max(1),
            flushed_capacity: config.flushed_capacity,
            compress,
        }
    }
}

/// Flush counters
#[derive(Debug, Default)]
struct FlushStats {
    small: AtomicU64,
    big: AtomicU64,
    drained: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time copy of the flush counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    /// Objects flushed by the workers
    pub small: u64,
    /// Objects flushed by the big-object loop
    pub big: u64,
    /// Objects flushed by [`WriteCache::flush`]
    pub drained: u64,
    pub failed: u64,
    pub evicted: u64,
}

/// Object queued for a flush worker
struct QueuedObject {
    key: String,
    obj: Object,
    data: Vec<u8>,
}

struct Inner {
    opts: Options,
    mode: RwLock<Mode>,
    db: Database,
    fstree: FsTree,
    flushed: FlushedSet,
    /// Big objects the blob store should compress on flush
    compress_flags: DashSet<String>,
    /// Bytes held by the cache
    used: AtomicU64,
    blobstor: Arc<dyn MainStorage>,
    index: Arc<dyn ObjectIndex>,
    flush_tx: Sender<QueuedObject>,
    flush_rx: Receiver<QueuedObject>,
    /// Disconnected once the cache is closed
    close_rx: Receiver<()>,
    stats: FlushStats,
}

/// Write-cache of one shard
pub struct WriteCache {
    inner: Arc<Inner>,
    close_tx: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WriteCache {
    /// Open (or create) the cache; background flushing starts with
    /// [`WriteCache::init`]
    pub fn open(
        opts: Options,
        blobstor: Arc<dyn MainStorage>,
        index: Arc<dyn ObjectIndex>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&opts.path)?;
        let db = Database::create(opts.path.join("small.db"))?;
        let wtx = db.begin_write()?;
        {
            let _t = wtx.open_table(CACHE)?;
        }
        wtx.commit()?;
        let fstree = FsTree::open(opts.path.join("tree"))?;

        let used = db_usage(&db)? + fstree.disk_usage()?;
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(opts.workers);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);

        info!(path = ?opts.path, used, "write-cache opened");

        Ok(Self {
            inner: Arc::new(Inner {
                flushed: FlushedSet::new(opts.flushed_capacity),
                opts,
                mode: RwLock::new(Mode::ReadWrite),
                db,
                fstree,
                compress_flags: DashSet::new(),
                used: AtomicU64::new(used),
                blobstor,
                index,
                flush_tx,
                flush_rx,
                close_rx,
                stats: FlushStats::default(),
            }),
            close_tx: Mutex::new(Some(close_tx)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the flush workers and the flush loops
    pub fn init(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }

        for i in 0..self.inner.opts.workers {
            let inner = Arc::clone(&self.inner);
            handles.push(spawn(format!("wc-flush-{i}"), move || inner.run_worker())?);
        }

        let inner = Arc::clone(&self.inner);
        handles.push(spawn("wc-flush-small".into(), move || {
            inner.run_small_flush_loop();
        })?);

        let inner = Arc::clone(&self.inner);
        handles.push(spawn("wc-flush-big".into(), move || {
            inner.run_big_flush_loop();
        })?);

        debug!(workers = self.inner.opts.workers, "write-cache flush loops started");
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.inner.mode.read()
    }

    /// Switch mode; waits for any running flush scan to finish
    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.inner.mode.write();
        if *current != mode {
            info!(from = %*current, to = %mode, "write-cache mode changed");
            *current = mode;
        }
    }

    /// Read a cached object
    pub fn get(&self, addr: &ObjectAddress) -> Result<Object> {
        let key = addr.encode_to_string();
        let data = match self.inner.db_get(&key)? {
            Some(data) => data,
            None => self.inner.fstree.get(addr)?,
        };
        Ok(Object::unmarshal(&data)?)
    }

    #[must_use]
    pub fn exists(&self, addr: &ObjectAddress) -> bool {
        matches!(self.inner.db_get(&addr.encode_to_string()), Ok(Some(_)))
            || self.inner.fstree.exists(addr)
    }

    /// Bytes currently held
    #[must_use]
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> FlushStatsSnapshot {
        let s = &self.inner.stats;
        FlushStatsSnapshot {
            small: s.small.load(Ordering::Relaxed),
            big: s.big.load(Ordering::Relaxed),
            drained: s.drained.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            evicted: s.evicted.load(Ordering::Relaxed),
        }
    }

    /// Stop background flushing and wait for the threads to exit
    pub fn close(&self) {
        // dropping the sender wakes every loop
        if self.close_tx.lock().take().is_none() {
            return;
        }

        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("write-cache flush thread panicked");
            }
        }
        info!(path = ?self.inner.opts.path, "write-cache closed");
    }
}

impl Drop for WriteCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<thread::JoinHandle<()>> {
    Ok(thread::Builder::new().name(name).spawn(f)?)
}

fn db_usage(db: &Database) -> Result<u64> {
    let rtx = db.begin_read()?;
    let table = rtx.open_table(CACHE)?;
    let mut total = 0;
    for entry in table.iter()? {
        let (_, v) = entry?;
        total += v.value().len() as u64;
    }
    Ok(total)
}

impl Inner {
    fn is_closed(&self) -> bool {
        matches!(self.close_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `timeout`; true if the cache was closed meanwhile
    fn wait_closed(&self, timeout: Duration) -> bool {
        matches!(
            self.close_rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    fn db_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CACHE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn db_put(&self, key: &str, data: &[u8]) -> Result<()> {
        let wtx = self.db.begin_write()?;
        wtx.open_table(CACHE)?.insert(key, data)?;
        wtx.commit()?;
        Ok(())
    }

    fn db_contains(&self, key: &str) -> Result<bool> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CACHE)?;
        Ok(table.get(key)?.is_some())
    }

    /// Remove an entry; returns the size of the removed value
    fn db_delete(&self, key: &str) -> Result<Option<u64>> {
        let wtx = self.db.begin_write()?;
        let removed = wtx
            .open_table(CACHE)?
            .remove(key)?
            .map(|v| v.value().len() as u64);
        wtx.commit()?;
        Ok(removed)
    }

    fn db_len(&self) -> Result<u64> {
        let rtx = self.db.begin_read()?;
        Ok(rtx.open_table(CACHE)?.len()?)
    }

    fn release(&self, size: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(size))
            });
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tempfile::tempdir;

    fn small_objects(n: usize) -> Vec<Object> {
        (0..n)
            .map(|i| Object::new(ObjectAddress::random(), vec![i as u8; 64]))
            .collect()
    }

    fn big_objects(n: usize) -> Vec<Object> {
        (0..n)
            .map(|i| Object::new(ObjectAddress::random(), vec![i as u8; 4096]))
            .collect()
    }

    #[test]
    fn test_small_loop_flushes_once() {
        let dir = tempdir().unwrap();
        let (cache, rec) = open(options(dir.path()));
        let objs = small_objects(40);
        for obj in &objs {
            cache.put(obj).unwrap();
        }

        cache.init().unwrap();
        wait_for(|| rec.indexed_len() == objs.len());
        // a few more scans must not resend anything
        thread::sleep(Duration::from_millis(100));
        cache.close();

        for obj in &objs {
            assert_eq!(rec.blob_count(&obj.address), 1);
            assert_eq!(rec.index_count(&obj.address), 1);
        }
        assert_eq!(cache.stats().small, objs.len() as u64);
    }

    #[test]
    fn test_big_loop_flushes_once() {
        let dir = tempdir().unwrap();
        let (cache, rec) = open(options(dir.path()));
        let objs = big_objects(5);
        for obj in &objs {
            cache.put(obj).unwrap();
        }

        cache.init().unwrap();
        wait_for(|| rec.indexed_len() == objs.len());
        thread::sleep(Duration::from_millis(100));
        cache.close();

        for obj in &objs {
            assert_eq!(rec.blob_count(&obj.address), 1);
        }
        assert_eq!(cache.stats().big, objs.len() as u64);
    }

    #[test]
    fn test_big_loop_honors_compress_flag() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.compress = true;
        let (cache, rec) = open(opts);
        let obj = big_objects(1).remove(0);
        cache.put(&obj).unwrap();
        assert!(cache.inner.compress_flags.contains(&obj.address.encode_to_string()));

        cache.init().unwrap();
        wait_for(|| rec.indexed_len() == 1);
        cache.close();

        assert_eq!(rec.compressed(&obj.address), Some(true));
        assert!(cache.inner.compress_flags.is_empty());
    }

    #[test]
    fn test_paths_race_without_duplicates() {
        let dir = tempdir().unwrap();
        let (cache, rec) = open(options(dir.path()));
        let mut objs = small_objects(60);
        objs.extend(big_objects(10));
        for obj in &objs {
            cache.put(obj).unwrap();
        }

        cache.init().unwrap();
        thread::sleep(Duration::from_millis(15));
        cache.set_mode(Mode::ReadOnly);
        cache.flush(false).unwrap();
        cache.close();

        assert_eq!(rec.indexed_len(), objs.len());
        for obj in &objs {
            assert_eq!(rec.blob_count(&obj.address), 1, "{}", obj.address);
        }
    }

    #[test]
    fn test_flush_requires_read_only() {
        let dir = tempdir().unwrap();
        let (cache, _) = open(options(dir.path()));
        assert!(matches!(cache.flush(false), Err(StorageError::MustBeReadOnly)));

        cache.set_mode(Mode::ReadOnly);
        cache.flush(false).unwrap();
    }

    #[test]
    fn test_drain_and_evict() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.flushed_capacity = 2;
        let (cache, rec) = open(opts);
        let objs = small_objects(5);
        for obj in &objs {
            cache.put(obj).unwrap();
        }

        cache.set_mode(Mode::ReadOnly);
        cache.flush(false).unwrap();
        assert_eq!(rec.indexed_len(), 5);
        assert_eq!(cache.stats().drained, 5);

        // only the two most recent flushed entries are still cached
        assert_eq!(cache.inner.db_len().unwrap(), 2);
        assert_eq!(cache.stats().evicted, 3);

        // second drain finds nothing new
        cache.flush(false).unwrap();
        for obj in &objs {
            assert_eq!(rec.blob_count(&obj.address), 1);
        }
    }

    #[test]
    fn test_drain_abort_semantics() {
        let dir = tempdir().unwrap();
        let (cache, rec) = open(options(dir.path()));
        let mut objs = small_objects(5);
        for obj in &objs {
            cache.put(obj).unwrap();
        }
        objs.sort_by_key(|o| o.address.encode_to_string());

        let bad_key = objs[2].address.encode_to_string();
        cache.inner.db_put(&bad_key, b"not an object").unwrap();

        cache.set_mode(Mode::ReadOnly);
        match cache.flush(false) {
            Err(StorageError::FlushEntry { key, .. }) => assert_eq!(key, bad_key),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(rec.blob_count(&objs[0].address), 1);
        assert_eq!(rec.blob_count(&objs[1].address), 1);
        assert_eq!(rec.blob_count(&objs[3].address), 0);
        assert_eq!(rec.blob_count(&objs[4].address), 0);

        cache.flush(true).unwrap();
        assert_eq!(rec.indexed_len(), 4);
        for (i, obj) in objs.iter().enumerate() {
            let expected = usize::from(i != 2);
            assert_eq!(rec.blob_count(&obj.address), expected);
        }
    }

    #[test]
    fn test_drain_skips_corrupted_file() {
        let dir = tempdir().unwrap();
        let (cache, rec) = open(options(dir.path()));
        let objs = big_objects(3);
        for obj in &objs {
            cache.put(obj).unwrap();
        }
        crate::fstree::corrupt_for_test(&cache.inner.fstree, &objs[1].address);

        cache.set_mode(Mode::ReadOnly);
        let err = cache.flush(false).unwrap_err();
        assert!(matches!(err, StorageError::FlushEntry { ref key, .. } if *key == objs[1].address.encode_to_string()));

        cache.flush(true).unwrap();
        assert_eq!(rec.blob_count(&objs[0].address), 1);
        assert_eq!(rec.blob_count(&objs[1].address), 0);
        assert_eq!(rec.blob_count(&objs[2].address), 1);
    }
}
