//! Shard: one metabase, one blob store, an optional write-cache and a
//! garbage collector
//!
//! A shard is opened synchronously and started with [`Shard::init`], which
//! spawns the write-cache threads and the GC tasks (the latter on the
//! current tokio runtime).

mod expired;
pub mod gc;
mod inhume;
mod put;

pub use gc::{Event, EventHandler, EventKind, GcStatsSnapshot};

use crate::blobstor::BlobStor;
use crate::error::{Result, StorageError};
use crate::metabase::Metabase;
use crate::writecache::{self, MainStorage, ObjectIndex, WriteCache};
use cairn_common::config::{GcConfig, ShardConfig};
use cairn_common::{Epoch, Mode, ObjectAddress};
use gc::{Gc, GcPrm};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Engine hook receiving lock or tombstone addresses found by a shard
pub type AddressesCallback = Arc<dyn Fn(&CancellationToken, Vec<ObjectAddress>) + Send + Sync>;

/// Hooks a shard calls back into its owner with
#[derive(Clone, Default)]
pub struct ShardCallbacks {
    /// Tombstones that expired on this shard
    pub expired_tombstones: Option<AddressesCallback>,
    /// Lock objects that expired on this shard
    pub expired_locks: Option<AddressesCallback>,
    /// Lock objects physically deleted from this shard
    pub deleted_locks: Option<AddressesCallback>,
}

#[derive(Debug, Default)]
struct ShardStats {
    removed: AtomicU64,
    expired_marked: AtomicU64,
}

/// Shard summary for logs and the node's status output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardInfo {
    pub id: String,
    pub path: PathBuf,
    pub mode: Mode,
    pub writecache: bool,
    /// Objects physically removed by the GC
    pub removed: u64,
    /// Expired objects marked as garbage
    pub expired_marked: u64,
}

/// One storage unit
pub struct Shard {
    id: String,
    path: PathBuf,
    mode: RwLock<Mode>,
    /// Current network epoch, shared with the engine
    epoch: Arc<AtomicU64>,
    metabase: Arc<Metabase>,
    blobstor: Arc<BlobStor>,
    writecache: Option<WriteCache>,
    gc_config: GcConfig,
    event_capacity: usize,
    gc: Mutex<Option<Gc>>,
    callbacks: ShardCallbacks,
    stats: ShardStats,
}

impl Shard {
    /// Open the shard's stores; nothing runs in the background until
    /// [`Shard::init`]
    pub fn open(
        config: &ShardConfig,
        epoch: Arc<AtomicU64>,
        event_capacity: usize,
        callbacks: ShardCallbacks,
    ) -> Result<Arc<Self>> {
        let path = config.path.clone();
        std::fs::create_dir_all(&path)?;

        let id = config.id.clone().unwrap_or_else(|| shard_id_from_path(&path));
        let metabase = Arc::new(Metabase::open(path.join("meta.db"))?);
        let blobstor = Arc::new(BlobStor::open(path.join("blobstor"), &config.blobstor)?);

        let writecache = if config.writecache.enabled {
            let wc_path = if config.writecache.path.is_absolute() {
                config.writecache.path.clone()
            } else {
                path.join(&config.writecache.path)
            };
            let opts = writecache::Options::from_config(
                &config.writecache,
                wc_path,
                config.blobstor.compress,
            );
            let wc = WriteCache::open(
                opts,
                Arc::clone(&blobstor) as Arc<dyn MainStorage>,
                Arc::clone(&metabase) as Arc<dyn ObjectIndex>,
            )?;
            wc.set_mode(cache_mode(config.mode));
            Some(wc)
        } else {
            None
        };

        info!(shard_id = %id, path = ?path, mode = %config.mode, "shard opened");

        Ok(Arc::new(Self {
            id,
            path,
            mode: RwLock::new(config.mode),
            epoch,
            metabase,
            blobstor,
            writecache,
            gc_config: config.gc.clone(),
            event_capacity,
            gc: Mutex::new(None),
            callbacks,
            stats: ShardStats::default(),
        }))
    }

    /// Start the write-cache flushing and the garbage collector
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if let Some(wc) = &self.writecache {
            wc.init()?;
        }

        let mut gc = self.gc.lock();
        if gc.is_none() {
            *gc = Some(Gc::start(GcPrm {
                remover_interval: self.gc_config.remover_interval(),
                remover: self.remover(),
                handlers: HashMap::from([(EventKind::NewEpoch, self.epoch_handlers())]),
                event_capacity: self.event_capacity,
            }));
        }

        info!(shard_id = %self.id, "shard initialized");
        Ok(())
    }

    /// Stop the garbage collector and the write-cache
    pub async fn close(&self) {
        let gc = self.gc.lock().take();
        if let Some(gc) = gc {
            gc.stop().await;
        }
        if let Some(wc) = &self.writecache {
            wc.close();
        }
        info!(shard_id = %self.id, "shard closed");
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    /// Switch mode; the write-cache follows as read-only unless the shard
    /// is read-write
    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.mode.write();
        if *current == mode {
            return;
        }
        if let Some(wc) = &self.writecache {
            wc.set_mode(cache_mode(mode));
        }
        info!(shard_id = %self.id, from = %*current, to = %mode, "shard mode changed");
        *current = mode;
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    /// Drain the write-cache into the main storage; requires the cache to
    /// be read-only
    pub fn flush_writecache(&self, ignore_errors: bool) -> Result<()> {
        match &self.writecache {
            Some(wc) => wc.flush(ignore_errors),
            None => Ok(()),
        }
    }

    /// Deliver an event to the garbage collector; dropped when the shard
    /// is not running
    pub async fn notify_gc(&self, event: Event) {
        let delivered = {
            let gc = self.gc.lock();
            gc.as_ref().map(|gc| gc.sender())
        };
        match delivered {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    warn!(shard_id = %self.id, ?event, "GC event channel is closed");
                }
            }
            None => warn!(shard_id = %self.id, ?event, "GC is not running, event dropped"),
        }
    }

    #[must_use]
    pub fn gc_stats(&self) -> Option<GcStatsSnapshot> {
        self.gc.lock().as_ref().map(Gc::stats)
    }

    #[must_use]
    pub fn info(&self) -> ShardInfo {
        ShardInfo {
            id: self.id.clone(),
            path: self.path.clone(),
            mode: self.mode(),
            writecache: self.writecache.is_some(),
            removed: self.stats.removed.load(Ordering::Relaxed),
            expired_marked: self.stats.expired_marked.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn metabase(&self) -> &Metabase {
        &self.metabase
    }

    /// Fail unless the shard accepts mutations
    fn check_writable(&self) -> Result<()> {
        match self.mode() {
            Mode::ReadWrite => Ok(()),
            Mode::ReadOnly => Err(StorageError::ReadOnly),
            Mode::Degraded => Err(StorageError::Degraded),
        }
    }

    fn remover(self: &Arc<Self>) -> gc::Remover {
        let shard = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(shard) = shard.upgrade() {
                shard.remove_garbage();
            }
        })
    }
}

const fn cache_mode(shard_mode: Mode) -> Mode {
    match shard_mode {
        Mode::ReadWrite => Mode::ReadWrite,
        Mode::ReadOnly | Mode::Degraded => Mode::ReadOnly,
    }
}

fn shard_id_from_path(path: &Path) -> String {
    let hash = xxhash_rust::xxh64::xxh64(path.as_os_str().as_encoded_bytes(), 0);
    format!("{hash:016x}")
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use cairn_common::config::ShardConfig;
    use std::time::Duration;

    /// Config of a shard under `path` with a fast remover
    pub fn config(path: &Path) -> ShardConfig {
        let mut config = ShardConfig::with_path(path);
        config.blobstor.small_object_size = 1024;
        config.gc.remover_interval_ms = 10;
        config.gc.remover_batch_size = 100;
        config
    }

    pub fn config_with_writecache(path: &Path) -> ShardConfig {
        let mut config = config(path);
        config.writecache.enabled = true;
        config.writecache.small_object_size = 512;
        config.writecache.flush_workers = 2;
        config.writecache.flush_interval_ms = 10;
        config.writecache.big_flush_interval_ms = Some(20);
        config
    }

    pub fn open(config: &ShardConfig, callbacks: ShardCallbacks) -> (Arc<Shard>, Arc<AtomicU64>) {
        let epoch = Arc::new(AtomicU64::new(0));
        let shard = Shard::open(config, Arc::clone(&epoch), 4, callbacks).unwrap();
        (shard, epoch)
    }

    /// Callback recording every address it receives
    pub fn recording_callback() -> (AddressesCallback, Arc<Mutex<Vec<ObjectAddress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: AddressesCallback =
            Arc::new(move |_: &CancellationToken, addrs: Vec<ObjectAddress>| sink.lock().extend(addrs));
        (callback, seen)
    }

    pub async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
