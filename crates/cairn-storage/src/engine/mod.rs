//! Storage engine: the set of shards of one node
//!
//! Objects are placed on the shard with the highest rendezvous score for
//! their address. Operations that look objects up walk the shards in the
//! same order, so a healthy node usually answers from the first shard.
//!
//! Shard errors are soft: they are logged and counted, and a shard that
//! keeps failing is switched to read-only.

mod inhume;
mod put;
mod shards;

pub use inhume::InhumePrm;
pub use shards::{HashedShard, ShardOrder};

use crate::error::{Result, StorageError};
use crate::shard::{AddressesCallback, Event, Shard, ShardCallbacks, ShardInfo};
use cairn_common::config::{EngineConfig, ShardConfig};
use cairn_common::{Config, Epoch, Mode, ObjectAddress};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Multi-shard local storage
pub struct StorageEngine {
    me: Weak<StorageEngine>,
    config: EngineConfig,
    shards: RwLock<HashMap<String, HashedShard>>,
    /// Current network epoch, shared with every shard
    epoch: Arc<AtomicU64>,
    /// Maintenance guard; mutating operations fail while set
    blocked: RwLock<Option<String>>,
}

impl StorageEngine {
    /// Engine without shards
    #[must_use]
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            shards: RwLock::new(HashMap::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            blocked: RwLock::new(None),
        })
    }

    /// Open every shard of the node configuration; relative shard paths are
    /// resolved against the data directory
    pub fn open(config: &Config) -> Result<Arc<Self>> {
        let engine = Self::new(config.engine.clone());
        for shard in &config.shards {
            let mut shard = shard.clone();
            if shard.path.is_relative() {
                shard.path = config.node.data_dir.join(&shard.path);
            }
            engine.add_shard(&shard)?;
        }
        info!(shards = engine.shards.read().len(), "storage engine opened");
        Ok(engine)
    }

    /// Open a shard and register it; returns its ID
    pub fn add_shard(&self, config: &ShardConfig) -> Result<String> {
        let shard = Shard::open(
            config,
            Arc::clone(&self.epoch),
            self.config.event_channel_capacity,
            self.shard_callbacks(),
        )?;
        let id = shard.id().to_string();

        let mut shards = self.shards.write();
        if shards.contains_key(&id) {
            let msg = format!("shard {id} is already registered");
            return Err(cairn_common::Error::configuration(msg).into());
        }
        shards.insert(id.clone(), HashedShard::new(shard, config.weight));

        info!(shard_id = %id, weight = config.weight, "shard added to the engine");
        Ok(id)
    }

    /// Start every shard; must be called within a tokio runtime
    pub fn init(&self) -> Result<()> {
        for sh in self.shards_in(ShardOrder::Unsorted) {
            if let Err(e) = sh.shard.init() {
                error!(shard_id = %sh.id(), error = %e, "could not initialize shard");
                return Err(e);
            }
        }
        info!("storage engine initialized");
        Ok(())
    }

    /// Stop and unregister every shard
    pub async fn close(&self) {
        let shards: Vec<_> = self.shards.write().drain().map(|(_, sh)| sh).collect();
        for sh in shards {
            sh.shard.close().await;
        }
        info!("storage engine closed");
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advance the epoch and fan the event out to every shard's GC.
    ///
    /// The epoch never moves backwards; an older value only re-triggers the
    /// collectors.
    pub async fn handle_new_epoch(&self, epoch: Epoch) {
        let prev = self.epoch.fetch_max(epoch, Ordering::AcqRel);
        debug!(epoch, prev, "new epoch");

        for sh in self.shards_in(ShardOrder::Unsorted) {
            sh.shard.notify_gc(Event::NewEpoch(epoch)).await;
        }
    }

    /// Refuse mutating operations until [`StorageEngine::resume_execution`];
    /// waits for running ones to finish
    pub fn block_execution(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(reason = %reason, "engine execution blocked");
        *self.blocked.write() = Some(reason);
    }

    pub fn resume_execution(&self) {
        if self.blocked.write().take().is_some() {
            info!("engine execution resumed");
        }
    }

    fn exec_if_not_blocked<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let blocked = self.blocked.read();
        if let Some(reason) = blocked.as_ref() {
            return Err(StorageError::ExecutionBlocked(reason.clone()));
        }
        op()
    }

    #[must_use]
    pub fn shard(&self, id: &str) -> Option<Arc<Shard>> {
        self.shards.read().get(id).map(|sh| Arc::clone(&sh.shard))
    }

    #[must_use]
    pub fn shard_infos(&self) -> Vec<ShardInfo> {
        let mut infos: Vec<_> = self
            .shards_in(ShardOrder::Unsorted)
            .iter()
            .map(|sh| sh.shard.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Change a shard's mode and reset its error counter
    pub fn set_shard_mode(&self, id: &str, mode: Mode) -> Result<()> {
        let shards = self.shards.read();
        let sh = shards
            .get(id)
            .ok_or_else(|| StorageError::ShardNotFound(id.to_string()))?;
        sh.shard.set_mode(mode);
        sh.errors.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Drain a shard's write-cache; the shard must not be read-write
    pub fn flush_writecache(&self, id: &str, ignore_errors: bool) -> Result<()> {
        let shard = self
            .shard(id)
            .ok_or_else(|| StorageError::ShardNotFound(id.to_string()))?;
        shard.flush_writecache(ignore_errors)
    }

    /// Snapshot of the registered shards in the requested order
    #[must_use]
    pub fn shards_in(&self, order: ShardOrder<'_>) -> Vec<HashedShard> {
        let mut shards: Vec<_> = self.shards.read().values().cloned().collect();
        order.arrange(&mut shards);
        shards
    }

    /// Log a soft shard failure; a shard reaching the configured threshold
    /// is switched to read-only
    fn report_shard_error(&self, sh: &HashedShard, msg: &str, err: &StorageError) {
        if matches!(err, StorageError::ReadOnly | StorageError::Degraded) {
            debug!(shard_id = %sh.id(), error = %err, "{msg}");
            return;
        }

        let errors = sh.errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(shard_id = %sh.id(), error = %err, errors, "{msg}");

        let threshold = self.config.shard_ro_error_threshold;
        if threshold > 0 && errors >= threshold && sh.shard.mode() == Mode::ReadWrite {
            sh.shard.set_mode(Mode::ReadOnly);
            sh.errors.store(0, Ordering::Relaxed);
            error!(shard_id = %sh.id(), errors, "shard switched to read-only mode due to errors");
        }
    }

    fn shard_callbacks(&self) -> ShardCallbacks {
        let callback = |f: fn(&Self, &CancellationToken, &[ObjectAddress])| -> AddressesCallback {
            let engine = self.me.clone();
            Arc::new(move |token: &CancellationToken, addrs: Vec<ObjectAddress>| {
                if let Some(engine) = engine.upgrade() {
                    f(&engine, token, &addrs);
                }
            })
        };

        ShardCallbacks {
            expired_tombstones: Some(callback(Self::process_expired_tombstones)),
            expired_locks: Some(callback(Self::process_expired_locks)),
            deleted_locks: Some(callback(Self::process_deleted_locks)),
        }
    }
}
