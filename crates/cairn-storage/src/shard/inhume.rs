//! Logical and physical removal

use super::Shard;
use crate::blobstor::StorageId;
use crate::error::{Result, StorageError};
use crate::metabase::{InhumePrm, InhumeRes};
use cairn_common::ObjectAddress;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl Shard {
    /// Mark addresses as logically removed.
    ///
    /// Lock checks are evaluated at the shard's current epoch. Cached copies
    /// are dropped once the graves are written.
    pub fn inhume(&self, prm: InhumePrm) -> Result<InhumeRes> {
        self.check_writable()?;

        let prm = prm.at_epoch(self.epoch());
        let res = self.metabase.inhume(&prm)?;

        if let Some(wc) = &self.writecache {
            for addr in prm.addresses() {
                match wc.delete(addr) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        debug!(shard_id = %self.id, address = %addr, error = %e,
                            "can't remove inhumed object from write-cache");
                    }
                }
            }
        }
        Ok(res)
    }

    /// Physically remove objects; returns how many had index records
    pub fn delete(&self, addrs: &[ObjectAddress]) -> Result<usize> {
        self.check_writable()?;
        self.delete_objects(addrs)
    }

    fn delete_objects(&self, addrs: &[ObjectAddress]) -> Result<usize> {
        let res = self.metabase.delete(addrs)?;

        let sids: HashMap<ObjectAddress, Option<StorageId>> = res
            .removed
            .iter()
            .map(|r| (r.address, r.storage_id.clone()))
            .collect();

        for addr in addrs {
            // graves without a record may still have bytes somewhere
            let sid = sids.get(addr).and_then(Option::as_ref);
            self.delete_bytes(addr, sid);
        }

        self.stats
            .removed
            .fetch_add(res.removed.len() as u64, Ordering::Relaxed);

        if !res.lockers.is_empty()
            && let Some(callback) = &self.callbacks.deleted_locks
        {
            callback(&CancellationToken::new(), res.lockers);
        }

        Ok(res.removed.len())
    }

    fn delete_bytes(&self, addr: &ObjectAddress, sid: Option<&StorageId>) {
        if let Some(wc) = &self.writecache {
            match wc.delete(addr) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    debug!(shard_id = %self.id, address = %addr, error = %e,
                        "can't remove object from write-cache");
                }
            }
        }

        match self.blobstor.delete(addr, sid) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(shard_id = %self.id, address = %addr, error = %e,
                    "can't remove object from blobstor");
            }
        }
    }

    /// One remover pass: physically delete up to a batch of GC-marked graves
    pub(super) fn remove_garbage(&self) {
        if self.mode() != cairn_common::Mode::ReadWrite {
            return;
        }

        let batch_size = self.gc_config.remover_batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        let res = self.metabase.iterate_graveyard(&mut |grave| {
            if grave.gc_mark {
                batch.push(grave.address);
                if batch.len() >= batch_size {
                    return Err(StorageError::Interrupted);
                }
            }
            Ok(())
        });
        if let Err(e) = res {
            warn!(shard_id = %self.id, error = %e, "iterator over metabase graveyard failed");
            return;
        }

        if batch.is_empty() {
            return;
        }

        match self.delete_objects(&batch) {
            Ok(removed) => {
                debug!(shard_id = %self.id, marked = batch.len(), removed, "GC: garbage removed");
            }
            Err(e) => {
                warn!(shard_id = %self.id, error = %e, "could not delete the objects");
            }
        }
    }
}
