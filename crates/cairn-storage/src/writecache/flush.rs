//! Moving cached objects to the main storage

use super::flushed::{Evicted, FlushClaim};
use super::{CACHE, Inner, QueuedObject, WriteCache};
use crate::blobstor::PutPrm;
use crate::error::{Result, StorageError};
use crate::fstree::IteratePrm;
use cairn_common::{Object, ObjectAddress};
use crossbeam_channel::select;
use redb::ReadableTable;
use std::ops::Bound;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

impl WriteCache {
    /// Write every cached object to the main storage.
    ///
    /// The cache must be read-only so nothing new arrives while draining.
    /// The file tree is drained first, then the keyed database. Without
    /// `ignore_errors` the first entry that cannot be read, decoded or
    /// written stops the drain with [`StorageError::FlushEntry`]; entries
    /// before it stay flushed.
    pub fn flush(&self, ignore_errors: bool) -> Result<()> {
        let mode = self.inner.mode.read();
        if !mode.read_only() {
            return Err(StorageError::MustBeReadOnly);
        }

        self.inner.drain(ignore_errors)
    }
}

impl Inner {
    pub(super) fn run_worker(&self) {
        loop {
            select! {
                recv(self.flush_rx) -> msg => match msg {
                    Ok(queued) => self.flush_queued(queued),
                    Err(_) => return,
                },
                recv(self.close_rx) -> _ => return,
            }
        }
    }

    pub(super) fn run_small_flush_loop(&self) {
        while !self.wait_closed(self.opts.flush_interval) {
            self.flush_small_objects();
        }
    }

    pub(super) fn run_big_flush_loop(&self) {
        while !self.wait_closed(self.opts.big_flush_interval) {
            self.flush_big_objects();
        }
    }

    fn flush_queued(&self, queued: QueuedObject) {
        let Some(claim) = self.flushed.claim(&queued.key) else {
            return;
        };
        // the scan snapshot may outlive an eviction
        match self.db_contains(&queued.key) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(key = %queued.key, error = %e, "can't read write-cache database");
                return;
            }
        }

        match self.flush_object(&queued.obj, &queued.data, false) {
            Ok(()) => {
                self.stats.small.fetch_add(1, Ordering::Relaxed);
                self.mark_flushed(claim, true);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(address = %queued.obj.address, error = %e, "can't flush object to the main storage");
            }
        }
    }

    /// Scan the keyed database from the start in batches and queue every
    /// entry not flushed yet
    fn flush_small_objects(&self) {
        let mut cursor: Option<String> = None;

        loop {
            if self.is_closed() {
                return;
            }

            let mode = self.mode.read();
            if mode.read_only() {
                drop(mode);
                if self.wait_closed(self.opts.flush_interval) {
                    return;
                }
                continue;
            }

            let (batch, last) = match self.read_batch(cursor.as_deref()) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "can't read write-cache database");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            let count = batch.len();
            for (key, data) in batch {
                let obj = match Object::unmarshal(&data) {
                    Ok(obj) => obj,
                    Err(e) => {
                        debug!(key = %key, error = %e, "skipping undecodable write-cache entry");
                        continue;
                    }
                };

                let queued = QueuedObject { key, obj, data };
                select! {
                    send(self.flush_tx, queued) -> res => {
                        if res.is_err() {
                            return;
                        }
                    },
                    recv(self.close_rx) -> _ => return,
                }
            }
            drop(mode);

            debug!(count, start = ?cursor, "tried to flush items from write-cache");
            cursor = last;
        }
    }

    /// Up to a batch of unflushed entries after `after`, plus the last key
    /// visited
    fn read_batch(&self, after: Option<&str>) -> Result<(Vec<(String, Vec<u8>)>, Option<String>)> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CACHE)?;

        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut batch = Vec::new();
        let mut last = None;

        for entry in table.range::<&str>((lower, Bound::Unbounded))? {
            let (k, v) = entry?;
            let key = k.value();
            last = Some(key.to_string());

            if self.flushed.contains(key) {
                continue;
            }
            batch.push((key.to_string(), v.value().to_vec()));
            if batch.len() >= self.opts.flush_batch_size {
                break;
            }
        }

        Ok((batch, last))
    }

    /// One pass over the file tree writing every unflushed object
    fn flush_big_objects(&self) {
        let mode = self.mode.read();
        if mode.read_only() {
            return;
        }

        let mut count = 0u64;
        let res = self.fstree.iterate(IteratePrm {
            ignore_errors: true,
            handler: &mut |addr, lazy| {
                if self.is_closed() {
                    return Err(StorageError::Closed);
                }

                let key = addr.encode_to_string();
                // flushed entries are skipped without reading them
                if self.flushed.contains(&key) {
                    return Ok(());
                }
                let Some(claim) = self.flushed.claim(&key) else {
                    return Ok(());
                };

                let data = match lazy.read() {
                    Ok(data) => data,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => {
                        error!(address = %addr, error = %e, "can't read a file");
                        return Ok(());
                    }
                };
                let obj = match Object::unmarshal(&data) {
                    Ok(obj) => obj,
                    Err(e) => {
                        error!(address = %addr, error = %e, "can't decode cached object");
                        return Ok(());
                    }
                };

                let compress = self.compress_flags.contains(&key);
                if let Err(e) = self.flush_object(&obj, &data, !compress) {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(address = %addr, error = %e, "can't flush object to blobstor");
                    return Ok(());
                }
                if compress {
                    self.compress_flags.remove(&key);
                }

                self.stats.big.fetch_add(1, Ordering::Relaxed);
                self.mark_flushed(claim, false);
                count += 1;
                Ok(())
            },
        });

        match res {
            Ok(()) | Err(StorageError::Closed) => {}
            Err(e) => warn!(error = %e, "write-cache file tree iteration failed"),
        }
        if count > 0 {
            debug!(count, "flushed big objects from write-cache");
        }
    }

    pub(super) fn drain(&self, ignore_errors: bool) -> Result<()> {
        self.fstree.iterate(IteratePrm {
            ignore_errors,
            handler: &mut |addr, lazy| {
                let key = addr.encode_to_string();
                let Some(claim) = self.flushed.claim(&key) else {
                    return Ok(());
                };

                let data = match lazy.read() {
                    Ok(data) => data,
                    // evicted after the directory was listed
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return self.drain_error(key, e, ignore_errors),
                };

                let compress = self.compress_flags.contains(&key);
                let res = Object::unmarshal(&data)
                    .map_err(StorageError::from)
                    .and_then(|obj| self.flush_object(&obj, &data, !compress));

                match res {
                    Ok(()) => {
                        if compress {
                            self.compress_flags.remove(&key);
                        }
                        self.stats.drained.fetch_add(1, Ordering::Relaxed);
                        self.mark_flushed(claim, false);
                        Ok(())
                    }
                    Err(e) => self.drain_error(key, e, ignore_errors),
                }
            },
        })?;

        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CACHE)?;
        for entry in table.iter()? {
            let (k, v) = entry?;
            let key = k.value();
            let Some(claim) = self.flushed.claim(key) else {
                continue;
            };
            if !self.db_contains(key)? {
                continue;
            }

            let res = (|| -> Result<()> {
                let addr: ObjectAddress = key.parse()?;
                let obj = Object::unmarshal(v.value())?;
                if obj.address != addr {
                    return Err(StorageError::corrupted(format!(
                        "entry holds object {}",
                        obj.address
                    )));
                }
                self.flush_object(&obj, v.value(), false)
            })();

            match res {
                Ok(()) => {
                    self.stats.drained.fetch_add(1, Ordering::Relaxed);
                    self.mark_flushed(claim, true);
                }
                Err(e) => self.drain_error(key.to_string(), e, ignore_errors)?,
            }
        }

        Ok(())
    }

    fn drain_error(&self, key: String, e: StorageError, ignore_errors: bool) -> Result<()> {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        if ignore_errors {
            warn!(key = %key, error = %e, "skipping write-cache entry");
            return Ok(());
        }
        Err(StorageError::FlushEntry {
            key,
            source: Box::new(e),
        })
    }

    /// Write an object to the blob store, then index it with its location
    fn flush_object(&self, obj: &Object, data: &[u8], dont_compress: bool) -> Result<()> {
        let sid = self.blobstor.store(PutPrm {
            address: obj.address,
            raw_data: data,
            dont_compress,
        })?;

        match self.index.index(obj, &sid) {
            Err(e) if e.is_removed() => {
                debug!(address = %obj.address, "object was inhumed while cached");
                Ok(())
            }
            other => other,
        }
    }

    fn mark_flushed(&self, claim: FlushClaim<'_>, in_db: bool) {
        let evicted = claim.commit(in_db);
        if !evicted.is_empty() {
            self.evict(evicted);
        }
    }

    /// Drop cached copies of flushed objects pushed out of the flushed set.
    ///
    /// An entry leaves the set only after its copy is gone, so a concurrent
    /// scan cannot claim it in between.
    fn evict(&self, evicted: Vec<Evicted>) {
        for (key, in_db) in evicted {
            let res = if in_db {
                self.db_delete(&key).map(|size| size.unwrap_or(0))
            } else {
                key.parse::<ObjectAddress>()
                    .map_err(StorageError::from)
                    .and_then(|addr| {
                        let size = self.fstree.size(&addr)?;
                        self.fstree.delete(&addr)?;
                        Ok(size)
                    })
            };

            match res {
                Ok(size) => {
                    self.release(size);
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    self.flushed.forget(&key);
                }
                Err(e) if e.is_not_found() => self.flushed.forget(&key),
                Err(e) => {
                    warn!(key = %key, error = %e, "can't evict flushed object from write-cache");
                    self.flushed.requeue(key);
                }
            }
        }
    }
}
