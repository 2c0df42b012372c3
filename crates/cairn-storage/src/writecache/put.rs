//! Ingest into the write-cache

use super::WriteCache;
use crate::error::{Result, StorageError};
use cairn_common::{Object, ObjectAddress};
use std::sync::atomic::Ordering;
use tracing::debug;

impl WriteCache {
    /// Cache an object.
    ///
    /// Fails with [`StorageError::BigObject`] above the maximum object size,
    /// [`StorageError::OutOfSpace`] when the cache is full and
    /// [`StorageError::ReadOnly`] when the cache does not accept writes.
    /// An address already cached is left as it is, flushed or not.
    pub fn put(&self, obj: &Object) -> Result<()> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        if mode.read_only() {
            return Err(StorageError::ReadOnly);
        }
        if self.exists(&obj.address) {
            debug!(address = %obj.address, "write-cache: object is already cached");
            return Ok(());
        }

        let data = obj.marshal()?;
        let size = data.len() as u64;
        if size > inner.opts.max_object_size {
            return Err(StorageError::BigObject {
                size,
                max: inner.opts.max_object_size,
            });
        }
        if inner.used.load(Ordering::Relaxed) + size > inner.opts.size_limit {
            return Err(StorageError::OutOfSpace);
        }

        let key = obj.address.encode_to_string();
        if size <= inner.opts.small_object_size {
            inner.db_put(&key, &data)?;
        } else {
            inner.fstree.put(&obj.address, &data)?;
            if inner.opts.compress {
                inner.compress_flags.insert(key.clone());
            }
        }
        inner.used.fetch_add(size, Ordering::Relaxed);

        debug!(address = %obj.address, size, "write-cache: object cached");
        Ok(())
    }

    /// Drop a cached object, flushed or not
    pub fn delete(&self, addr: &ObjectAddress) -> Result<()> {
        let inner = &self.inner;
        let mode = inner.mode.read();
        if mode.read_only() {
            return Err(StorageError::ReadOnly);
        }

        let key = addr.encode_to_string();
        let size = if let Some(size) = inner.db_delete(&key)? {
            size
        } else {
            let size = inner.fstree.size(addr)?;
            inner.fstree.delete(addr)?;
            size
        };

        inner.release(size);
        inner.flushed.forget(&key);
        inner.compress_flags.remove(&key);

        debug!(address = %addr, "write-cache: object deleted");
        Ok(())
    }
}
