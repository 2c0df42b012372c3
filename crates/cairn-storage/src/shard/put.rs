//! Object ingest and reads

use super::Shard;
use crate::error::{Result, StorageError};
use cairn_common::{ContainerId, Mode, Object, ObjectAddress, ObjectId};
use tracing::debug;

impl Shard {
    /// Store an object.
    ///
    /// The write-cache takes it when present and willing; otherwise the
    /// bytes go straight to the blob store. The metabase always records the
    /// object, without a storage ID while it sits in the cache.
    pub fn put(&self, obj: &Object) -> Result<()> {
        self.check_writable()?;

        let cached = match &self.writecache {
            Some(wc) => match wc.put(obj) {
                Ok(()) => true,
                Err(e) => {
                    debug!(shard_id = %self.id, address = %obj.address, error = %e,
                        "can't put object to write-cache, trying blobstor");
                    false
                }
            },
            None => false,
        };

        let sid = if cached {
            None
        } else {
            Some(self.blobstor.put_object(obj)?)
        };
        self.metabase.put(obj, sid.as_ref())
    }

    /// Read an object.
    ///
    /// In degraded mode the metabase is bypassed and the stores are probed
    /// directly.
    pub fn get(&self, addr: &ObjectAddress) -> Result<Object> {
        let degraded = self.mode() == Mode::Degraded;
        if !degraded && !self.metabase.exists(addr, self.epoch())? {
            return Err(StorageError::NotFound);
        }

        if let Some(wc) = &self.writecache {
            match wc.get(addr) {
                Ok(obj) => return Ok(obj),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    debug!(shard_id = %self.id, address = %addr, error = %e,
                        "can't read object from write-cache");
                }
            }
        }

        let sid = if degraded {
            None
        } else {
            self.metabase.storage_id(addr)?
        };
        self.blobstor.get_object(addr, sid.as_ref())
    }

    /// Presence probe.
    ///
    /// Besides `Ok`, returns [`StorageError::AlreadyRemoved`] for inhumed
    /// objects, [`StorageError::ObjectExpired`] for expired ones and
    /// [`StorageError::SplitInfo`] when `addr` is a split root known here.
    pub fn exists(&self, addr: &ObjectAddress) -> Result<bool> {
        if self.mode() == Mode::Degraded {
            let cached = self.writecache.as_ref().is_some_and(|wc| wc.exists(addr));
            return Ok(cached || self.blobstor.exists(addr)?);
        }
        self.metabase.exists(addr, self.epoch())
    }

    /// Protect `locked` objects of `container` with `locker`
    pub fn lock(&self, container: ContainerId, locker: ObjectId, locked: &[ObjectId]) -> Result<()> {
        self.check_writable()?;
        self.metabase.lock(container, locker, locked)
    }

    pub fn is_locked(&self, addr: &ObjectAddress) -> Result<bool> {
        self.metabase.is_locked(addr)
    }
}
