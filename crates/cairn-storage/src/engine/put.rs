//! Object placement, lookups and locks

use super::{ShardOrder, StorageEngine};
use crate::error::{Result, StorageError};
use cairn_common::{ContainerId, Mode, Object, ObjectAddress, ObjectId, ObjectType, SplitInfo};
use tracing::debug;

impl StorageEngine {
    /// Store an object on the first writable shard in rendezvous order.
    ///
    /// Objects already stored are left as they are; inhumed ones are refused
    /// with [`StorageError::AlreadyRemoved`]. Storing a lock object also
    /// locks its members.
    pub fn put(&self, obj: &Object) -> Result<()> {
        self.exec_if_not_blocked(|| {
            if self.exists_inner(&obj.address)? {
                debug!(address = %obj.address, "object is already stored");
                return Ok(());
            }

            let mut stored = false;
            for sh in self.shards_in(ShardOrder::Hrw(&obj.address)) {
                if sh.shard.mode() != Mode::ReadWrite {
                    continue;
                }
                match sh.shard.put(obj) {
                    Ok(()) => {
                        debug!(shard_id = %sh.id(), address = %obj.address, "object stored");
                        stored = true;
                        break;
                    }
                    Err(e) => self.report_shard_error(&sh, "could not put object to shard", &e),
                }
            }
            if !stored {
                return Err(StorageError::PutFailure);
            }

            if obj.object_type == ObjectType::Lock {
                let members = obj.members()?;
                self.lock_inner(obj.address.container(), obj.address.object(), &members)?;
            }
            Ok(())
        })
    }

    /// Read an object from the first shard that has it.
    ///
    /// Inhumed and expired objects are reported as such; a split root is
    /// reported with whatever split information the shards hold.
    pub fn get(&self, addr: &ObjectAddress) -> Result<Object> {
        let mut split: Option<SplitInfo> = None;

        for sh in self.shards_in(ShardOrder::Hrw(addr)) {
            match sh.shard.get(addr) {
                Ok(obj) => return Ok(obj),
                Err(StorageError::NotFound) => {}
                Err(e) if e.is_removed() || e.is_expired() => return Err(e),
                Err(StorageError::SplitInfo(info)) => merge_split_info(&mut split, info),
                Err(e) => self.report_shard_error(&sh, "could not get object from shard", &e),
            }
        }

        match split {
            Some(info) => Err(StorageError::SplitInfo(info)),
            None => Err(StorageError::NotFound),
        }
    }

    /// Whether some shard holds the object; inhumed objects are reported
    /// with [`StorageError::AlreadyRemoved`]
    pub fn exists(&self, addr: &ObjectAddress) -> Result<bool> {
        self.exists_inner(addr)
    }

    fn exists_inner(&self, addr: &ObjectAddress) -> Result<bool> {
        for sh in self.shards_in(ShardOrder::Hrw(addr)) {
            match sh.shard.exists(addr) {
                Ok(true) => return Ok(true),
                Ok(false) | Err(StorageError::SplitInfo(_)) => {}
                Err(e) if e.is_removed() => return Err(e),
                Err(e) if e.is_expired() => return Ok(false),
                Err(e) => self.report_shard_error(&sh, "could not check existence of object in shard", &e),
            }
        }
        Ok(false)
    }

    /// Protect `locked` objects of `container` with `locker`.
    ///
    /// Each object is locked on every shard that knows it, or on its
    /// placement shard when none does.
    pub fn lock(&self, container: ContainerId, locker: ObjectId, locked: &[ObjectId]) -> Result<()> {
        self.exec_if_not_blocked(|| self.lock_inner(container, locker, locked))
    }

    fn lock_inner(&self, container: ContainerId, locker: ObjectId, locked: &[ObjectId]) -> Result<()> {
        for id in locked {
            let addr = ObjectAddress::new(container, *id);
            let shards = self.shards_in(ShardOrder::Hrw(&addr));
            let mut done = false;

            for sh in &shards {
                match sh.shard.exists(&addr) {
                    Ok(true) | Err(StorageError::SplitInfo(_)) => {}
                    Ok(false) => continue,
                    Err(e) if e.is_removed() => return Err(e),
                    Err(e) if e.is_expired() => continue,
                    Err(e) => {
                        self.report_shard_error(sh, "could not check locked object for presence in shard", &e);
                        continue;
                    }
                }
                match sh.shard.lock(container, locker, &[*id]) {
                    Ok(()) => done = true,
                    Err(e) if e.is_removed() => return Err(e),
                    Err(e) => self.report_shard_error(sh, "could not lock object in shard", &e),
                }
            }

            if !done {
                // not stored yet: keep the lock where the object will land
                let placed = shards
                    .iter()
                    .filter(|sh| sh.shard.mode() == Mode::ReadWrite)
                    .find_map(|sh| match sh.shard.lock(container, locker, &[*id]) {
                        Ok(()) => Some(()),
                        Err(e) => {
                            self.report_shard_error(sh, "could not lock object in shard", &e);
                            None
                        }
                    });
                if placed.is_none() {
                    return Err(StorageError::PutFailure);
                }
            }
        }
        Ok(())
    }

    /// Whether any shard holds a lock on `addr`
    pub fn is_locked(&self, addr: &ObjectAddress) -> Result<bool> {
        for sh in self.shards_in(ShardOrder::Unsorted) {
            if sh.shard.is_locked(addr)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn merge_split_info(acc: &mut Option<SplitInfo>, info: SplitInfo) {
    match acc {
        Some(acc) => {
            if acc.split_id.is_none() {
                acc.split_id = info.split_id;
            }
            if acc.last_part.is_none() {
                acc.last_part = info.last_part;
            }
        }
        None => *acc = Some(info),
    }
}
