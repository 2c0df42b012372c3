//! Cross-shard inhume and the broadcast of lock and tombstone expiry

use super::{ShardOrder, StorageEngine};
use crate::error::{Result, StorageError};
use crate::metabase;
use cairn_common::ObjectAddress;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parameters of [`StorageEngine::inhume`]
#[derive(Clone, Debug)]
pub struct InhumePrm {
    tombstone: Option<ObjectAddress>,
    addrs: Vec<ObjectAddress>,
    force: bool,
}

impl InhumePrm {
    /// Inhume `addrs` on behalf of `tombstone`
    #[must_use]
    pub fn with_target(tombstone: ObjectAddress, addrs: impl Into<Vec<ObjectAddress>>) -> Self {
        Self {
            tombstone: Some(tombstone),
            addrs: addrs.into(),
            force: false,
        }
    }

    /// Mark `addrs` for physical removal
    #[must_use]
    pub fn mark_as_garbage(addrs: impl Into<Vec<ObjectAddress>>) -> Self {
        Self {
            tombstone: None,
            addrs: addrs.into(),
            force: false,
        }
    }

    /// Mark as garbage without any lock checks; drops tombstone attribution
    #[must_use]
    pub fn with_force_removal(mut self) -> Self {
        self.force = true;
        self.tombstone = None;
        self
    }

    fn shard_prm(&self, addr: ObjectAddress) -> metabase::InhumePrm {
        let prm = match self.tombstone {
            Some(tombstone) => metabase::InhumePrm::tombstone(tombstone, vec![addr]),
            None => metabase::InhumePrm::gc_mark(vec![addr]),
        };
        prm.with_force(self.force)
    }
}

/// Outcome of inhuming one address across the shards
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InhumeStatus {
    /// No shard took the address
    Fail,
    Locked,
    LockRemoval,
    Ok,
}

impl StorageEngine {
    /// Mark objects as logically removed.
    ///
    /// Addresses are processed in order and the call stops at the first one
    /// that is locked on any shard ([`StorageError::ObjectLocked`]), is a
    /// lock object
    /// still in force ([`StorageError::LockObjectRemoval`]) or that no shard
    /// accepted ([`StorageError::InhumeFailure`]). Addresses already inhumed
    /// or expired somewhere count as done.
    pub fn inhume(&self, prm: &InhumePrm) -> Result<()> {
        self.exec_if_not_blocked(|| {
            for addr in &prm.addrs {
                // a lock may sit on another shard than the object itself
                if !prm.force {
                    match self.is_locked(addr) {
                        Ok(true) => return Err(StorageError::ObjectLocked),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(address = %addr, error = %e, "removing an object without full locking check");
                        }
                    }
                }

                let shard_prm = prm.shard_prm(*addr);

                let status = match self.inhume_addr(addr, &shard_prm, true) {
                    // presence probes may miss objects, try every shard blindly
                    InhumeStatus::Fail => self.inhume_addr(addr, &shard_prm, false),
                    status => status,
                };

                match status {
                    InhumeStatus::Ok => {}
                    InhumeStatus::Locked => return Err(StorageError::ObjectLocked),
                    InhumeStatus::LockRemoval => return Err(StorageError::LockObjectRemoval),
                    InhumeStatus::Fail => return Err(StorageError::InhumeFailure),
                }
            }
            Ok(())
        })
    }

    fn inhume_addr(
        &self,
        addr: &ObjectAddress,
        prm: &metabase::InhumePrm,
        check_exists: bool,
    ) -> InhumeStatus {
        let mut status = InhumeStatus::Fail;
        // split roots may be known to several shards: visit all of them
        let mut root = false;

        for sh in self.shards_in(ShardOrder::Hrw(addr)) {
            if check_exists {
                match sh.shard.exists(addr) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) if e.is_removed() || e.is_expired() => {
                        debug!(shard_id = %sh.id(), address = %addr, "object is already removed");
                        return InhumeStatus::Ok;
                    }
                    Err(StorageError::SplitInfo(_)) => root = true,
                    Err(e) => {
                        self.report_shard_error(&sh, "could not check for presents in shard", &e);
                        continue;
                    }
                }
            }

            match sh.shard.inhume(prm.clone()) {
                Ok(_) => {
                    status = InhumeStatus::Ok;
                    if !root {
                        break;
                    }
                }
                Err(StorageError::ObjectLocked) => return InhumeStatus::Locked,
                Err(StorageError::LockObjectRemoval) => return InhumeStatus::LockRemoval,
                Err(e) => self.report_shard_error(&sh, "could not inhume object in shard", &e),
            }
        }
        status
    }

    /// Mark as garbage everything attributed to expired `tombstones`, on
    /// every shard
    pub fn process_expired_tombstones(&self, token: &CancellationToken, tombstones: &[ObjectAddress]) {
        for sh in self.shards_in(ShardOrder::Unsorted) {
            sh.shard.handle_expired_tombstones(tombstones);
            if token.is_cancelled() {
                info!("interrupt processing the expired tombstones by context");
                return;
            }
        }
    }

    /// Release objects protected by expired `lockers`, on every shard
    pub fn process_expired_locks(&self, token: &CancellationToken, lockers: &[ObjectAddress]) {
        for sh in self.shards_in(ShardOrder::Unsorted) {
            sh.shard.handle_expired_locks(lockers);
            if token.is_cancelled() {
                info!("interrupt processing the expired locks by context");
                return;
            }
        }
    }

    /// Release objects protected by deleted `lockers`, on every shard
    pub fn process_deleted_locks(&self, token: &CancellationToken, lockers: &[ObjectAddress]) {
        for sh in self.shards_in(ShardOrder::Unsorted) {
            sh.shard.handle_deleted_locks(lockers);
            if token.is_cancelled() {
                info!("interrupt processing the deleted locks by context");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::metabase::Grave;
    use crate::shard::Shard;
    use crate::shard::testutil::wait_until;
    use cairn_common::{Mode, Object, ObjectId, ParentInfo};
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn graves(shard: &Shard) -> Vec<Grave> {
        let mut out = Vec::new();
        shard
            .metabase()
            .iterate_graveyard(&mut |g| {
                out.push(g);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_inhume_stops_at_holder() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 3);
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let order = sorted(&engine, &obj.address);
        order[1].put(&obj).unwrap();

        let tomb = obj.address.with_object(ObjectId::new());
        engine
            .inhume(&InhumePrm::with_target(tomb, vec![obj.address]))
            .unwrap();

        let grave = &graves(&order[1])[0];
        assert_eq!(grave.address, obj.address);
        assert_eq!(grave.tombstone, Some(tomb));
        assert!(graves(&order[0]).is_empty());
        assert!(graves(&order[2]).is_empty());
    }

    #[test]
    fn test_inhume_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 3);
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let order = sorted(&engine, &obj.address);
        order[0].put(&obj).unwrap();

        let prm = InhumePrm::mark_as_garbage(vec![obj.address]);
        engine.inhume(&prm).unwrap();
        engine.inhume(&prm).unwrap();

        assert_eq!(graves(&order[0]).len(), 1);
        assert!(graves(&order[1]).is_empty());
        assert!(graves(&order[2]).is_empty());
    }

    #[test]
    fn test_inhume_expired_object_short_circuits() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 16]).with_expiration(3);
        let order = sorted(&engine, &obj.address);
        order[0].put(&obj).unwrap();
        engine.epoch.store(3, std::sync::atomic::Ordering::Release);

        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![obj.address]))
            .unwrap();
        assert!(graves(&order[0]).is_empty());
        assert!(graves(&order[1]).is_empty());
    }

    #[test]
    fn test_inhume_locked_object() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let other = Object::new(ObjectAddress::random(), vec![2u8; 16]);
        engine.put(&obj).unwrap();
        engine.put(&other).unwrap();
        engine
            .lock(obj.address.container(), ObjectId::new(), &[obj.address.object()])
            .unwrap();

        // the call stops at the locked address
        let err = engine
            .inhume(&InhumePrm::mark_as_garbage(vec![obj.address, other.address]))
            .unwrap_err();
        assert!(err.is_locked());
        assert!(engine.exists(&obj.address).unwrap());
        assert!(engine.exists(&other.address).unwrap());

        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![obj.address]).with_force_removal())
            .unwrap();
        assert!(engine.exists(&obj.address).unwrap_err().is_removed());
    }

    #[test]
    fn test_inhume_honors_lock_held_by_another_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let order = sorted(&engine, &obj.address);

        // locked before it is stored: the lock lands on the top shard
        engine
            .lock(obj.address.container(), ObjectId::new(), &[obj.address.object()])
            .unwrap();
        assert!(order[0].is_locked(&obj.address).unwrap());

        // the object itself lands on the second shard
        engine.set_shard_mode(order[0].id(), Mode::ReadOnly).unwrap();
        engine.put(&obj).unwrap();
        engine.set_shard_mode(order[0].id(), Mode::ReadWrite).unwrap();
        assert!(order[1].exists(&obj.address).unwrap());
        assert!(!order[1].is_locked(&obj.address).unwrap());

        let err = engine
            .inhume(&InhumePrm::mark_as_garbage(vec![obj.address]))
            .unwrap_err();
        assert!(err.is_locked());
        assert!(graves(&order[0]).is_empty());
        assert!(graves(&order[1]).is_empty());

        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![obj.address]).with_force_removal())
            .unwrap();
        assert!(engine.exists(&obj.address).unwrap_err().is_removed());
    }

    #[test]
    fn test_inhume_lock_object_in_force() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let target = ObjectAddress::random();
        let locker =
            Object::lock(target.with_object(ObjectId::new()), &[target.object()], 10).unwrap();
        engine.put(&locker).unwrap();

        let err = engine
            .inhume(&InhumePrm::mark_as_garbage(vec![locker.address]))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockObjectRemoval));
    }

    #[test]
    fn test_inhume_split_root_visits_every_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 3);
        let root = ObjectAddress::random();
        let order = sorted(&engine, &root);

        // the first shard only knows the root through one of its parts
        let part = Object::new(root.with_object(ObjectId::new()), vec![1u8; 8]).with_parent(ParentInfo {
            parent: root.object(),
            split_id: Uuid::new_v4(),
            last: false,
        });
        order[0].put(&part).unwrap();
        order[2].put(&Object::new(root, vec![2u8; 8])).unwrap();

        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![root]))
            .unwrap();

        assert!(graves(&order[0]).iter().any(|g| g.address == root));
        assert!(graves(&order[2]).iter().any(|g| g.address == root));
        assert!(graves(&order[1]).is_empty());
    }

    #[test]
    fn test_inhume_unknown_address_graves_top_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let addr = ObjectAddress::random();
        let order = sorted(&engine, &addr);

        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![addr]))
            .unwrap();
        assert_eq!(graves(&order[0]).len(), 1);
        assert!(graves(&order[1]).is_empty());
    }

    #[test]
    fn test_inhume_fails_without_writable_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        for info in engine.shard_infos() {
            engine.set_shard_mode(&info.id, Mode::ReadOnly).unwrap();
        }

        let err = engine
            .inhume(&InhumePrm::mark_as_garbage(vec![ObjectAddress::random()]))
            .unwrap_err();
        assert!(matches!(err, StorageError::InhumeFailure));
        // read-only refusals are not shard faults
        assert!(engine.shard_infos().iter().all(|i| i.mode == Mode::ReadOnly));
    }

    #[test]
    fn test_broadcast_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 3);
        let target = ObjectAddress::random();
        let locker = target.with_object(ObjectId::new());
        let shards: Vec<Arc<Shard>> = engine
            .shards_in(ShardOrder::Unsorted)
            .into_iter()
            .map(|sh| sh.shard)
            .collect();
        for shard in &shards {
            shard
                .lock(target.container(), locker.object(), &[target.object()])
                .unwrap();
        }

        let token = CancellationToken::new();
        token.cancel();
        engine.process_deleted_locks(&token, &[locker]);
        let still_locked = shards
            .iter()
            .filter(|s| s.is_locked(&target).unwrap())
            .count();
        assert_eq!(still_locked, 2);

        engine.process_expired_locks(&CancellationToken::new(), &[locker]);
        assert!(shards.iter().all(|s| !s.is_locked(&target).unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_tombstone_frees_graves_on_other_shards() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let shards = engine.shards_in(ShardOrder::Unsorted);
        let (holder, keeper) = (&shards[0].shard, &shards[1].shard);

        let target = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let tomb = Object::tombstone(
            target.address.with_object(ObjectId::new()),
            &[target.address.object()],
            5,
        )
        .unwrap();
        holder.put(&target).unwrap();
        keeper.put(&tomb).unwrap();

        engine
            .inhume(&InhumePrm::with_target(tomb.address, vec![target.address]))
            .unwrap();
        assert!(!graves(holder)[0].gc_mark);

        engine.init().unwrap();
        engine.handle_new_epoch(4).await;
        engine.handle_new_epoch(5).await;

        wait_until(|| holder.metabase().get(&target.address).unwrap().is_none()).await;
        wait_until(|| graves(holder).is_empty()).await;
        engine.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_lock_unlocks_every_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), 2);
        let shards = engine.shards_in(ShardOrder::Unsorted);

        let target = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let locker = Object::lock(
            target.address.with_object(ObjectId::new()),
            &[target.address.object()],
            3,
        )
        .unwrap();
        shards[1].shard.put(&target).unwrap();
        shards[0].shard.put(&locker).unwrap();
        engine
            .lock(
                target.address.container(),
                locker.address.object(),
                &[target.address.object()],
            )
            .unwrap();
        assert!(shards[1].shard.is_locked(&target.address).unwrap());

        engine.init().unwrap();
        engine.handle_new_epoch(3).await;

        wait_until(|| !engine.is_locked(&target.address).unwrap()).await;
        engine
            .inhume(&InhumePrm::mark_as_garbage(vec![target.address]))
            .unwrap();
        engine.close().await;
    }
}
