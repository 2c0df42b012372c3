//! Epoch-driven GC handlers and lock/tombstone expiry processing

use super::gc::{Event, EventHandler};
use super::Shard;
use crate::error::StorageError;
use crate::metabase::InhumePrm;
use cairn_common::{Epoch, Mode, ObjectAddress, ObjectType};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Expired objects inhumed per metabase transaction
const EXPIRED_BATCH_SIZE: usize = 500;

type Collector = fn(&Shard, &CancellationToken, Epoch);

impl Shard {
    /// Handlers run on every new epoch
    pub(super) fn epoch_handlers(self: &Arc<Self>) -> Vec<EventHandler> {
        let collectors: [(&'static str, Collector); 3] = [
            ("expired objects", Self::collect_expired_objects),
            ("expired tombstones", Self::collect_expired_tombstones),
            ("expired locks", Self::collect_expired_locks),
        ];

        collectors
            .into_iter()
            .map(|(name, collect)| {
                let shard = Arc::downgrade(self);
                let handler: EventHandler =
                    Arc::new(move |token: CancellationToken, event: Event| -> BoxFuture<'static, ()> {
                        let shard = shard.clone();
                        Box::pin(async move {
                            let Event::NewEpoch(epoch) = event;
                            let Some(shard) = shard.upgrade() else {
                                return;
                            };
                            let res = tokio::task::spawn_blocking(move || {
                                collect(&shard, &token, epoch);
                            })
                            .await;
                            if let Err(e) = res {
                                error!(error = %e, handler = name, "GC handler panicked");
                            }
                        })
                    });
                handler
            })
            .collect()
    }

    /// Mark objects expired at `epoch` as garbage; tombstones have their own
    /// path and locked objects are left alone
    pub(super) fn collect_expired_objects(&self, token: &CancellationToken, epoch: Epoch) {
        if self.mode() != Mode::ReadWrite {
            return;
        }

        let Some(expired) = self.scan_expired(token, epoch, |t| t != ObjectType::Tombstone) else {
            return;
        };

        for batch in expired.chunks(EXPIRED_BATCH_SIZE) {
            if token.is_cancelled() {
                return;
            }

            let prm = InhumePrm::gc_mark(batch.to_vec())
                .skip_locked()
                .at_epoch(epoch);
            match self.metabase.inhume(&prm) {
                Ok(res) => {
                    self.stats
                        .expired_marked
                        .fetch_add(res.inhumed, Ordering::Relaxed);
                    debug!(shard_id = %self.id, epoch, marked = res.inhumed, "GC: expired objects marked");
                }
                Err(e) => {
                    warn!(shard_id = %self.id, epoch, error = %e,
                        "could not inhume the objects");
                    return;
                }
            }
        }
    }

    /// Hand tombstones expired at `epoch` to the engine
    pub(super) fn collect_expired_tombstones(&self, token: &CancellationToken, epoch: Epoch) {
        let Some(expired) = self.scan_expired(token, epoch, |t| t == ObjectType::Tombstone) else {
            return;
        };
        if expired.is_empty() || token.is_cancelled() {
            return;
        }

        debug!(shard_id = %self.id, epoch, count = expired.len(), "GC: expired tombstones found");
        match &self.callbacks.expired_tombstones {
            Some(callback) => callback(token, expired),
            None => self.handle_expired_tombstones(&expired),
        }
    }

    /// Hand lock objects expired at `epoch` to the engine
    pub(super) fn collect_expired_locks(&self, token: &CancellationToken, epoch: Epoch) {
        let Some(expired) = self.scan_expired(token, epoch, |t| t == ObjectType::Lock) else {
            return;
        };
        if expired.is_empty() || token.is_cancelled() {
            return;
        }

        debug!(shard_id = %self.id, epoch, count = expired.len(), "GC: expired locks found");
        match &self.callbacks.expired_locks {
            Some(callback) => callback(token, expired),
            None => self.handle_expired_locks(&expired),
        }
    }

    /// Expired addresses whose type passes `filter`; `None` if the scan
    /// failed or was canceled
    fn scan_expired(
        &self,
        token: &CancellationToken,
        epoch: Epoch,
        filter: impl Fn(ObjectType) -> bool,
    ) -> Option<Vec<ObjectAddress>> {
        let mut expired = Vec::new();
        let res = self.metabase.iterate_expired(epoch, &mut |obj| {
            if token.is_cancelled() {
                return Err(StorageError::Interrupted);
            }
            if filter(obj.object_type) {
                expired.push(obj.address);
            }
            Ok(())
        });

        if let Err(e) = res {
            warn!(shard_id = %self.id, epoch, error = %e, "iterator over expired objects failed");
            return None;
        }
        if token.is_cancelled() {
            return None;
        }
        Some(expired)
    }

    /// GC-mark every grave attributed to one of the expired `tombstones`
    pub fn handle_expired_tombstones(&self, tombstones: &[ObjectAddress]) {
        if self.mode() != Mode::ReadWrite {
            return;
        }
        match self.metabase.inhume_tombstoned(tombstones) {
            Ok(marked) => {
                debug!(shard_id = %self.id, tombstones = tombstones.len(), marked,
                    "GC: tombstoned objects marked as garbage");
            }
            Err(e) => {
                warn!(shard_id = %self.id, error = %e, "could not mark tombstones as garbage");
            }
        }
    }

    /// Release objects protected by expired `lockers`
    pub fn handle_expired_locks(&self, lockers: &[ObjectAddress]) {
        self.free_locks(lockers, "expired");
    }

    /// Release objects protected by physically deleted `lockers`
    pub fn handle_deleted_locks(&self, lockers: &[ObjectAddress]) {
        self.free_locks(lockers, "deleted");
    }

    fn free_locks(&self, lockers: &[ObjectAddress], reason: &'static str) {
        if self.mode() != Mode::ReadWrite {
            return;
        }
        match self.metabase.free_locks(lockers) {
            Ok(unlocked) => {
                debug!(shard_id = %self.id, reason, lockers = lockers.len(),
                    unlocked = unlocked.len(), "GC: locks released");
            }
            Err(e) => {
                warn!(shard_id = %self.id, reason, error = %e, "failure to unlock objects");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ShardCallbacks;
    use super::super::testutil::*;
    use super::*;
    use crate::metabase::Grave;
    use cairn_common::{Object, ObjectId};
    use tempfile::tempdir;

    fn graves(shard: &Shard) -> Vec<Grave> {
        let mut out = Vec::new();
        shard
            .metabase
            .iterate_graveyard(&mut |g| {
                out.push(g);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_expired_objects_exclude_tombstones() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(&config(dir.path()), ShardCallbacks::default());

        let regular = Object::new(ObjectAddress::random(), vec![1u8; 8]).with_expiration(3);
        let fresh = Object::new(ObjectAddress::random(), vec![1u8; 8]).with_expiration(9);
        let tomb = Object::tombstone(ObjectAddress::random(), &[ObjectId::new()], 3).unwrap();
        let locker = Object::lock(ObjectAddress::random(), &[ObjectId::new()], 3).unwrap();
        for obj in [&regular, &fresh, &tomb, &locker] {
            shard.put(obj).unwrap();
        }

        shard.collect_expired_objects(&CancellationToken::new(), 3);

        let graves = graves(&shard);
        assert_eq!(graves.len(), 2);
        assert!(graves.iter().all(|g| g.gc_mark && g.tombstone.is_none()));
        assert!(graves.iter().any(|g| g.address == regular.address));
        assert!(graves.iter().any(|g| g.address == locker.address));
        assert!(!graves.iter().any(|g| g.address == tomb.address));
        assert_eq!(shard.info().expired_marked, 2);

        // graved objects drop out of the expiration scan
        shard.collect_expired_objects(&CancellationToken::new(), 3);
        assert_eq!(shard.info().expired_marked, 2);
    }

    #[test]
    fn test_expired_locked_object_is_skipped() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(&config(dir.path()), ShardCallbacks::default());
        let locked = Object::new(ObjectAddress::random(), vec![1u8; 8]).with_expiration(1);
        let plain = Object::new(ObjectAddress::random(), vec![1u8; 8]).with_expiration(1);
        shard.put(&locked).unwrap();
        shard.put(&plain).unwrap();
        shard
            .lock(locked.address.container(), ObjectId::new(), &[locked.address.object()])
            .unwrap();

        shard.collect_expired_objects(&CancellationToken::new(), 2);

        let graves = graves(&shard);
        assert_eq!(graves.len(), 1);
        assert_eq!(graves[0].address, plain.address);
    }

    #[test]
    fn test_canceled_collection_writes_nothing() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(&config(dir.path()), ShardCallbacks::default());
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 8]).with_expiration(1);
        shard.put(&obj).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        shard.collect_expired_objects(&token, 5);
        assert!(graves(&shard).is_empty());
    }

    #[test]
    fn test_expired_tombstones_go_to_callback() {
        let dir = tempdir().unwrap();
        let (callback, seen) = recording_callback();
        let callbacks = ShardCallbacks {
            expired_tombstones: Some(callback),
            ..ShardCallbacks::default()
        };
        let (shard, _) = open(&config(dir.path()), callbacks);

        let target = Object::new(ObjectAddress::random(), vec![1u8; 8]);
        let tomb =
            Object::tombstone(target.address.with_object(ObjectId::new()), &[target.address.object()], 4)
                .unwrap();
        shard.put(&target).unwrap();
        shard.put(&tomb).unwrap();
        shard
            .inhume(InhumePrm::tombstone(tomb.address, vec![target.address]))
            .unwrap();

        shard.collect_expired_tombstones(&CancellationToken::new(), 3);
        assert!(seen.lock().is_empty());

        shard.collect_expired_tombstones(&CancellationToken::new(), 4);
        assert_eq!(*seen.lock(), vec![tomb.address]);

        // the engine broadcasts them back
        shard.handle_expired_tombstones(&seen.lock());
        let graves = graves(&shard);
        let target_grave = graves.iter().find(|g| g.address == target.address).unwrap();
        assert!(target_grave.gc_mark);
    }

    #[test]
    fn test_expired_locks_released_locally() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(&config(dir.path()), ShardCallbacks::default());

        let target = Object::new(ObjectAddress::random(), vec![1u8; 8]);
        let locker =
            Object::lock(target.address.with_object(ObjectId::new()), &[target.address.object()], 2)
                .unwrap();
        shard.put(&target).unwrap();
        shard.put(&locker).unwrap();
        shard
            .lock(target.address.container(), locker.address.object(), &[target.address.object()])
            .unwrap();
        assert!(shard.is_locked(&target.address).unwrap());

        shard.collect_expired_locks(&CancellationToken::new(), 2);
        assert!(!shard.is_locked(&target.address).unwrap());
    }

    #[test]
    fn test_deleted_locks_release() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(&config(dir.path()), ShardCallbacks::default());
        let target = ObjectAddress::random();
        let locker = target.with_object(ObjectId::new());
        shard
            .lock(target.container(), locker.object(), &[target.object()])
            .unwrap();

        shard.set_mode(Mode::ReadOnly);
        shard.handle_deleted_locks(&[locker]);
        assert!(shard.is_locked(&target).unwrap());

        shard.set_mode(Mode::ReadWrite);
        shard.handle_deleted_locks(&[locker]);
        assert!(!shard.is_locked(&target).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_epoch_event_marks_and_removes_expired() {
        let dir = tempdir().unwrap();
        let (shard, epoch) = open(&config(dir.path()), ShardCallbacks::default());
        let obj = Object::new(ObjectAddress::random(), vec![6u8; 64]).with_expiration(2);
        let kept = Object::new(ObjectAddress::random(), vec![7u8; 64]);
        shard.put(&obj).unwrap();
        shard.put(&kept).unwrap();
        shard.init().unwrap();

        epoch.store(2, Ordering::Release);
        shard.notify_gc(Event::NewEpoch(2)).await;

        wait_until(|| shard.info().removed == 1).await;
        assert!(!shard.blobstor.exists(&obj.address).unwrap());
        assert!(shard.metabase.get(&obj.address).unwrap().is_none());
        assert_eq!(shard.get(&kept.address).unwrap(), kept);

        shard.close().await;
    }
}
