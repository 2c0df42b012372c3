//! Per-shard object index backed by redb
//!
//! The metabase knows which objects a shard holds, where in the blob store
//! each one lives, which addresses were inhumed (the graveyard), which
//! objects expire at which epoch, which roots of split objects have parts
//! here and which objects are protected by locks.
//!
//! Every mutation runs in a single write transaction, so a batch either
//! lands completely or not at all.

mod expired;
mod graveyard;
mod lock;
mod tables;

pub use expired::ExpiredObject;
pub use graveyard::{Grave, InhumePrm, InhumeRes};

use crate::blobstor::StorageId;
use crate::error::{Result, StorageError};
use cairn_common::{Epoch, Object, ObjectAddress, ObjectType, ParentInfo, SplitInfo};
use redb::{Database, ReadableTable};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tables::{EXPIRATION, GRAVEYARD, LOCKED, LOCKERS, OBJECTS, SPLIT, expiration_key};
use tracing::debug;

/// What the metabase stores about an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub object_type: ObjectType,
    pub expiration_epoch: Option<Epoch>,
    pub storage_id: Option<StorageId>,
    pub parent: Option<ParentInfo>,
    pub payload_size: u64,
}

impl ObjectRecord {
    fn new(obj: &Object, storage_id: Option<StorageId>) -> Self {
        Self {
            object_type: obj.object_type,
            expiration_epoch: obj.expiration_epoch,
            storage_id,
            parent: obj.parent.clone(),
            payload_size: obj.payload.len() as u64,
        }
    }

    #[must_use]
    pub fn is_expired(&self, epoch: Epoch) -> bool {
        self.expiration_epoch.is_some_and(|exp| exp <= epoch)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SplitRecord {
    info: SplitInfo,
    /// Parts of the split object indexed on this shard
    parts: u32,
}

/// Object physically removed from the index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedObject {
    pub address: ObjectAddress,
    pub storage_id: Option<StorageId>,
}

/// Result of [`Metabase::delete`]
#[derive(Debug, Default)]
pub struct DeleteRes {
    /// Removed objects with the location of their bytes
    pub removed: Vec<RemovedObject>,
    /// Removed objects that were locks
    pub lockers: Vec<ObjectAddress>,
}

/// Object index of one shard
pub struct Metabase {
    db: Database,
}

impl Metabase {
    /// Open (or create) the index at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let wtx = db.begin_write()?;
        {
            let _t = wtx.open_table(OBJECTS)?;
            let _t = wtx.open_table(EXPIRATION)?;
            let _t = wtx.open_table(GRAVEYARD)?;
            let _t = wtx.open_table(SPLIT)?;
            let _t = wtx.open_table(LOCKED)?;
            let _t = wtx.open_table(LOCKERS)?;
        }
        wtx.commit()?;

        Ok(Self { db })
    }

    /// Index an object stored at `storage_id`.
    ///
    /// Putting an already indexed object only updates its storage ID. Putting
    /// an inhumed address fails with [`StorageError::AlreadyRemoved`].
    pub fn put(&self, obj: &Object, storage_id: Option<&StorageId>) -> Result<()> {
        let key = obj.address.to_key();
        let wtx = self.db.begin_write()?;
        {
            let graveyard = wtx.open_table(GRAVEYARD)?;
            if graveyard.get(key.as_slice())?.is_some() {
                return Err(StorageError::AlreadyRemoved);
            }

            let mut objects = wtx.open_table(OBJECTS)?;
            let existing = objects
                .get(key.as_slice())?
                .map(|v| decode::<ObjectRecord>(v.value()))
                .transpose()?;

            if let Some(mut record) = existing {
                if let Some(sid) = storage_id {
                    record.storage_id = Some(sid.clone());
                    objects.insert(key.as_slice(), encode(&record)?.as_slice())?;
                }
            } else {
                let record = ObjectRecord::new(obj, storage_id.cloned());
                objects.insert(key.as_slice(), encode(&record)?.as_slice())?;

                if let Some(exp) = obj.expiration_epoch {
                    let mut expiration = wtx.open_table(EXPIRATION)?;
                    expiration.insert(expiration_key(exp, &key).as_slice(), ())?;
                }

                if let Some(parent) = &obj.parent {
                    let parent_key = obj.address.with_object(parent.parent).to_key();
                    let mut split = wtx.open_table(SPLIT)?;
                    let mut rec = split
                        .get(parent_key.as_slice())?
                        .map(|v| decode::<SplitRecord>(v.value()))
                        .transpose()?
                        .unwrap_or_default();

                    rec.info.split_id = Some(parent.split_id);
                    if parent.last {
                        rec.info.last_part = Some(obj.address.object());
                    }
                    rec.parts += 1;
                    split.insert(parent_key.as_slice(), encode(&rec)?.as_slice())?;
                }
            }
        }
        wtx.commit()?;

        debug!(address = %obj.address, object_type = %obj.object_type, "metabase: object indexed");
        Ok(())
    }

    /// Index record of an object, if present
    pub fn get(&self, addr: &ObjectAddress) -> Result<Option<ObjectRecord>> {
        let key = addr.to_key();
        let rtx = self.db.begin_read()?;
        let objects = rtx.open_table(OBJECTS)?;
        objects
            .get(key.as_slice())?
            .map(|v| decode(v.value()))
            .transpose()
    }

    /// Where the bytes of an indexed object live
    pub fn storage_id(&self, addr: &ObjectAddress) -> Result<Option<StorageId>> {
        Ok(self.get(addr)?.and_then(|rec| rec.storage_id))
    }

    /// Presence check as seen at `epoch`.
    ///
    /// Inhumed addresses fail with [`StorageError::AlreadyRemoved`], expired
    /// ones with [`StorageError::ObjectExpired`], and roots of split objects
    /// whose parts are indexed here with [`StorageError::SplitInfo`].
    pub fn exists(&self, addr: &ObjectAddress, epoch: Epoch) -> Result<bool> {
        let key = addr.to_key();
        let rtx = self.db.begin_read()?;

        if rtx.open_table(GRAVEYARD)?.get(key.as_slice())?.is_some() {
            return Err(StorageError::AlreadyRemoved);
        }

        let objects = rtx.open_table(OBJECTS)?;
        if let Some(v) = objects.get(key.as_slice())? {
            let record: ObjectRecord = decode(v.value())?;
            if record.is_expired(epoch) {
                return Err(StorageError::ObjectExpired);
            }
            return Ok(true);
        }

        if let Some(v) = rtx.open_table(SPLIT)?.get(key.as_slice())? {
            let rec: SplitRecord = decode(v.value())?;
            return Err(StorageError::SplitInfo(rec.info));
        }

        Ok(false)
    }

    /// Physically drop addresses from every table.
    ///
    /// Addresses without an object record are still cleared from the
    /// graveyard; they are not reported as removed.
    pub fn delete(&self, addrs: &[ObjectAddress]) -> Result<DeleteRes> {
        let mut res = DeleteRes::default();

        let wtx = self.db.begin_write()?;
        {
            let mut objects = wtx.open_table(OBJECTS)?;
            let mut graveyard = wtx.open_table(GRAVEYARD)?;
            let mut expiration = wtx.open_table(EXPIRATION)?;
            let mut split = wtx.open_table(SPLIT)?;

            for addr in addrs {
                let key = addr.to_key();
                graveyard.remove(key.as_slice())?;

                let record = objects
                    .remove(key.as_slice())?
                    .map(|v| decode::<ObjectRecord>(v.value()))
                    .transpose()?;
                let Some(record) = record else {
                    continue;
                };

                if let Some(exp) = record.expiration_epoch {
                    expiration.remove(expiration_key(exp, &key).as_slice())?;
                }

                if let Some(parent) = &record.parent {
                    let parent_key = addr.with_object(parent.parent).to_key();
                    let rec = split
                        .get(parent_key.as_slice())?
                        .map(|v| decode::<SplitRecord>(v.value()))
                        .transpose()?;
                    if let Some(mut rec) = rec {
                        rec.parts = rec.parts.saturating_sub(1);
                        if rec.parts == 0 {
                            split.remove(parent_key.as_slice())?;
                        } else {
                            if rec.info.last_part == Some(addr.object()) {
                                rec.info.last_part = None;
                            }
                            split.insert(parent_key.as_slice(), encode(&rec)?.as_slice())?;
                        }
                    }
                }

                if record.object_type == ObjectType::Lock {
                    res.lockers.push(*addr);
                }
                res.removed.push(RemovedObject {
                    address: *addr,
                    storage_id: record.storage_id,
                });
            }
        }
        wtx.commit()?;

        debug!(
            requested = addrs.len(),
            removed = res.removed.len(),
            "metabase: objects deleted"
        );
        Ok(res)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Stop an iteration without reporting an error
fn interrupted_is_ok(res: Result<()>) -> Result<()> {
    match res {
        Err(StorageError::Interrupted) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn open() -> (tempfile::TempDir, Metabase) {
        let dir = tempdir().unwrap();
        let mb = Metabase::open(dir.path().join("meta.db")).unwrap();
        (dir, mb)
    }

    #[test]
    fn test_put_and_exists() {
        let (_dir, mb) = open();
        let obj = Object::new(ObjectAddress::random(), vec![1u8; 8]);

        assert!(!mb.exists(&obj.address, 0).unwrap());
        mb.put(&obj, Some(&StorageId::fstree())).unwrap();
        assert!(mb.exists(&obj.address, 0).unwrap());
        assert_eq!(mb.storage_id(&obj.address).unwrap(), Some(StorageId::fstree()));

        // re-put only updates the location
        mb.put(&obj, Some(&StorageId::blobovnicza("blz0"))).unwrap();
        let rec = mb.get(&obj.address).unwrap().unwrap();
        assert_eq!(rec.storage_id, Some(StorageId::blobovnicza("blz0")));
        assert_eq!(rec.payload_size, 8);
    }

    #[test]
    fn test_exists_reports_expiration() {
        let (_dir, mb) = open();
        let obj = Object::new(ObjectAddress::random(), vec![]).with_expiration(10);
        mb.put(&obj, None).unwrap();

        assert!(mb.exists(&obj.address, 9).unwrap());
        assert!(mb.exists(&obj.address, 10).unwrap_err().is_expired());
    }

    #[test]
    fn test_exists_reports_split_root() {
        let (_dir, mb) = open();
        let root = ObjectAddress::random();
        let split_id = Uuid::new_v4();

        let part = Object::new(root.with_object(cairn_common::ObjectId::new()), vec![0u8; 4])
            .with_parent(ParentInfo {
                parent: root.object(),
                split_id,
                last: true,
            });
        mb.put(&part, None).unwrap();

        let err = mb.exists(&root, 0).unwrap_err();
        let info = err.split_info().unwrap();
        assert_eq!(info.split_id, Some(split_id));
        assert_eq!(info.last_part, Some(part.address.object()));

        mb.delete(&[part.address]).unwrap();
        assert!(!mb.exists(&root, 0).unwrap());
    }

    #[test]
    fn test_put_inhumed_is_rejected() {
        let (_dir, mb) = open();
        let obj = Object::new(ObjectAddress::random(), vec![]);
        mb.put(&obj, None).unwrap();
        mb.inhume(&InhumePrm::gc_mark(vec![obj.address])).unwrap();

        assert!(mb.put(&obj, None).unwrap_err().is_removed());
        assert!(mb.exists(&obj.address, 0).unwrap_err().is_removed());
    }

    #[test]
    fn test_delete_reports_locations_and_lockers() {
        let (_dir, mb) = open();
        let cnr = ObjectAddress::random();
        let regular = Object::new(cnr, vec![1u8]);
        let lock = Object::lock(cnr.with_object(cairn_common::ObjectId::new()), &[cnr.object()], 5)
            .unwrap();

        mb.put(&regular, Some(&StorageId::fstree())).unwrap();
        mb.put(&lock, None).unwrap();

        let missing = ObjectAddress::random();
        let res = mb.delete(&[regular.address, lock.address, missing]).unwrap();
        assert_eq!(res.removed.len(), 2);
        assert_eq!(res.removed[0].storage_id, Some(StorageId::fstree()));
        assert_eq!(res.lockers, vec![lock.address]);
        assert!(mb.get(&regular.address).unwrap().is_none());

        // expiration index entry is gone too
        let mut expired = Vec::new();
        mb.iterate_expired(100, &mut |e| {
            expired.push(e);
            Ok(())
        })
        .unwrap();
        assert!(expired.is_empty());
    }
}
