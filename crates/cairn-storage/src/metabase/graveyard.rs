//! Logical removal: inhume and graveyard scans

use super::tables::{GRAVEYARD, LOCKED, OBJECTS};
use super::{Metabase, ObjectRecord, decode, encode, interrupted_is_ok};
use crate::error::{Result, StorageError};
use cairn_common::{Epoch, ObjectAddress, ObjectType};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Why addresses are being inhumed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InhumeTarget {
    /// Removal attributed to a tombstone
    Tombstone(ObjectAddress),
    /// Bare GC mark: the remover may purge the object right away
    GcMark,
}

/// Parameters of [`Metabase::inhume`]
#[derive(Clone, Debug)]
pub struct InhumePrm {
    addrs: Vec<ObjectAddress>,
    target: InhumeTarget,
    force: bool,
    skip_locked: bool,
    epoch: Epoch,
}

impl InhumePrm {
    /// Inhume `addrs` on behalf of `tombstone`
    #[must_use]
    pub fn tombstone(tombstone: ObjectAddress, addrs: impl Into<Vec<ObjectAddress>>) -> Self {
        Self::new(InhumeTarget::Tombstone(tombstone), addrs.into())
    }

    /// Mark `addrs` as garbage
    #[must_use]
    pub fn gc_mark(addrs: impl Into<Vec<ObjectAddress>>) -> Self {
        Self::new(InhumeTarget::GcMark, addrs.into())
    }

    const fn new(target: InhumeTarget, addrs: Vec<ObjectAddress>) -> Self {
        Self {
            addrs,
            target,
            force: false,
            skip_locked: false,
            epoch: 0,
        }
    }

    /// Bypass lock checks; a forced GC mark also drops tombstone attribution
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Leave locked addresses alone instead of failing the batch
    #[must_use]
    pub const fn skip_locked(mut self) -> Self {
        self.skip_locked = true;
        self
    }

    /// Epoch used to decide whether a lock object is still in force
    #[must_use]
    pub const fn at_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    #[must_use]
    pub fn addresses(&self) -> &[ObjectAddress] {
        &self.addrs
    }
}

/// Result of [`Metabase::inhume`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InhumeRes {
    /// Addresses that had no grave before the call
    pub inhumed: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct GraveRecord {
    pub tombstone: Option<ObjectAddress>,
    pub gc_mark: bool,
}

/// Graveyard entry as seen by scans
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grave {
    pub address: ObjectAddress,
    pub tombstone: Option<ObjectAddress>,
    pub gc_mark: bool,
}

impl Metabase {
    /// Write graves for every address of `prm`.
    ///
    /// Without force, a locked address fails the whole batch with
    /// [`StorageError::ObjectLocked`] (or is skipped with
    /// [`InhumePrm::skip_locked`]) and a lock object that has not expired
    /// fails it with [`StorageError::LockObjectRemoval`].
    pub fn inhume(&self, prm: &InhumePrm) -> Result<InhumeRes> {
        let mut res = InhumeRes::default();

        let wtx = self.db.begin_write()?;
        {
            let objects = wtx.open_table(OBJECTS)?;
            let locked = wtx.open_table(LOCKED)?;
            let mut graveyard = wtx.open_table(GRAVEYARD)?;

            for addr in &prm.addrs {
                let key = addr.to_key();

                if !prm.force {
                    if locked.get(key.as_slice())?.is_some() {
                        if prm.skip_locked {
                            debug!(address = %addr, "metabase: skipping locked object");
                            continue;
                        }
                        return Err(StorageError::ObjectLocked);
                    }

                    let record = objects
                        .get(key.as_slice())?
                        .map(|v| decode::<ObjectRecord>(v.value()))
                        .transpose()?;
                    if let Some(record) = record
                        && record.object_type == ObjectType::Lock
                        && !record.is_expired(prm.epoch)
                    {
                        return Err(StorageError::LockObjectRemoval);
                    }
                }

                let prev = graveyard
                    .get(key.as_slice())?
                    .map(|v| decode::<GraveRecord>(v.value()))
                    .transpose()?;

                let grave = match prm.target {
                    InhumeTarget::Tombstone(tombstone) => GraveRecord {
                        tombstone: Some(tombstone),
                        gc_mark: prev.as_ref().is_some_and(|g| g.gc_mark),
                    },
                    InhumeTarget::GcMark => GraveRecord {
                        tombstone: if prm.force {
                            None
                        } else {
                            prev.as_ref().and_then(|g| g.tombstone)
                        },
                        gc_mark: true,
                    },
                };

                if prev.as_ref() == Some(&grave) {
                    continue;
                }
                if prev.is_none() {
                    res.inhumed += 1;
                }
                graveyard.insert(key.as_slice(), encode(&grave)?.as_slice())?;
            }
        }
        wtx.commit()?;

        debug!(
            requested = prm.addrs.len(),
            inhumed = res.inhumed,
            target = ?prm.target,
            force = prm.force,
            "metabase: addresses inhumed"
        );
        Ok(res)
    }

    /// Visit every grave; the handler may stop the scan with
    /// [`StorageError::Interrupted`]
    pub fn iterate_graveyard(&self, handler: &mut dyn FnMut(Grave) -> Result<()>) -> Result<()> {
        let rtx = self.db.begin_read()?;
        let graveyard = rtx.open_table(GRAVEYARD)?;

        interrupted_is_ok((|| -> Result<()> {
            for entry in graveyard.iter()? {
                let (k, v) = entry?;
                let rec: GraveRecord = decode(v.value())?;
                handler(Grave {
                    address: ObjectAddress::from_key(k.value())?,
                    tombstone: rec.tombstone,
                    gc_mark: rec.gc_mark,
                })?;
            }
            Ok(())
        })())
    }

    /// GC-mark graves attributed to any of `tombstones`, and the tombstones
    /// themselves when they are indexed here. Returns the number of graves
    /// that gained the mark.
    pub fn inhume_tombstoned(&self, tombstones: &[ObjectAddress]) -> Result<u64> {
        let set: HashSet<ObjectAddress> = tombstones.iter().copied().collect();
        let mut marked = 0;

        let wtx = self.db.begin_write()?;
        {
            let objects = wtx.open_table(OBJECTS)?;
            let mut graveyard = wtx.open_table(GRAVEYARD)?;

            let mut updates = Vec::new();
            for entry in graveyard.iter()? {
                let (k, v) = entry?;
                let rec: GraveRecord = decode(v.value())?;
                if !rec.gc_mark && rec.tombstone.is_some_and(|t| set.contains(&t)) {
                    updates.push((
                        k.value().to_vec(),
                        GraveRecord {
                            gc_mark: true,
                            ..rec
                        },
                    ));
                }
            }

            for tombstone in tombstones {
                let key = tombstone.to_key();
                if objects.get(key.as_slice())?.is_none() {
                    continue;
                }
                let prev = graveyard
                    .get(key.as_slice())?
                    .map(|v| decode::<GraveRecord>(v.value()))
                    .transpose()?;
                if prev.as_ref().is_some_and(|g| g.gc_mark) {
                    continue;
                }
                updates.push((
                    key.to_vec(),
                    GraveRecord {
                        tombstone: prev.and_then(|g| g.tombstone),
                        gc_mark: true,
                    },
                ));
            }

            for (key, rec) in updates {
                graveyard.insert(key.as_slice(), encode(&rec)?.as_slice())?;
                marked += 1;
            }
        }
        wtx.commit()?;

        Ok(marked)
    }
}
