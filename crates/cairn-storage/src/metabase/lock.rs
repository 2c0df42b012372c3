//! Lock records

use super::tables::{GRAVEYARD, LOCKED, LOCKERS};
use super::{Metabase, decode, encode};
use crate::error::{Result, StorageError};
use cairn_common::{ContainerId, ObjectAddress, ObjectId};
use redb::{ReadableTable, Table};
use tracing::debug;

type LockTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

impl Metabase {
    /// Protect `locked` objects of `container` with lock object `locker`.
    ///
    /// Objects do not have to be indexed here; the records stay until the
    /// locker is freed.
    pub fn lock(&self, container: ContainerId, locker: ObjectId, locked: &[ObjectId]) -> Result<()> {
        let locker_addr = ObjectAddress::new(container, locker);
        let locker_key = locker_addr.to_key();

        let wtx = self.db.begin_write()?;
        {
            let graveyard = wtx.open_table(GRAVEYARD)?;
            let mut locked_table = wtx.open_table(LOCKED)?;
            let mut lockers = wtx.open_table(LOCKERS)?;

            for id in locked {
                let key = ObjectAddress::new(container, *id).to_key();
                if graveyard.get(key.as_slice())?.is_some() {
                    return Err(StorageError::AlreadyRemoved);
                }
                add_id(&mut locked_table, &key, locker)?;
                add_id(&mut lockers, &locker_key, *id)?;
            }
        }
        wtx.commit()?;

        debug!(locker = %locker_addr, count = locked.len(), "metabase: objects locked");
        Ok(())
    }

    /// Drop every lock record of `lockers`; returns the addresses that are
    /// no longer locked by anything
    pub fn free_locks(&self, lockers: &[ObjectAddress]) -> Result<Vec<ObjectAddress>> {
        let mut unlocked = Vec::new();

        let wtx = self.db.begin_write()?;
        {
            let mut locked_table = wtx.open_table(LOCKED)?;
            let mut lockers_table = wtx.open_table(LOCKERS)?;

            for locker in lockers {
                let members = lockers_table
                    .remove(locker.to_key().as_slice())?
                    .map(|v| decode::<Vec<ObjectId>>(v.value()))
                    .transpose()?
                    .unwrap_or_default();

                for id in members {
                    let addr = locker.with_object(id);
                    if remove_id(&mut locked_table, &addr.to_key(), locker.object())? {
                        unlocked.push(addr);
                    }
                }
            }
        }
        wtx.commit()?;

        if !unlocked.is_empty() {
            debug!(count = unlocked.len(), "metabase: objects unlocked");
        }
        Ok(unlocked)
    }

    pub fn is_locked(&self, addr: &ObjectAddress) -> Result<bool> {
        let rtx = self.db.begin_read()?;
        let locked = rtx.open_table(LOCKED)?;
        Ok(locked.get(addr.to_key().as_slice())?.is_some())
    }
}

fn add_id(table: &mut LockTable<'_>, key: &[u8], id: ObjectId) -> Result<()> {
    let mut ids = table
        .get(key)?
        .map(|v| decode::<Vec<ObjectId>>(v.value()))
        .transpose()?
        .unwrap_or_default();
    if !ids.contains(&id) {
        ids.push(id);
        table.insert(key, encode(&ids)?.as_slice())?;
    }
    Ok(())
}

/// Remove `id` from the list under `key`; true when the list became empty
fn remove_id(table: &mut LockTable<'_>, key: &[u8], id: ObjectId) -> Result<bool> {
    let Some(mut ids) = table
        .get(key)?
        .map(|v| decode::<Vec<ObjectId>>(v.value()))
        .transpose()?
    else {
        return Ok(false);
    };

    ids.retain(|x| *x != id);
    if ids.is_empty() {
        table.remove(key)?;
        Ok(true)
    } else {
        table.insert(key, encode(&ids)?.as_slice())?;
        Ok(false)
    }
}
