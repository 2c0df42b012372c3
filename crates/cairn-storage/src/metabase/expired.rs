//! Scans of the expiration index

use super::tables::{EXPIRATION, EXPIRATION_KEY_LEN, GRAVEYARD, OBJECTS, expiration_key};
use super::{Metabase, ObjectRecord, decode, interrupted_is_ok};
use crate::error::Result;
use cairn_common::{ADDRESS_KEY_LEN, Epoch, ObjectAddress, ObjectType};

/// Object whose expiration epoch has passed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiredObject {
    pub address: ObjectAddress,
    pub object_type: ObjectType,
}

impl Metabase {
    /// Visit objects expired at `epoch` (expiration ≤ `epoch`) that are not
    /// inhumed yet, in expiration order. The handler may stop the scan with
    /// [`crate::StorageError::Interrupted`].
    pub fn iterate_expired(
        &self,
        epoch: Epoch,
        handler: &mut dyn FnMut(ExpiredObject) -> Result<()>,
    ) -> Result<()> {
        let rtx = self.db.begin_read()?;
        let expiration = rtx.open_table(EXPIRATION)?;
        let graveyard = rtx.open_table(GRAVEYARD)?;
        let objects = rtx.open_table(OBJECTS)?;

        let lo = [0u8; EXPIRATION_KEY_LEN];
        let hi = expiration_key(epoch, &[0xFF; ADDRESS_KEY_LEN]);

        interrupted_is_ok((|| -> Result<()> {
            for entry in expiration.range(lo.as_slice()..=hi.as_slice())? {
                let (k, _) = entry?;
                let addr_key = &k.value()[8..];

                if graveyard.get(addr_key)?.is_some() {
                    continue;
                }
                let Some(v) = objects.get(addr_key)? else {
                    continue;
                };
                let record: ObjectRecord = decode(v.value())?;

                handler(ExpiredObject {
                    address: ObjectAddress::from_key(addr_key)?,
                    object_type: record.object_type,
                })?;
            }
            Ok(())
        })())
    }
}
