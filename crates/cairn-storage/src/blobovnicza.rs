//! Small-object database of the blob store
//!
//! A single redb file holding small objects keyed by their binary address.

use crate::error::{Result, StorageError};
use cairn_common::ObjectAddress;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use tracing::debug;

/// Objects: binary address → stored bytes
const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

/// Small-object database
pub struct Blobovnicza {
    db: Database,
    name: String,
}

impl Blobovnicza {
    /// Open (or create) the database at `path`; `name` becomes the storage ID
    /// of every object placed here
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let wtx = db.begin_write()?;
        wtx.open_table(OBJECTS)?;
        wtx.commit()?;

        Ok(Self {
            db,
            name: name.into(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, addr: &ObjectAddress, data: &[u8]) -> Result<()> {
        let key = addr.to_key();
        let wtx = self.db.begin_write()?;
        wtx.open_table(OBJECTS)?.insert(key.as_slice(), data)?;
        wtx.commit()?;
        Ok(())
    }

    /// Read the object stored under `addr`.
    ///
    /// Returns [`StorageError::NotFound`] if the object is not present.
    pub fn get(&self, addr: &ObjectAddress) -> Result<Vec<u8>> {
        let key = addr.to_key();
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(OBJECTS)?;

        let data = table.get(key.as_slice())?.map(|v| v.value().to_vec());
        match data {
            Some(data) => {
                debug!(blobovnicza = %self.name, size = data.len(), "object is found");
                Ok(data)
            }
            None => Err(StorageError::NotFound),
        }
    }

    pub fn exists(&self, addr: &ObjectAddress) -> Result<bool> {
        let key = addr.to_key();
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(OBJECTS)?;
        Ok(table.get(key.as_slice())?.is_some())
    }

    pub fn delete(&self, addr: &ObjectAddress) -> Result<()> {
        let key = addr.to_key();
        let wtx = self.db.begin_write()?;
        let removed = wtx.open_table(OBJECTS)?.remove(key.as_slice())?.is_some();
        wtx.commit()?;

        if removed {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> Result<u64> {
        let rtx = self.db.begin_read()?;
        Ok(rtx.open_table(OBJECTS)?.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Visit every stored object in address order
    pub fn iterate(&self, handler: &mut dyn FnMut(ObjectAddress, &[u8]) -> Result<()>) -> Result<()> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(OBJECTS)?;
        for entry in table.iter()? {
            let (k, v) = entry?;
            let addr = ObjectAddress::from_key(k.value())?;
            handler(addr, v.value())?;
        }
        Ok(())
    }
}
