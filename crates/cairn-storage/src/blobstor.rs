//! Durable object storage of a shard
//!
//! Small objects are kept in a [`Blobovnicza`], everything else in an
//! [`FsTree`]. The storage ID returned by [`BlobStor::put`] tells later reads
//! which of the two holds the object; an empty ID means the file tree.
//!
//! Stored bytes carry a one-byte header saying whether the rest is zstd
//! compressed, so compression can be toggled without rewriting old data.

use crate::blobovnicza::Blobovnicza;
use crate::error::{Result, StorageError};
use crate::fstree::FsTree;
use cairn_common::config::BlobStorConfig;
use cairn_common::{Object, ObjectAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

const HEADER_RAW: u8 = 0;
const HEADER_ZSTD: u8 = 1;
const ZSTD_LEVEL: i32 = 3;

/// Location of an object inside the blob store
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId(Vec<u8>);

impl StorageId {
    /// ID of objects kept in the file tree
    #[must_use]
    pub const fn fstree() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn blobovnicza(name: &str) -> Self {
        Self(name.as_bytes().to_vec())
    }

    #[must_use]
    pub fn is_fstree(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fstree() {
            f.write_str("StorageId(fstree)")
        } else {
            write!(f, "StorageId({})", String::from_utf8_lossy(&self.0))
        }
    }
}

/// Parameters of [`BlobStor::put`]
#[derive(Debug)]
pub struct PutPrm<'a> {
    pub address: ObjectAddress,
    /// Marshaled object
    pub raw_data: &'a [u8],
    /// Store as is even when compression is enabled
    pub dont_compress: bool,
}

/// Blob store of one shard
pub struct BlobStor {
    fstree: FsTree,
    blobovnicza: Blobovnicza,
    compress: bool,
    small_object_size: u64,
}

impl BlobStor {
    /// Open (or create) the blob store under `root`
    pub fn open(root: impl AsRef<Path>, config: &BlobStorConfig) -> Result<Self> {
        let root = root.as_ref();
        Ok(Self {
            fstree: FsTree::open(root.join("tree"))?,
            blobovnicza: Blobovnicza::open(root.join("small.db"), "blz0")?,
            compress: config.compress,
            small_object_size: config.small_object_size,
        })
    }

    /// Store an object and return where it went
    pub fn put(&self, prm: PutPrm<'_>) -> Result<StorageId> {
        let data = encode(prm.raw_data, self.compress && !prm.dont_compress)?;

        if prm.raw_data.len() as u64 <= self.small_object_size {
            self.blobovnicza.put(&prm.address, &data)?;
            Ok(StorageId::blobovnicza(self.blobovnicza.name()))
        } else {
            self.fstree.put(&prm.address, &data)?;
            Ok(StorageId::fstree())
        }
    }

    /// Marshal and store an object
    pub fn put_object(&self, obj: &Object) -> Result<StorageId> {
        let raw = obj.marshal()?;
        self.put(PutPrm {
            address: obj.address,
            raw_data: &raw,
            dont_compress: false,
        })
    }

    /// Read the marshaled object; without a storage ID both stores are tried
    pub fn get(&self, addr: &ObjectAddress, sid: Option<&StorageId>) -> Result<Vec<u8>> {
        let stored = match sid {
            Some(sid) if sid.is_fstree() => self.fstree.get(addr)?,
            Some(_) => self.blobovnicza.get(addr)?,
            None => match self.blobovnicza.get(addr) {
                Err(e) if e.is_not_found() => self.fstree.get(addr)?,
                other => other?,
            },
        };
        decode(&stored)
    }

    pub fn get_object(&self, addr: &ObjectAddress, sid: Option<&StorageId>) -> Result<Object> {
        let raw = self.get(addr, sid)?;
        Ok(Object::unmarshal(&raw)?)
    }

    pub fn exists(&self, addr: &ObjectAddress) -> Result<bool> {
        Ok(self.blobovnicza.exists(addr)? || self.fstree.exists(addr))
    }

    /// Remove an object; without a storage ID both stores are tried
    pub fn delete(&self, addr: &ObjectAddress, sid: Option<&StorageId>) -> Result<()> {
        match sid {
            Some(sid) if sid.is_fstree() => self.fstree.delete(addr),
            Some(_) => self.blobovnicza.delete(addr),
            None => match self.blobovnicza.delete(addr) {
                Err(e) if e.is_not_found() => self.fstree.delete(addr),
                other => other,
            },
        }?;

        debug!(address = %addr, "blobstor: object deleted");
        Ok(())
    }
}

fn encode(data: &[u8], compress: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 1);
    if compress {
        out.push(HEADER_ZSTD);
        out.extend_from_slice(&zstd::encode_all(data, ZSTD_LEVEL)?);
    } else {
        out.push(HEADER_RAW);
        out.extend_from_slice(data);
    }
    Ok(out)
}

fn decode(stored: &[u8]) -> Result<Vec<u8>> {
    match stored.split_first() {
        Some((&HEADER_RAW, rest)) => Ok(rest.to_vec()),
        Some((&HEADER_ZSTD, rest)) => Ok(zstd::decode_all(rest)?),
        Some((other, _)) => Err(StorageError::corrupted(format!(
            "unknown blob header {other:#04x}"
        ))),
        None => Err(StorageError::corrupted("empty blob")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tempfile::tempdir;

    fn config(compress: bool) -> BlobStorConfig {
        BlobStorConfig {
            compress,
            small_object_size: 1024,
        }
    }

    #[test]
    fn test_routing_by_size() {
        let dir = tempdir().unwrap();
        let bs = BlobStor::open(dir.path(), &config(false)).unwrap();

        let small = Object::new(ObjectAddress::random(), vec![1u8; 16]);
        let mut payload = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut payload);
        let big = Object::new(ObjectAddress::random(), payload);

        let small_sid = bs.put_object(&small).unwrap();
        let big_sid = bs.put_object(&big).unwrap();
        assert!(!small_sid.is_fstree());
        assert!(big_sid.is_fstree());

        assert_eq!(bs.get_object(&small.address, Some(&small_sid)).unwrap(), small);
        assert_eq!(bs.get_object(&big.address, None).unwrap(), big);

        // wrong hint does not find the object
        assert!(bs.get(&small.address, Some(&StorageId::fstree())).unwrap_err().is_not_found());
    }

    #[test]
    fn test_compression_honors_opt_out() {
        let dir = tempdir().unwrap();
        let bs = BlobStor::open(dir.path(), &config(true)).unwrap();
        let obj = Object::new(ObjectAddress::random(), vec![0u8; 64 * 1024]);
        let raw = obj.marshal().unwrap();

        bs.put(PutPrm {
            address: obj.address,
            raw_data: &raw,
            dont_compress: false,
        })
        .unwrap();
        let stored = bs.fstree.get(&obj.address).unwrap();
        assert_eq!(stored[0], HEADER_ZSTD);
        assert!(stored.len() < raw.len());
        assert_eq!(bs.get(&obj.address, None).unwrap(), raw);

        bs.put(PutPrm {
            address: obj.address,
            raw_data: &raw,
            dont_compress: true,
        })
        .unwrap();
        let stored = bs.fstree.get(&obj.address).unwrap();
        assert_eq!(stored[0], HEADER_RAW);
        assert_eq!(bs.get(&obj.address, None).unwrap(), raw);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let bs = BlobStor::open(dir.path(), &config(false)).unwrap();
        let obj = Object::new(ObjectAddress::random(), vec![9u8; 10]);

        let sid = bs.put_object(&obj).unwrap();
        assert!(bs.exists(&obj.address).unwrap());
        bs.delete(&obj.address, Some(&sid)).unwrap();
        assert!(!bs.exists(&obj.address).unwrap());
        assert!(bs.delete(&obj.address, None).unwrap_err().is_not_found());
    }
}
