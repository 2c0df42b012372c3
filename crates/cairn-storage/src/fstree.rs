//! File-tree object store
//!
//! Stores one file per object under a two-level directory fan-out derived
//! from the object address. Each file starts with a CRC32C of the payload so
//! torn or bit-rotted files are reported as corruption instead of being
//! handed to the decoder.

use crate::error::{Result, StorageError};
use cairn_common::ObjectAddress;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytes of the checksum prefix
const CHECKSUM_LEN: usize = 4;

/// Suffix of files being written
const TMP_SUFFIX: &str = ".tmp";

/// Parameters of [`FsTree::iterate`]
pub struct IteratePrm<'a> {
    /// Skip entries whose name cannot be decoded instead of failing
    pub ignore_errors: bool,
    /// Called for every stored object; bytes are read only on demand
    pub handler: &'a mut dyn FnMut(ObjectAddress, LazyRead<'_>) -> Result<()>,
}

/// Deferred read of one stored object
pub struct LazyRead<'a> {
    path: &'a Path,
}

impl LazyRead<'_> {
    /// Read and verify the object bytes
    pub fn read(&self) -> Result<Vec<u8>> {
        read_verified(self.path)
    }

    /// Size of the stored data without reading it
    pub fn size(&self) -> Result<u64> {
        stored_size(self.path)
    }
}

/// Directory tree keyed by object address
#[derive(Debug)]
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    /// Open (or create) a tree rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, addr: &ObjectAddress) -> PathBuf {
        let name = file_name(addr);
        self.root.join(&name[..2]).join(&name[2..4]).join(name)
    }

    /// Store `data` under `addr`, replacing any previous value
    pub fn put(&self, addr: &ObjectAddress, data: &[u8]) -> Result<()> {
        let path = self.path_of(addr);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&crc32c::crc32c(data).to_le_bytes())?;
            file.write_all(data)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(address = %addr, size = data.len(), "fstree: object stored");
        Ok(())
    }

    /// Read the bytes stored under `addr`
    pub fn get(&self, addr: &ObjectAddress) -> Result<Vec<u8>> {
        read_verified(&self.path_of(addr))
    }

    /// Size of the data stored under `addr`
    pub fn size(&self, addr: &ObjectAddress) -> Result<u64> {
        stored_size(&self.path_of(addr))
    }

    pub fn exists(&self, addr: &ObjectAddress) -> bool {
        self.path_of(addr).is_file()
    }

    /// Remove the file stored under `addr`
    pub fn delete(&self, addr: &ObjectAddress) -> Result<()> {
        match fs::remove_file(self.path_of(addr)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes taken by all stored files
    pub fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        self.iterate(IteratePrm {
            ignore_errors: true,
            handler: &mut |_, lazy| {
                total += lazy.size()?;
                Ok(())
            },
        })?;
        Ok(total)
    }

    /// Visit every stored object in address order
    pub fn iterate(&self, prm: IteratePrm<'_>) -> Result<()> {
        for first in sorted_entries(&self.root)? {
            if !first.is_dir() {
                continue;
            }
            for second in sorted_entries(&first)? {
                if !second.is_dir() {
                    continue;
                }
                for path in sorted_entries(&second)? {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name.ends_with(TMP_SUFFIX) {
                        continue;
                    }

                    let addr = match parse_file_name(name) {
                        Ok(addr) => addr,
                        Err(e) if prm.ignore_errors => {
                            debug!(file = name, error = %e, "fstree: skipping foreign file");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    (prm.handler)(addr, LazyRead { path: &path })?;
                }
            }
        }
        Ok(())
    }
}

fn file_name(addr: &ObjectAddress) -> String {
    hex::encode(addr.to_key())
}

fn parse_file_name(name: &str) -> Result<ObjectAddress> {
    let key = hex::decode(name)
        .map_err(|e| StorageError::corrupted(format!("fstree file name {name:?}: {e}")))?;
    Ok(ObjectAddress::from_key(&key)?)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn stored_size(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len().saturating_sub(CHECKSUM_LEN as u64)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
        Err(e) => Err(e.into()),
    }
}

fn read_verified(path: &Path) -> Result<Vec<u8>> {
    let mut data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
        Err(e) => return Err(e.into()),
    };

    if data.len() < CHECKSUM_LEN {
        return Err(StorageError::corrupted(format!(
            "{}: truncated file",
            path.display()
        )));
    }

    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(&data[..CHECKSUM_LEN]);
    let expected = u32::from_le_bytes(expected);
    let actual = crc32c::crc32c(&data[CHECKSUM_LEN..]);
    if expected != actual {
        return Err(StorageError::corrupted(format!(
            "{}: checksum mismatch: expected {expected:08x}, got {actual:08x}",
            path.display()
        )));
    }

    data.drain(..CHECKSUM_LEN);
    Ok(data)
}

#[cfg(test)]
pub(crate) fn corrupt_for_test(tree: &FsTree, addr: &ObjectAddress) {
    let path = tree.path_of(addr);
    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(path, data).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path()).unwrap();
        let addr = ObjectAddress::random();

        assert!(tree.get(&addr).unwrap_err().is_not_found());
        assert!(!tree.exists(&addr));

        tree.put(&addr, b"payload").unwrap();
        assert!(tree.exists(&addr));
        assert_eq!(tree.size(&addr).unwrap(), 7);
        assert_eq!(tree.disk_usage().unwrap(), 7);
        assert_eq!(tree.get(&addr).unwrap(), b"payload");

        tree.delete(&addr).unwrap();
        assert!(tree.delete(&addr).unwrap_err().is_not_found());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path()).unwrap();
        let addr = ObjectAddress::random();

        tree.put(&addr, &[7u8; 128]).unwrap();
        corrupt_for_test(&tree, &addr);

        assert!(matches!(tree.get(&addr), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn test_iterate_is_lazy_and_ordered() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path()).unwrap();

        let mut addrs: Vec<_> = (0..5).map(|_| ObjectAddress::random()).collect();
        for addr in &addrs {
            tree.put(addr, addr.encode_to_string().as_bytes()).unwrap();
        }
        addrs.sort_by_key(ObjectAddress::to_key);

        let mut seen = Vec::new();
        let mut reads = 0;
        tree.iterate(IteratePrm {
            ignore_errors: false,
            handler: &mut |addr, lazy| {
                if seen.len() % 2 == 0 {
                    assert_eq!(lazy.read()?, addr.encode_to_string().as_bytes());
                    reads += 1;
                }
                seen.push(addr);
                Ok(())
            },
        })
        .unwrap();

        assert_eq!(seen, addrs);
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_iterate_foreign_file() {
        let dir = tempdir().unwrap();
        let tree = FsTree::open(dir.path()).unwrap();
        let addr = ObjectAddress::random();
        tree.put(&addr, b"x").unwrap();

        let name = file_name(&addr);
        let foreign = dir.path().join(&name[..2]).join(&name[2..4]).join("not-an-address");
        fs::write(foreign, b"junk").unwrap();

        let mut count = 0;
        tree.iterate(IteratePrm {
            ignore_errors: true,
            handler: &mut |_, _| {
                count += 1;
                Ok(())
            },
        })
        .unwrap();
        assert_eq!(count, 1);

        let res = tree.iterate(IteratePrm {
            ignore_errors: false,
            handler: &mut |_, _| Ok(()),
        });
        assert!(res.is_err());
    }
}
