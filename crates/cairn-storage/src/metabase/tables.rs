//! Redb table definitions of the metabase.

use redb::TableDefinition;

/// Stored objects: address key → bincode(ObjectRecord)
pub const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

/// Expiration index: big-endian epoch ++ address key → ()
pub const EXPIRATION: TableDefinition<&[u8], ()> = TableDefinition::new("expiration");

/// Inhumed addresses: address key → bincode(GraveRecord)
pub const GRAVEYARD: TableDefinition<&[u8], &[u8]> = TableDefinition::new("graveyard");

/// Roots of split objects: parent address key → bincode(SplitRecord)
pub const SPLIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("split");

/// Locked objects: address key → bincode(Vec<ObjectId>) of lockers
pub const LOCKED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("locked");

/// Lock objects: locker address key → bincode(Vec<ObjectId>) of protected members
pub const LOCKERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("lockers");

/// Length of an expiration index key
pub const EXPIRATION_KEY_LEN: usize = 8 + cairn_common::ADDRESS_KEY_LEN;

pub fn expiration_key(epoch: u64, addr_key: &[u8]) -> [u8; EXPIRATION_KEY_LEN] {
    let mut key = [0u8; EXPIRATION_KEY_LEN];
    key[..8].copy_from_slice(&epoch.to_be_bytes());
    key[8..].copy_from_slice(addr_key);
    key
}
