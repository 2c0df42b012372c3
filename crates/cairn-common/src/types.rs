//! Core type definitions for Cairn
//!
//! This module defines the identifiers and the object model shared by the
//! storage engine and the node daemon.

use bytes::Bytes;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Global network time unit driving expiration and lock lifetime
pub type Epoch = u64;

/// Length of an encoded [`ObjectAddress`] key in bytes
pub const ADDRESS_KEY_LEN: usize = 32;

/// Unique identifier for a container
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ContainerId(Uuid);

impl ContainerId {
    /// Generate a new random container ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Unique identifier for an object within a container
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a new random object ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Address of an object: the universal key of every storage operation.
///
/// The string form is `<container>/<object>` with both halves hex encoded,
/// the binary key form is the 16 container bytes followed by the 16 object
/// bytes so that keys of one container sort together.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectAddress {
    container: ContainerId,
    object: ObjectId,
}

impl ObjectAddress {
    #[must_use]
    pub const fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// Random address, handy for tests and tooling
    #[must_use]
    pub fn random() -> Self {
        Self::new(ContainerId::new(), ObjectId::new())
    }

    #[must_use]
    pub const fn container(&self) -> ContainerId {
        self.container
    }

    #[must_use]
    pub const fn object(&self) -> ObjectId {
        self.object
    }

    /// Same container, different object
    #[must_use]
    pub const fn with_object(&self, object: ObjectId) -> Self {
        Self::new(self.container, object)
    }

    /// Binary key used by the on-disk stores
    #[must_use]
    pub fn to_key(&self) -> [u8; ADDRESS_KEY_LEN] {
        let mut key = [0u8; ADDRESS_KEY_LEN];
        key[..16].copy_from_slice(self.container.as_bytes());
        key[16..].copy_from_slice(self.object.as_bytes());
        key
    }

    /// Decode a binary key produced by [`ObjectAddress::to_key`]
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != ADDRESS_KEY_LEN {
            return Err(Error::InvalidAddress(format!(
                "key length {} != {}",
                key.len(),
                ADDRESS_KEY_LEN
            )));
        }

        let mut cnr = [0u8; 16];
        let mut obj = [0u8; 16];
        cnr.copy_from_slice(&key[..16]);
        obj.copy_from_slice(&key[16..]);
        Ok(Self::new(ContainerId::from_bytes(cnr), ObjectId::from_bytes(obj)))
    }

    /// String form, used as the write-cache key
    #[must_use]
    pub fn encode_to_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Debug for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectAddress({self})")
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

impl FromStr for ObjectAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cnr, obj) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(format!("missing separator in {s:?}")))?;

        let cnr = Uuid::try_parse(cnr)
            .map_err(|e| Error::InvalidAddress(format!("container {cnr:?}: {e}")))?;
        let obj = Uuid::try_parse(obj)
            .map_err(|e| Error::InvalidAddress(format!("object {obj:?}: {e}")))?;

        Ok(Self::new(cnr.into(), obj.into()))
    }
}

/// Kind of a stored object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// Plain user data
    #[default]
    Regular,
    /// Records why a set of objects was removed
    Tombstone,
    /// Protects a set of objects from removal
    Lock,
    /// Groups objects for audit
    StorageGroup,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regular => "REGULAR",
            Self::Tombstone => "TOMBSTONE",
            Self::Lock => "LOCK",
            Self::StorageGroup => "STORAGE_GROUP",
        };
        f.write_str(s)
    }
}

/// Operating mode of a shard or a write-cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Accepts reads and writes
    #[default]
    ReadWrite,
    /// Rejects every mutation
    ReadOnly,
    /// Index unavailable: the shard only serves what the blob store can answer
    Degraded,
}

impl Mode {
    #[must_use]
    pub const fn read_only(self) -> bool {
        !matches!(self, Self::ReadWrite)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Link from a part of a split object to its logical parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    /// Identifier of the logical (root) object
    pub parent: ObjectId,
    /// Identifier shared by all parts of one split chain
    pub split_id: Uuid,
    /// Set on the final part of the chain
    pub last: bool,
}

/// What is locally known about a split object whose root was requested
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub split_id: Option<Uuid>,
    pub last_part: Option<ObjectId>,
}

impl fmt::Display for SplitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.split_id, &self.last_part) {
            (Some(id), Some(last)) => write!(f, "split {} (last part {last})", id.simple()),
            (Some(id), None) => write!(f, "split {}", id.simple()),
            (None, Some(last)) => write!(f, "split (last part {last})"),
            (None, None) => f.write_str("split"),
        }
    }
}

/// Payload of tombstone and lock objects: the member objects they refer to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberList {
    pub members: Vec<ObjectId>,
}

/// A stored object: header fields the storage engine cares about plus payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub address: ObjectAddress,
    pub object_type: ObjectType,
    pub expiration_epoch: Option<Epoch>,
    pub parent: Option<ParentInfo>,
    pub payload: Bytes,
}

impl Object {
    /// Create a regular object
    #[must_use]
    pub fn new(address: ObjectAddress, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            object_type: ObjectType::Regular,
            expiration_epoch: None,
            parent: None,
            payload: payload.into(),
        }
    }

    /// Create a tombstone covering `members` of the same container
    pub fn tombstone(address: ObjectAddress, members: &[ObjectId], expiration: Epoch) -> Result<Self> {
        Ok(Self::with_members(address, ObjectType::Tombstone, members)?.with_expiration(expiration))
    }

    /// Create a lock protecting `members` of the same container
    pub fn lock(address: ObjectAddress, members: &[ObjectId], expiration: Epoch) -> Result<Self> {
        Ok(Self::with_members(address, ObjectType::Lock, members)?.with_expiration(expiration))
    }

    fn with_members(address: ObjectAddress, object_type: ObjectType, members: &[ObjectId]) -> Result<Self> {
        let list = MemberList {
            members: members.to_vec(),
        };
        let payload =
            bincode::serialize(&list).map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(Self {
            object_type,
            ..Self::new(address, payload)
        })
    }

    #[must_use]
    pub fn with_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = object_type;
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, epoch: Epoch) -> Self {
        self.expiration_epoch = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: ParentInfo) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Members referenced by a tombstone or lock object
    pub fn members(&self) -> Result<Vec<ObjectId>> {
        match self.object_type {
            ObjectType::Tombstone | ObjectType::Lock => {
                let list: MemberList = bincode::deserialize(&self.payload)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(list.members)
            }
            other => Err(Error::Deserialization(format!(
                "{other} object has no member list"
            ))),
        }
    }

    /// Whether the object is expired at `epoch`
    #[must_use]
    pub fn is_expired(&self, epoch: Epoch) -> bool {
        self.expiration_epoch.is_some_and(|exp| exp <= epoch)
    }

    /// Serialize to the binary form stored by the write-cache and blob store
    pub fn marshal(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse the binary form produced by [`Object::marshal`]
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
