//! Shard registry entries and traversal order

use crate::shard::Shard;
use cairn_common::ObjectAddress;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// Registered shard with its placement data
#[derive(Clone)]
pub struct HashedShard {
    pub shard: Arc<Shard>,
    /// Hash of the shard ID; seeds the address hash when scoring
    hash: u64,
    pub weight: f64,
    /// Transient errors since the last mode change
    pub(super) errors: Arc<AtomicU32>,
}

impl HashedShard {
    pub(super) fn new(shard: Arc<Shard>, weight: f64) -> Self {
        let hash = xxhash_rust::xxh64::xxh64(shard.id().as_bytes(), 0);
        Self {
            shard,
            hash,
            weight,
            errors: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.shard.id()
    }

    /// Weighted rendezvous score of this shard for `addr`.
    ///
    /// The hash is mapped to a uniform value in (0, 1) and scored as
    /// `weight / -ln(u)`, so a shard wins a share of addresses proportional
    /// to its weight.
    #[must_use]
    pub fn score(&self, addr: &ObjectAddress) -> f64 {
        let mixed = xxhash_rust::xxh64::xxh64(&addr.to_key(), self.hash);
        let unit = ((mixed >> 11) as f64 + 0.5) / (1u64 << 53) as f64;
        self.weight / -unit.ln()
    }
}

/// Order in which a traversal visits shards
#[derive(Clone, Copy, Debug)]
pub enum ShardOrder<'a> {
    /// Registry order; for operations that must reach every shard
    Unsorted,
    /// Highest rendezvous score for the address first
    Hrw(&'a ObjectAddress),
}

impl ShardOrder<'_> {
    pub(super) fn arrange(self, shards: &mut [HashedShard]) {
        match self {
            Self::Unsorted => {}
            Self::Hrw(addr) => {
                shards.sort_by(|a, b| {
                    b.score(addr)
                        .total_cmp(&a.score(addr))
                        .then_with(|| a.id().cmp(b.id()))
                });
            }
        }
    }
}
