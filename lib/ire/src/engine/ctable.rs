// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The cache table: a fixed array of buckets, hashed by address.
use super::bucket::BucketKey;
use super::bucket::EntryBucket;
use crate::api::Ipv4Addr;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Fold the four bytes of `addr` together and keep the low bits.
/// `size` must be a power of two.
pub fn addr_hash(addr: Ipv4Addr, size: usize) -> usize {
    let a = u32::from(addr);
    ((a ^ (a >> 8) ^ (a >> 16) ^ (a >> 24)) as usize) & (size - 1)
}

pub struct CacheTable {
    buckets: Vec<Arc<EntryBucket>>,
}

impl CacheTable {
    /// Preallocate `size` buckets. `size` is a power of two.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let buckets = (0..size)
            .map(|i| Arc::new(EntryBucket::new(BucketKey::Cache(i))))
            .collect();
        Self { buckets }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn index(&self, addr: Ipv4Addr) -> usize {
        addr_hash(addr, self.buckets.len())
    }

    pub fn bucket(&self, addr: Ipv4Addr) -> &Arc<EntryBucket> {
        &self.buckets[self.index(addr)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntryBucket>> {
        self.buckets.iter()
    }
}
