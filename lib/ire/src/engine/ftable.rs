// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The forwarding table.
//!
//! One map per prefix length, from masked address to the bucket
//! holding every route for exactly that prefix. A longest-prefix match
//! probes the maps from /32 down to /0. Buckets are created on first
//! insert and freed once they are both empty and unwalked.
use super::bucket::BucketKey;
use super::bucket::EntryBucket;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::Ipv4PrefixLen;
use crate::ddi::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

const LEVELS: usize = 33;

type Level = KRwLock<BTreeMap<Ipv4Addr, Arc<EntryBucket>>>;

pub struct FwdTable {
    levels: [Level; LEVELS],
    buckets: AtomicUsize,
}

impl Default for FwdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FwdTable {
    pub fn new() -> Self {
        Self {
            levels: core::array::from_fn(|_| KRwLock::new(BTreeMap::new())),
            buckets: AtomicUsize::new(0),
        }
    }

    /// The number of allocated buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.load(Ordering::Relaxed)
    }

    pub fn get(&self, prefix: Ipv4Cidr) -> Option<Arc<EntryBucket>> {
        self.levels[usize::from(prefix.prefix_len())]
            .read()
            .get(&prefix.ip())
            .cloned()
    }

    pub fn get_or_create(&self, prefix: Ipv4Cidr) -> Arc<EntryBucket> {
        if let Some(bucket) = self.get(prefix) {
            return bucket;
        }

        let mut level = self.levels[usize::from(prefix.prefix_len())].write();
        level
            .entry(prefix.ip())
            .or_insert_with(|| {
                self.buckets.fetch_add(1, Ordering::Relaxed);
                Arc::new(EntryBucket::new(BucketKey::Forwarding(prefix)))
            })
            .clone()
    }

    /// Free `bucket` if it holds nothing and nobody is walking it.
    ///
    /// The bucket is flagged freed under its own lock, so an add that
    /// fetched it before removal sees the flag and fetches again.
    pub fn try_free(&self, bucket: &Arc<EntryBucket>) -> bool {
        let BucketKey::Forwarding(prefix) = bucket.key() else {
            return false;
        };

        let mut level = self.levels[usize::from(prefix.prefix_len())].write();
        let mut inner = bucket.write();
        if inner.is_freed() || inner.linked() != 0 || bucket.walkers() != 0 {
            return false;
        }

        let ours =
            level.get(&prefix.ip()).is_some_and(|b| Arc::ptr_eq(b, bucket));
        if ours {
            level.remove(&prefix.ip());
            self.buckets.fetch_sub(1, Ordering::Relaxed);
        }
        inner.set_freed();
        true
    }

    /// The buckets whose prefix covers `addr`, most specific first.
    /// With `mask` set, only that prefix length is considered.
    pub fn covering(
        &self,
        addr: Ipv4Addr,
        mask: Option<Ipv4PrefixLen>,
    ) -> Vec<Arc<EntryBucket>> {
        let lens: Vec<u8> = match mask {
            Some(len) => vec![len.val()],
            None => (0..=32).rev().collect(),
        };

        lens.into_iter()
            .filter_map(|len| {
                let prefix = Ipv4PrefixLen::new(len).ok()?;
                let key = addr.safe_mask(prefix);
                self.levels[usize::from(len)].read().get(&key).cloned()
            })
            .collect()
    }

    /// Every bucket, most specific prefixes first.
    pub fn all(&self) -> Vec<Arc<EntryBucket>> {
        self.levels
            .iter()
            .rev()
            .flat_map(|level| {
                level.read().values().cloned().collect::<Vec<_>>()
            })
            .collect()
    }
}
