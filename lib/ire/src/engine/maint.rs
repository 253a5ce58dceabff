// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Cache maintenance: eviction of idle entries, periodic expiry and
//! memory-pressure reclaim.
use super::RoutingEngine;
use super::bucket::EntryBucket;
use super::bucket::Removal;
use super::ire::EntryRef;
use super::ire::RouteEntry;
use crate::api::CacheCounts;
use crate::api::EngineCfg;
use crate::api::EntryKind;
use crate::api::ExpireFlags;
use crate::api::NeighborState;
use crate::api::ReclaimFractions;
use crate::api::RouteFlags;
use crate::api::TableKind;
use crate::ddi::time::Moment;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Bounds for one [`RoutingEngine::evict_idle`] pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvictLimits {
    /// Temporary entries tolerated before any are evicted.
    pub max_temp: u32,
    /// Non-temporary entries tolerated before idle ones are evicted.
    pub max_total: u32,
    /// Victims per category.
    pub budget: u32,
}

impl EvictLimits {
    pub fn from_cfg(cfg: &EngineCfg) -> Self {
        Self {
            max_temp: cfg.max_bucket_cnt,
            max_total: cfg.max_bucket_cnt,
            budget: cfg.cleanup_cnt,
        }
    }
}

/// The reclaim category of a cache entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CacheClass {
    Onlink,
    Pmtu,
    Offlink,
    Unused,
}

fn classify(entry: &RouteEntry) -> CacheClass {
    if entry.gateway().is_none() {
        return CacheClass::Onlink;
    }
    if entry.src_ill().is_some_and(|ill| entry.max_frag() < ill.mtu()) {
        return CacheClass::Pmtu;
    }
    if entry.tire_mark() != entry.pkts() {
        return CacheClass::Offlink;
    }
    CacheClass::Unused
}

impl RoutingEngine {
    /// Trim an overfull cache bucket.
    ///
    /// Deletes up to `limits.budget` temporary entries, oldest first,
    /// when there are more than `limits.max_temp` of them. Then, if
    /// the other entries number more than `limits.max_total`, deletes
    /// up to `limits.budget` off-link entries that nobody else
    /// references and that have not been used for the configured idle
    /// cutoff. Returns the number of entries deleted.
    pub fn evict_idle(
        &self,
        bucket: &Arc<EntryBucket>,
        limits: EvictLimits,
    ) -> usize {
        let now = Moment::now();
        let cutoff = self.cfg.idle_cutoff_ms;
        let budget = limits.budget as usize;
        let mut unlinked = Vec::new();
        let mut deferred = 0;
        let mut temp = 0;
        let mut idle = 0;

        {
            let mut inner = bucket.write();

            if inner.temporary_count() > limits.max_temp {
                let victims: Vec<_> = inner
                    .iter_slots()
                    .filter(|(_, e)| !e.is_condemned() && e.is_temporary())
                    .take(budget)
                    .map(|(slot, e)| (slot, e.clone()))
                    .collect();
                for (slot, e) in victims {
                    match bucket.remove_locked(&mut inner, slot, &e) {
                        Removal::Unlinked(e) => unlinked.push(e),
                        Removal::Deferred => deferred += 1,
                        Removal::NotLinked => continue,
                    }
                    temp += 1;
                }
            }

            let permanent = inner.entry_count() - inner.temporary_count();
            if permanent > limits.max_total {
                let victims: Vec<_> = inner
                    .iter_slots()
                    .filter(|(_, e)| {
                        !e.is_condemned()
                            && !e.is_temporary()
                            && e.kind() == EntryKind::Cache
                            && e.gateway().is_some()
                            && Arc::strong_count(*e) == 1
                            && now.delta_as_millis(e.last_used()) >= cutoff
                    })
                    .take(budget)
                    .map(|(slot, e)| (slot, e.clone()))
                    .collect();
                for (slot, e) in victims {
                    match bucket.remove_locked(&mut inner, slot, &e) {
                        Removal::Unlinked(e) => unlinked.push(e),
                        Removal::Deferred => deferred += 1,
                        Removal::NotLinked => continue,
                    }
                    idle += 1;
                }
            }
        }

        if temp + idle == 0 {
            return 0;
        }

        self.stats.vals.condemned.incr(deferred);
        self.stats.vals.evicted.incr((temp + idle) as u64);
        self.evict_probe(bucket, temp as u64, idle as u64);
        self.teardown(unlinked);
        temp + idle
    }

    /// Age out state according to `flags`. Returns the number of
    /// entries deleted.
    ///
    /// * [`ExpireFlags::REDIRECT`]: delete dynamic routes.
    /// * [`ExpireFlags::ARP`]: delete cache entries whose neighbor
    ///   binding has failed, gone away or outlived the ARP expiry, then
    ///   drop the neighbor table's keys for unused bindings.
    /// * [`ExpireFlags::MTU`]: reset cache path MTUs to the interface
    ///   MTU.
    pub fn expire(&self, flags: ExpireFlags) -> usize {
        let now = Moment::now();
        let mut n = 0;

        if flags.contains(ExpireFlags::REDIRECT) {
            self.walk_table(TableKind::Forwarding, |e| {
                if e.flags().contains(RouteFlags::DYNAMIC) {
                    self.delete(e);
                    n += 1;
                }
            });
        }

        if flags.contains(ExpireFlags::ARP) {
            let max_age = self.cfg.arp_expire_ms;
            self.walk_table(TableKind::Cache, |e| {
                if e.kind() != EntryKind::Cache {
                    return;
                }
                let stale = e.nce().is_some_and(|nce| {
                    nce.is_condemned()
                        || nce.state() == NeighborState::Failed
                        || nce.age_ms(now) > max_age
                });
                if stale {
                    self.delete(e);
                    n += 1;
                }
            });
            self.neighbors().prune();
        }

        if flags.contains(ExpireFlags::MTU) {
            self.walk_table(TableKind::Cache, |e| {
                if e.kind() != EntryKind::Cache {
                    return;
                }
                if let Some(ill) = e.src_ill() {
                    e.set_max_frag(ill.mtu());
                }
            });
        }

        if n > 0 {
            self.note(&format!("expired {n} entries ({flags:?})"));
        }
        n
    }

    /// Count cache entries by reclaim category.
    pub fn cache_counts(&self) -> CacheCounts {
        let mut counts = CacheCounts::default();
        self.walk_table(TableKind::Cache, |e| {
            if e.kind() != EntryKind::Cache {
                return;
            }
            counts.total += 1;
            match classify(&e) {
                CacheClass::Onlink => counts.onlink += 1,
                CacheClass::Pmtu => counts.pmtu += 1,
                CacheClass::Offlink => counts.offlink += 1,
                CacheClass::Unused => counts.unused += 1,
            }
        });
        counts
    }

    /// Free roughly one in `N` cache entries of each category, where
    /// `N` is that category's fraction in `fr`.
    pub fn cache_reclaim(&self, fr: ReclaimFractions) -> usize {
        let seed = Moment::now().delta_as_millis(self.started) as u32;
        self.cache_reclaim_seeded(fr, seed)
    }

    /// [`RoutingEngine::cache_reclaim`] with an explicit seed.
    ///
    /// An entry is freed when `seed` plus its bucket index is a
    /// multiple of its category's fraction. Survivors have their
    /// packet count recorded, so that entries unused until the next
    /// pass fall into the unused category.
    pub fn cache_reclaim_seeded(
        &self,
        fr: ReclaimFractions,
        seed: u32,
    ) -> usize {
        let mut n = 0;
        for (idx, bucket) in self.ctable.iter().enumerate() {
            let rand = seed.wrapping_add(idx as u32);
            let entries: Vec<EntryRef> = bucket
                .walk(self)
                .filter(|e| e.kind() == EntryKind::Cache)
                .collect();

            for e in entries {
                let fraction = match classify(&e) {
                    CacheClass::Onlink => fr.onlink,
                    CacheClass::Pmtu => fr.pmtu,
                    CacheClass::Offlink => fr.offlink,
                    CacheClass::Unused => fr.unused,
                };
                if fraction != 0 && rand % fraction == 0 {
                    self.delete(e);
                    n += 1;
                    continue;
                }
                e.set_tire_mark(e.pkts());
            }
        }

        if n > 0 {
            self.stats.vals.reclaimed.incr(n as u64);
            self.note(&format!("reclaimed {n} cache entries"));
        }
        n
    }
}
