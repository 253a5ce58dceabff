// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The routing engine.
//!
//! A [`RoutingEngine`] owns one cache table and one forwarding table.
//! It is shared as an `Arc` between the forwarding path, the control
//! plane and maintenance. Entry lifecycle lives in [`lifecycle`],
//! cache maintenance in [`maint`] and multirouting in [`multirt`].
pub mod bucket;
pub mod ctable;
pub mod ftable;
pub mod ill;
pub mod ire;
pub mod lifecycle;
pub mod maint;
pub mod matcher;
pub mod multirt;
pub mod nce;

use self::bucket::BucketKey;
use self::bucket::BucketState;
use self::bucket::EntryBucket;
use self::bucket::Reaper;
use self::ctable::CacheTable;
use self::ftable::FwdTable;
use self::ill::Ill;
use self::ire::EntryRef;
use self::ire::RouteEntry;
use self::matcher::MatchCriteria;
use self::matcher::Matcher;
use self::nce::NeighborTable;
use crate::api::DumpEntriesResp;
use crate::api::EngineCfg;
use crate::api::EntryDump;
use crate::api::EntryKind;
use crate::api::EntryKindSet;
use crate::api::IreError;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::SecLabel;
use crate::api::TableKind;
use crate::api::ZoneId;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use crate::provider::Providers;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use kstat_macro::KStatProvider;

/// The longest gateway chain a recursive lookup will follow.
pub const MAX_RECURSION: usize = 8;

/// Engine-wide counters.
#[derive(KStatProvider)]
pub struct IreStats {
    pub alloced: KStatU64,
    pub freed: KStatU64,
    pub inserted: KStatU64,
    pub duplicates: KStatU64,
    pub deleted: KStatU64,
    pub condemned: KStatU64,
    pub swept: KStatU64,
    pub deferred: KStatU64,
    pub lookups_cache: KStatU64,
    pub lookups_cache_hit: KStatU64,
    pub lookups_fwd: KStatU64,
    pub lookups_fwd_hit: KStatU64,
    pub flushed: KStatU64,
    pub evicted: KStatU64,
    pub reclaimed: KStatU64,
    pub fastpath_probes: KStatU64,
}

pub struct RoutingEngine {
    cfg: EngineCfg,
    ctable: CacheTable,
    ftable: FwdTable,
    ncec: NeighborTable,
    // Taken as reader by the atomic-start phase of an add and as
    // writer by source-address topology changes.
    usesrc_lock: KRwLock<()>,
    next_handle: AtomicU32,
    stats: Arc<KStatNamed<IreStats>>,
    providers: Providers,
    started: Moment,
}

impl RoutingEngine {
    pub fn new(
        cfg: EngineCfg,
        providers: Providers,
    ) -> Result<Arc<Self>, IreError> {
        let size = cfg.cache_buckets(core::mem::size_of::<RouteEntry>());
        let stats = KStatNamed::new("ire", "ire_stats_v4", IreStats::new())
            .map_err(|e| IreError::InvalidConfig(e.to_string()))?;

        let engine = Self {
            ctable: CacheTable::new(size),
            ftable: FwdTable::new(),
            ncec: NeighborTable::new(),
            usesrc_lock: KRwLock::new(()),
            next_handle: AtomicU32::new(1),
            stats: Arc::new(stats),
            providers,
            started: Moment::now(),
            cfg,
        };
        engine.note(&format!("cache table sized at {size} buckets"));
        Ok(Arc::new(engine))
    }

    pub fn cfg(&self) -> &EngineCfg {
        &self.cfg
    }

    pub fn stats(&self) -> IreStatsSnap {
        self.stats.vals.snapshot()
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.ncec
    }

    pub fn cache_buckets(&self) -> usize {
        self.ctable.len()
    }

    pub fn fwd_buckets(&self) -> usize {
        self.ftable.bucket_count()
    }

    /// The cache bucket `addr` hashes to.
    pub fn cache_bucket(&self, addr: Ipv4Addr) -> &Arc<EntryBucket> {
        self.ctable.bucket(addr)
    }

    pub fn fwd_bucket(&self, prefix: Ipv4Cidr) -> Option<Arc<EntryBucket>> {
        self.ftable.get(prefix)
    }

    #[cfg(any(feature = "test-help", test))]
    pub fn cache_bucket_state(&self, addr: Ipv4Addr) -> BucketState {
        self.ctable.bucket(addr).state()
    }

    #[cfg(any(feature = "test-help", test))]
    pub fn fwd_bucket_state(&self, prefix: Ipv4Cidr) -> Option<BucketState> {
        self.ftable.get(prefix).map(|b| b.state())
    }

    pub fn matcher(&self) -> Matcher<'_> {
        Matcher::new(self.cfg.labeled, &*self.providers.label)
    }

    /// Make `ill` offer (or stop offering) a source address to `zone`.
    pub fn set_usable_src(&self, ill: &Ill, zone: ZoneId, usable: bool) {
        let _topology = self.usesrc_lock.write();
        ill.set_usable_src(zone, usable);
    }

    pub(crate) fn new_handle(&self) -> u32 {
        loop {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return handle;
            }
        }
    }

    pub(crate) fn note(&self, msg: &str) {
        self.providers.log.log(LogLevel::Note, msg);
    }

    pub(crate) fn warn(&self, msg: &str) {
        self.providers.log.log(LogLevel::Warn, msg);
    }

    // ================================================================
    // Lookups
    // ================================================================

    /// Find the cache-table entry for `addr` usable from `zone`.
    ///
    /// A Local entry owned by another zone is returned only when the
    /// route `zone` itself would use for `addr` leaves through the
    /// same interface (or interface group) as the Local entry.
    pub fn lookup_cache(
        &self,
        addr: Ipv4Addr,
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> Option<EntryRef> {
        self.stats.vals.lookups_cache.incr(1);
        let found =
            self.find_cache(addr, zone, label, EntryKindSet::CACHETABLE);
        if found.is_some() {
            self.stats.vals.lookups_cache_hit.incr(1);
        }
        found
    }

    pub(crate) fn find_cache(
        &self,
        addr: Ipv4Addr,
        zone: ZoneId,
        label: Option<&SecLabel>,
        kinds: EntryKindSet,
    ) -> Option<EntryRef> {
        let m = self.matcher();
        let crit = MatchCriteria::new().kinds(kinds).label(label.cloned());
        let found = self
            .ctable
            .bucket(addr)
            .walk(self)
            .filter(|e| e.dest().ip() == addr && m.matches_attrs(e, &crit))
            .find(|e| self.cache_zone_ok(e, zone, label));
        found
    }

    fn cache_zone_ok(
        &self,
        entry: &RouteEntry,
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> bool {
        if zone.is_all() || entry.zone() == zone || entry.zone().is_all() {
            return true;
        }
        if entry.kind() != EntryKind::Local
            || self.cfg.restrict_interzone_loopback
        {
            return false;
        }

        let Some(local_ill) = entry.src_ill() else {
            return false;
        };
        let crit = MatchCriteria::new()
            .kinds(EntryKindSet::FORWARDTABLE)
            .zone(zone)
            .label(label.cloned());
        let Some(route) = self.lpm(entry.dest().ip(), &crit, true) else {
            return false;
        };
        let via = if route.kind().is_interface() {
            Some(route)
        } else {
            self.resolve_gateway(&route, zone, label)
        };

        via.as_ref().and_then(|v| v.stq()).is_some_and(|ill| {
            Arc::ptr_eq(ill, local_ill)
                || (ill.group().is_some() && ill.group() == local_ill.group())
        })
    }

    /// Longest-prefix match in the forwarding table.
    ///
    /// With `crit.recursive` set, an off-link route is only returned
    /// if its gateway chain resolves to an interface route within
    /// [`MAX_RECURSION`] hops.
    pub fn lookup_forwarding(
        &self,
        addr: Ipv4Addr,
        crit: &MatchCriteria,
    ) -> Option<EntryRef> {
        self.stats.vals.lookups_fwd.incr(1);
        let found = self.lpm(addr, crit, crit.recursive);
        if found.is_some() {
            self.stats.vals.lookups_fwd_hit.incr(1);
        }
        found
    }

    pub(crate) fn lpm(
        &self,
        addr: Ipv4Addr,
        crit: &MatchCriteria,
        recursive: bool,
    ) -> Option<EntryRef> {
        let m = self.matcher();
        let zone = crit.zone.unwrap_or(ZoneId::ALL);
        let label = crit.security_label.as_ref();

        for bucket in self.ftable.covering(addr, crit.mask) {
            let cands: Vec<EntryRef> = bucket
                .walk(self)
                .filter(|e| m.matches(e, addr, crit))
                .collect();
            if cands.is_empty() {
                continue;
            }

            let defaults = cands
                .iter()
                .filter(|e| e.kind() == EntryKind::Default)
                .count();
            if defaults > 1 {
                let defaults: Vec<EntryRef> = cands
                    .iter()
                    .filter(|e| e.kind() == EntryKind::Default)
                    .cloned()
                    .collect();
                if let Some(pick) =
                    self.round_robin(&bucket, &defaults, zone, label)
                {
                    return Some(pick);
                }
                if recursive {
                    continue;
                }
            }

            let pick = cands.into_iter().find(|e| {
                !recursive
                    || e.gateway().is_none()
                    || self.resolve_gateway(e, zone, label).is_some()
            });
            if pick.is_some() {
                return pick;
            }
        }
        None
    }

    /// Choose among several default routes, starting after the one
    /// chosen last time. The first whose gateway is reachable through
    /// an interface route wins.
    fn round_robin(
        &self,
        bucket: &Arc<EntryBucket>,
        defaults: &[EntryRef],
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> Option<EntryRef> {
        let cursor = bucket.read().rr_cursor();
        let start = cursor
            .and_then(|c| defaults.iter().position(|e| Arc::ptr_eq(e, &c)))
            .map_or(0, |i| i + 1);

        let crit = MatchCriteria::new()
            .kinds(EntryKindSet::INTERFACE)
            .zone(zone)
            .label(label.cloned());
        let n = defaults.len();
        for i in 0..n {
            let cand = &defaults[(start + i) % n];
            let reachable = cand
                .gateway()
                .is_some_and(|gw| self.lpm(gw, &crit, false).is_some());
            if reachable {
                bucket.write().set_rr_cursor(cand);
                return Some(cand.clone());
            }
        }
        None
    }

    /// Follow the gateway chain of `route` until it reaches a cache
    /// entry or an interface route for the next hop.
    ///
    /// Stops after [`MAX_RECURSION`] hops or on revisiting a gateway.
    pub fn resolve_gateway(
        &self,
        route: &EntryRef,
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> Option<EntryRef> {
        let crit = MatchCriteria::new()
            .kinds(EntryKindSet::FORWARDTABLE)
            .zone(zone)
            .label(label.cloned());
        let mut visited: Vec<Ipv4Addr> = Vec::new();
        let mut cur = route.clone();

        for _ in 0..MAX_RECURSION {
            let Some(gw) = cur.gateway() else {
                return cur.kind().is_interface().then_some(cur);
            };
            if visited.contains(&gw) {
                return None;
            }
            visited.push(gw);

            let cached = self.find_cache(gw, zone, label, EntryKindSet::CACHE);
            if cached.is_some() {
                return cached;
            }

            let next = self.lpm(gw, &crit, false)?;
            if next.kind().is_interface() {
                return Some(next);
            }
            cur = next;
        }
        None
    }

    /// A cache lookup, falling back to a recursive forwarding lookup.
    pub fn lookup_route(
        &self,
        addr: Ipv4Addr,
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> Option<EntryRef> {
        if let Some(cached) = self.lookup_cache(addr, zone, label) {
            return Some(cached);
        }

        let crit = MatchCriteria::new()
            .kinds(EntryKindSet::FORWARDTABLE)
            .zone(zone)
            .label(label.cloned())
            .recursive();
        self.lookup_forwarding(addr, &crit)
    }

    /// [`RoutingEngine::lookup_route`] without touching the counters.
    pub(crate) fn route_quiet(
        &self,
        addr: Ipv4Addr,
        zone: ZoneId,
        label: Option<&SecLabel>,
    ) -> Option<EntryRef> {
        self.find_cache(addr, zone, label, EntryKindSet::CACHETABLE).or_else(
            || {
                let crit = MatchCriteria::new()
                    .kinds(EntryKindSet::FORWARDTABLE)
                    .zone(zone)
                    .label(label.cloned());
                self.lpm(addr, &crit, true)
            },
        )
    }

    // ================================================================
    // Walks
    // ================================================================

    /// Visit every live entry of one table.
    ///
    /// No lock is held while `f` runs, so it may call back into the
    /// engine, deleting entries included.
    pub fn walk_table(&self, table: TableKind, mut f: impl FnMut(EntryRef)) {
        match table {
            TableKind::Cache => {
                for bucket in self.ctable.iter() {
                    bucket.walk(self).for_each(&mut f);
                }
            }

            TableKind::Forwarding => {
                for bucket in self.ftable.all() {
                    bucket.walk(self).for_each(&mut f);
                }
            }
        }
    }

    /// Visit every live entry satisfying `pred`, cache table first.
    pub fn walk_all(
        &self,
        pred: impl Fn(&RouteEntry) -> bool,
        mut action: impl FnMut(EntryRef),
    ) {
        for table in [TableKind::Cache, TableKind::Forwarding] {
            self.walk_table(table, |e| {
                if pred(&e) {
                    action(e);
                }
            });
        }
    }

    /// Visit every live entry satisfying `crit`.
    pub fn walk_matching(
        &self,
        crit: &MatchCriteria,
        action: impl FnMut(EntryRef),
    ) {
        let m = self.matcher();
        self.walk_all(|e| m.matches_attrs(e, crit), action);
    }

    /// Describe every live entry.
    pub fn snapshot(&self) -> DumpEntriesResp {
        let now = Moment::now();
        let mut entries = Vec::new();
        for table in [TableKind::Cache, TableKind::Forwarding] {
            self.walk_table(table, |e| entries.push(dump_entry(&e, now)));
        }
        DumpEntriesResp::new(self.ctable.len(), entries)
    }

    /// Describe one entry. The reference count excludes `entry`.
    pub fn describe(&self, entry: &EntryRef) -> EntryDump {
        dump_entry(entry, Moment::now())
    }

    // ================================================================
    // DTrace probes
    // ================================================================

    pub(crate) fn add_probe(&self, entry: &RouteEntry, dup: bool) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let table_s = entry.table().to_string();
                let dest_s = entry.dest().to_string();
                let kind_s = entry.kind().to_string();
                crate::ire_provider::entry__add!(
                    || (table_s, dest_s, kind_s, u8::from(dup))
                );
            } else {
                let (..) = (entry, dup);
            }
        }
    }

    pub(crate) fn condemn_probe(&self, entry: &RouteEntry) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let table_s = entry.table().to_string();
                let dest_s = entry.dest().to_string();
                let kind_s = entry.kind().to_string();
                crate::ire_provider::entry__condemn!(
                    || (table_s, dest_s, kind_s)
                );
            } else {
                let _ = entry;
            }
        }
    }

    pub(crate) fn delete_probe(&self, entry: &RouteEntry) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let table_s = entry.table().to_string();
                let dest_s = entry.dest().to_string();
                let kind_s = entry.kind().to_string();
                crate::ire_provider::entry__delete!(
                    || (table_s, dest_s, kind_s)
                );
            } else {
                let _ = entry;
            }
        }
    }

    pub(crate) fn sweep_probe(&self, bucket: &EntryBucket, swept: u64) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let table_s = match bucket.key() {
                    BucketKey::Cache(_) => TableKind::Cache,
                    BucketKey::Forwarding(_) => TableKind::Forwarding,
                }
                .to_string();
                crate::ire_provider::bucket__sweep!(|| (table_s, swept));
            } else {
                let (..) = (bucket, swept);
            }
        }
    }

    pub(crate) fn flush_probe(&self, dest: Ipv4Cidr, reason: &str, n: u64) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let dest_s = dest.to_string();
                crate::ire_provider::cache__flush!(|| (dest_s, reason, n));
            } else {
                let (..) = (dest, reason, n);
            }
        }
    }

    pub(crate) fn evict_probe(
        &self,
        bucket: &EntryBucket,
        temp: u64,
        idle: u64,
    ) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let idx = match bucket.key() {
                    BucketKey::Cache(idx) => idx as u64,
                    BucketKey::Forwarding(_) => u64::MAX,
                };
                crate::ire_provider::cache__evict!(|| (idx, temp, idle));
            } else {
                let (..) = (bucket, temp, idle);
            }
        }
    }

    pub(crate) fn deferred_probe(&self, entry: &RouteEntry, ill: &Ill) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let dest_s = entry.dest().to_string();
                let ill_s = ill.name();
                crate::ire_provider::add__deferred!(|| (dest_s, ill_s));
            } else {
                let (..) = (entry, ill);
            }
        }
    }
}

impl Reaper for RoutingEngine {
    fn reap(&self, bucket: &Arc<EntryBucket>, swept: Vec<EntryRef>) {
        let n = swept.len() as u64;
        self.stats.vals.swept.incr(n);
        self.note(&format!(
            "swept {n} condemned entries from {:?}",
            bucket.key()
        ));
        self.sweep_probe(bucket, n);
        self.teardown(swept);
        self.ftable.try_free(bucket);
    }
}

fn dump_entry(e: &EntryRef, now: Moment) -> EntryDump {
    let metrics = e.metrics();
    EntryDump {
        table: e.table(),
        dest: e.dest(),
        gateway: e.gateway(),
        src_addr: e.src_addr(),
        kind: e.kind(),
        flags: e.flags(),
        marks: e.marks(),
        zone: e.zone(),
        stq: e.stq().map(|ill| String::from(ill.name())),
        stq_id: e.stq().map(|ill| ill.id()),
        max_frag: metrics.max_frag,
        // Not counting the reference held by this walk.
        refcnt: Arc::strong_count(e) - 1,
        ib_pkts: e.ib_pkts(),
        ob_pkts: e.ob_pkts(),
        parent_handle: e.parent_handle(),
        interface_handle: e.interface_handle(),
        age_ms: now.delta_as_millis(e.created()),
        idle_ms: now.delta_as_millis(e.last_used()),
        rtt: metrics.rtt,
        ssthresh: metrics.ssthresh,
        nce_state: e.nce().map(|nce| nce.state()),
    }
}
