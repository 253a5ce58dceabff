// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Buckets of entries and the walker protocol.
//!
//! A bucket is a doubly-linked list threaded through a slot arena, so
//! that an entry can be unlinked in constant time given its
//! [`SlotId`]. The bucket lock is only ever held for short, bounded
//! sections: a walk takes a *hold* (bumping the walker count) and then
//! steps through the list taking the read lock once per step.
//!
//! While any hold is outstanding nothing is physically unlinked:
//! deletion only sets the condemned mark and flags the bucket.
//! The walker that drops the last hold sweeps the condemned entries
//! and hands them to a [`Reaper`] for teardown outside the lock. This
//! also keeps slot indices stable for the duration of every walk.
use super::ill::Ill;
use super::ire::EntryRef;
use super::ire::RouteEntry;
use crate::api::EntryKind;
use crate::api::GroupId;
use crate::api::IreError;
use crate::api::Ipv4Cidr;
use crate::api::RouteFlags;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockReadGuard;
use crate::ddi::sync::KRwLockWriteGuard;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

/// A generation-checked reference to a slot in a bucket's arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotId {
    idx: u32,
    generation: u32,
}

/// What a bucket is keyed by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BucketKey {
    /// Index into the cache table.
    Cache(usize),
    /// The exact prefix held by a forwarding-table bucket.
    Forwarding(Ipv4Cidr),
}

struct Node {
    entry: EntryRef,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The state protected by the bucket lock.
#[derive(Default)]
pub struct BucketInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    pending_condemned: bool,
    entry_count: u32,
    temporary_count: u32,
    linked: u32,
    rr_cursor: Option<Weak<RouteEntry>>,
    freed: bool,
}

/// The outcome of removing an entry from its bucket.
pub(crate) enum Removal {
    /// The entry was not (or no longer) linked here.
    NotLinked,
    /// Walkers are active: the entry is condemned but still linked.
    Deferred,
    /// The entry was unlinked. The bucket's reference is returned so
    /// it can be released outside the lock.
    Unlinked(EntryRef),
}

/// Counters describing a bucket, for reporting and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BucketState {
    pub entry_count: u32,
    pub temporary_count: u32,
    pub linked: u32,
    pub walkers: u32,
    pub pending_condemned: bool,
}

impl BucketInner {
    fn node(&self, idx: u32) -> Option<&Node> {
        self.slots.get(idx as usize).and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, idx: u32) -> Option<&mut Node> {
        self.slots.get_mut(idx as usize).and_then(|s| s.node.as_mut())
    }

    pub fn get(&self, slot: SlotId) -> Option<&EntryRef> {
        let s = self.slots.get(slot.idx as usize)?;
        if s.generation != slot.generation {
            return None;
        }
        s.node.as_ref().map(|n| &n.entry)
    }

    /// Every linked entry in list order, condemned ones included.
    pub fn iter(&self) -> impl Iterator<Item = &EntryRef> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let node = self.node(cur?)?;
            cur = node.next;
            Some(&node.entry)
        })
    }

    pub(crate) fn iter_slots(
        &self,
    ) -> impl Iterator<Item = (SlotId, &EntryRef)> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let idx = cur?;
            let slot = self.slots.get(idx as usize)?;
            let node = slot.node.as_ref()?;
            cur = node.next;
            Some((SlotId { idx, generation: slot.generation }, &node.entry))
        })
    }

    /// Non-condemned entries.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn temporary_count(&self) -> u32 {
        self.temporary_count
    }

    /// Physically linked entries, condemned ones included.
    pub fn linked(&self) -> u32 {
        self.linked
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub(crate) fn set_freed(&mut self) {
        self.freed = true;
    }

    pub fn rr_cursor(&self) -> Option<EntryRef> {
        self.rr_cursor.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_rr_cursor(&mut self, entry: &EntryRef) {
        self.rr_cursor = Some(Arc::downgrade(entry));
    }

    /// Find a live entry that an add of `new` would duplicate.
    ///
    /// Two entries are duplicates when they agree on destination and
    /// mask, kind, gateway, outbound interface and zone. A hidden
    /// cache entry only duplicates another hidden one, and multirouted
    /// cache entries derived from different routes are distinct.
    pub fn find_duplicate(&self, new: &RouteEntry) -> Option<EntryRef> {
        self.iter()
            .find(|old| {
                !old.is_condemned()
                    && old.dest() == new.dest()
                    && old.kind() == new.kind()
                    && old.gateway() == new.gateway()
                    && same_ill(old.stq(), new.stq())
                    && old.zone() == new.zone()
                    && (new.kind() != EntryKind::Cache
                        || old.is_hidden() == new.is_hidden())
                    && !(new.flags().contains(RouteFlags::MULTIRT)
                        && new.kind() == EntryKind::Cache
                        && old.parent_handle() != new.parent_handle())
            })
            .cloned()
    }

    /// Link `entry` after the last entry sharing its destination, or at
    /// the tail when there is none. Broadcast entries are additionally
    /// kept next to those on the same interface group.
    pub fn insert(&mut self, entry: EntryRef) -> Result<SlotId, IreError> {
        let dest = entry.dest();
        let broadcast = entry.kind() == EntryKind::Broadcast;

        let mut last_same = None;
        let mut last_group = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let Some(node) = self.node(idx) else { break };
            if node.entry.dest() == dest {
                last_same = Some(idx);
                if broadcast
                    && ill_group(node.entry.stq()) == ill_group(entry.stq())
                {
                    last_group = Some(idx);
                }
            } else if last_same.is_some() {
                break;
            }
            cur = node.next;
        }
        let after = last_group.or(last_same).or(self.tail);

        let idx = self.alloc_slot()?;
        let temporary = entry.is_temporary();
        let next = match after {
            Some(prev) => self.node(prev).and_then(|n| n.next),
            None => self.head,
        };

        let slot = &mut self.slots[idx as usize];
        slot.node = Some(Node { entry, prev: after, next });
        let id = SlotId { idx, generation: slot.generation };

        match after {
            Some(prev) => {
                if let Some(n) = self.node_mut(prev) {
                    n.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        match next {
            Some(next) => {
                if let Some(n) = self.node_mut(next) {
                    n.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }

        self.linked += 1;
        self.entry_count += 1;
        if temporary {
            self.temporary_count += 1;
        }
        Ok(id)
    }

    // Reserve room in the free list for every slot, so unlinking never
    // allocates.
    fn alloc_slot(&mut self) -> Result<u32, IreError> {
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }

        let idx = u32::try_from(self.slots.len())
            .map_err(|_| IreError::OutOfMemory)?;
        self.slots.try_reserve(1).map_err(|_| IreError::OutOfMemory)?;
        let want = self.slots.len() + 1 - self.free.len();
        self.free.try_reserve(want).map_err(|_| IreError::OutOfMemory)?;
        self.slots.push(Slot::default());
        Ok(idx)
    }

    /// Account for `entry` leaving the live set. Called once per
    /// entry, when it is condemned.
    fn uncount(&mut self, entry: &RouteEntry) {
        debug_assert!(self.entry_count > 0);
        self.entry_count = self.entry_count.saturating_sub(1);
        if entry.is_temporary() {
            debug_assert!(self.temporary_count > 0);
            self.temporary_count = self.temporary_count.saturating_sub(1);
        }

        let cursor_is_entry = self
            .rr_cursor
            .as_ref()
            .is_some_and(|c| core::ptr::eq(c.as_ptr(), entry));
        if cursor_is_entry {
            self.rr_cursor = None;
        }
    }

    fn unlink(&mut self, slot: SlotId) -> Option<EntryRef> {
        let s = self.slots.get_mut(slot.idx as usize)?;
        if s.generation != slot.generation {
            return None;
        }
        let node = s.node.take()?;
        s.generation = s.generation.wrapping_add(1);

        match node.prev {
            Some(prev) => {
                if let Some(n) = self.node_mut(prev) {
                    n.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.node_mut(next) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.free.push(slot.idx);
        debug_assert!(self.linked > 0);
        self.linked -= 1;
        debug_assert!(node.entry.is_condemned());
        node.entry.set_home(None);
        Some(node.entry)
    }

    /// Unlink every condemned entry.
    fn sweep(&mut self) -> Vec<EntryRef> {
        let condemned: Vec<SlotId> = self
            .iter_slots()
            .filter(|(_, e)| e.is_condemned())
            .map(|(slot, _)| slot)
            .collect();
        self.pending_condemned = false;
        condemned.into_iter().filter_map(|slot| self.unlink(slot)).collect()
    }

    /// The first live entry after `slot` satisfying `pred`.
    pub fn next_after(
        &self,
        slot: SlotId,
        pred: impl Fn(&RouteEntry) -> bool,
    ) -> Option<EntryRef> {
        self.get(slot)?;
        let mut cur = self.node(slot.idx).and_then(|n| n.next);
        while let Some(idx) = cur {
            let node = self.node(idx)?;
            if !node.entry.is_condemned() && pred(&node.entry) {
                return Some(node.entry.clone());
            }
            cur = node.next;
        }
        None
    }
}

fn same_ill(a: Option<&Arc<Ill>>, b: Option<&Arc<Ill>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn ill_group(ill: Option<&Arc<Ill>>) -> Option<GroupId> {
    ill.and_then(|ill| ill.group())
}

/// Teardown for entries swept by the last walker out of a bucket.
pub trait Reaper {
    fn reap(&self, bucket: &Arc<EntryBucket>, swept: Vec<EntryRef>);
}

pub struct EntryBucket {
    key: BucketKey,
    walkers: AtomicU32,
    inner: KRwLock<BucketInner>,
}

impl EntryBucket {
    pub fn new(key: BucketKey) -> Self {
        Self {
            key,
            walkers: AtomicU32::new(0),
            inner: KRwLock::new(BucketInner::default()),
        }
    }

    pub fn key(&self) -> BucketKey {
        self.key
    }

    pub fn walkers(&self) -> u32 {
        self.walkers.load(Ordering::Acquire)
    }

    pub(crate) fn read(&self) -> KRwLockReadGuard<'_, BucketInner> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> KRwLockWriteGuard<'_, BucketInner> {
        self.inner.write()
    }

    pub fn state(&self) -> BucketState {
        let inner = self.inner.read();
        BucketState {
            entry_count: inner.entry_count,
            temporary_count: inner.temporary_count,
            linked: inner.linked,
            walkers: self.walkers(),
            pending_condemned: inner.pending_condemned,
        }
    }

    /// Logically delete the entry at `slot`, and unlink it too when no
    /// walker is active. The caller holds the write lock.
    pub(crate) fn remove_locked(
        &self,
        inner: &mut BucketInner,
        slot: SlotId,
        entry: &RouteEntry,
    ) -> Removal {
        let linked =
            inner.get(slot).is_some_and(|e| core::ptr::eq(&**e, entry));
        if !linked {
            return Removal::NotLinked;
        }

        if entry.condemn() {
            inner.uncount(entry);
        }

        if self.walkers() != 0 {
            inner.pending_condemned = true;
            return Removal::Deferred;
        }

        match inner.unlink(slot) {
            Some(entry) => Removal::Unlinked(entry),
            None => Removal::NotLinked,
        }
    }

    /// Sweep condemned entries if no walker is active. Adds call this
    /// so dead entries never accumulate behind a quiet bucket.
    pub(crate) fn sweep_locked(
        &self,
        inner: &mut BucketInner,
    ) -> Vec<EntryRef> {
        if self.walkers() == 0 && inner.pending_condemned {
            inner.sweep()
        } else {
            Vec::new()
        }
    }

    /// Take a hold, returning the head of the list.
    fn hold(&self) -> Option<u32> {
        let inner = self.inner.read();
        self.walkers.fetch_add(1, Ordering::AcqRel);
        inner.head
    }

    /// Drop a hold. The last walker out sweeps.
    fn unhold(&self) -> Vec<EntryRef> {
        {
            let _inner = self.inner.read();
            let prev = self.walkers.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "walker underflow");
            if prev != 1 {
                return Vec::new();
            }
        }

        let mut inner = self.inner.write();
        self.sweep_locked(&mut inner)
    }

    /// Walk the live entries of this bucket.
    pub fn walk<'a>(
        self: &Arc<Self>,
        reaper: &'a dyn Reaper,
    ) -> BucketWalk<'a> {
        let cursor = self.hold();
        BucketWalk { bucket: self.clone(), reaper, cursor }
    }
}

/// A hold on a bucket, iterating its live entries.
///
/// The bucket lock is taken for each step and never held between
/// them, so the consumer may call back into the engine, including
/// deleting the entry it was just handed.
pub struct BucketWalk<'a> {
    bucket: Arc<EntryBucket>,
    reaper: &'a dyn Reaper,
    cursor: Option<u32>,
}

impl BucketWalk<'_> {
    pub fn bucket(&self) -> &Arc<EntryBucket> {
        &self.bucket
    }
}

impl Iterator for BucketWalk<'_> {
    type Item = EntryRef;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.bucket.inner.read();
        while let Some(idx) = self.cursor {
            let Some(node) = inner.node(idx) else {
                self.cursor = None;
                break;
            };
            self.cursor = node.next;
            if !node.entry.is_condemned() {
                return Some(node.entry.clone());
            }
        }
        None
    }
}

impl Drop for BucketWalk<'_> {
    fn drop(&mut self) {
        let swept = self.bucket.unhold();
        if !swept.is_empty() {
            self.reaper.reap(&self.bucket, swept);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::EngineCfg;
    use crate::api::InterfaceId;
    use crate::api::ZoneId;
    use crate::engine::RoutingEngine;
    use crate::engine::ire::EntryArgs;
    use crate::provider::Providers;

    // With 16 buckets, 10.0.0.1, 10.0.0.17 and 10.0.0.33 collide.
    fn setup() -> (Arc<RoutingEngine>, Arc<Ill>) {
        let cfg = EngineCfg {
            cache_table_size: 16,
            max_cache_table_size: 16,
            mem_avail: 0,
            ..Default::default()
        };
        let engine = RoutingEngine::new(cfg, Providers::quiet()).unwrap();
        let ill = Arc::new(Ill::new("net0", InterfaceId(1), 1500));
        (engine, ill)
    }

    fn local(
        engine: &Arc<RoutingEngine>,
        ill: &Arc<Ill>,
        addr: &str,
        zone: ZoneId,
    ) -> EntryRef {
        let args = EntryArgs::new(EntryKind::Local, addr.parse().unwrap())
            .ipif(ill)
            .zone(zone);
        engine.add(engine.create(args).unwrap(), None).unwrap()
    }

    #[test]
    fn delete_during_walk_is_deferred() {
        let (engine, ill) = setup();
        let a = local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        let b = local(&engine, &ill, "10.0.0.17", ZoneId::GLOBAL);
        let bucket = engine.cache_bucket(a.dest().ip()).clone();
        assert!(Arc::ptr_eq(&bucket, engine.cache_bucket(b.dest().ip())));

        let mut walk = bucket.walk(&*engine);
        let first = walk.next().unwrap();
        assert!(Arc::ptr_eq(&first, &a));

        engine.delete(b.clone());
        let st = bucket.state();
        assert_eq!(st.walkers, 1);
        assert_eq!(st.entry_count, 1);
        assert_eq!(st.linked, 2);
        assert!(st.pending_condemned);
        assert!(b.is_condemned());
        assert!(b.is_linked());

        // The condemned entry is skipped by the rest of the walk.
        assert!(walk.next().is_none());
        drop(walk);

        let st = bucket.state();
        assert_eq!(st.walkers, 0);
        assert_eq!(st.linked, 1);
        assert!(!st.pending_condemned);
        assert!(!b.is_linked());
        assert_eq!(Arc::strong_count(&b), 1);
        assert_eq!(engine.stats().swept, 1);
    }

    #[test]
    fn last_walker_sweeps() {
        let (engine, ill) = setup();
        let a = local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        let bucket = engine.cache_bucket(a.dest().ip()).clone();

        let outer = bucket.walk(&*engine);
        let inner = bucket.walk(&*engine);
        assert_eq!(bucket.walkers(), 2);
        engine.delete(a.clone());

        drop(outer);
        assert_eq!(bucket.state().linked, 1);
        assert!(a.is_linked());

        drop(inner);
        assert_eq!(bucket.state().linked, 0);
        assert!(!a.is_linked());
    }

    #[test]
    fn same_destination_stays_adjacent() {
        let (engine, ill) = setup();
        local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        local(&engine, &ill, "10.0.0.17", ZoneId::GLOBAL);
        local(&engine, &ill, "10.0.0.1", ZoneId(5));
        local(&engine, &ill, "10.0.0.33", ZoneId::GLOBAL);

        let bucket = engine.cache_bucket("10.0.0.1".parse().unwrap());
        let order: Vec<String> =
            bucket.read().iter().map(|e| e.dest().to_string()).collect();
        assert_eq!(
            order,
            ["10.0.0.1/32", "10.0.0.1/32", "10.0.0.17/32", "10.0.0.33/32"]
        );
    }

    #[test]
    fn duplicate_add_returns_existing() {
        let (engine, ill) = setup();
        let a = local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        let b = local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        assert!(Arc::ptr_eq(&a, &b));

        let stats = engine.stats();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.freed, 1);
        assert_eq!(ill.ire_cnt(), 1);
    }

    #[test]
    fn stale_slots_are_rejected() {
        let (engine, ill) = setup();
        let a = local(&engine, &ill, "10.0.0.1", ZoneId::GLOBAL);
        let slot = a.home().unwrap().slot;
        let bucket = engine.cache_bucket(a.dest().ip()).clone();

        engine.delete(a);
        let b = local(&engine, &ill, "10.0.0.17", ZoneId::GLOBAL);
        let inner = bucket.read();
        assert!(inner.get(slot).is_none());
        assert!(inner.get(b.home().unwrap().slot).is_some());
    }
}
