// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Entry lifecycle: create, add, delete and release.
//!
//! An add runs its checks and the insert inside one critical section
//! (the atomic start) holding, in order, the source-address topology
//! lock as reader, the home bucket's lock as writer and the state lock
//! of every interface the entry references. Interface locks are taken
//! in address order and released in reverse. Everything that may call
//! back into the engine (cache flushes, eviction, teardown of swept
//! entries) runs after all of them are dropped.
use super::RoutingEngine;
use super::bucket::EntryBucket;
use super::bucket::Removal;
use super::ill::Ill;
use super::ill::IllFlags;
use super::ill::IllState;
use super::ire::EntryArgs;
use super::ire::EntryRef;
use super::ire::Home;
use super::ire::RouteEntry;
use super::maint::EvictLimits;
use super::matcher::MatchCriteria;
use super::nce::NeighborEntry;
use crate::api::EntryKind;
use crate::api::IreError;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::NeighborState;
use crate::api::RouteFlags;
use crate::api::TableKind;
use crate::api::ZoneId;
use crate::ddi::sync::KMutexGuard;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;

/// Completion for an add that was deferred behind a reconfiguring
/// interface. Called exactly once with the final outcome.
pub type AddDone = Box<dyn FnOnce(Result<EntryRef, IreError>) + Send>;

/// Why cache entries are being flushed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    /// A more specific forwarding route appeared.
    Added,
    /// The forwarding entry the cache entries were derived from went
    /// away.
    Removed,
}

impl Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Added => "add",
            Self::Removed => "delete",
        };
        write!(f, "{s}")
    }
}

// Drop interface guards in the reverse of acquisition order.
fn release_reverse(mut guards: Vec<KMutexGuard<'_, IllState>>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

fn validate(args: &EntryArgs) -> Result<(), IreError> {
    let dest = args.dest;
    let kind = args.kind;

    if kind.is_interface() {
        if args.resolver_template.is_none() {
            return Err(IreError::InvalidConfig(format!(
                "interface route {dest} has no resolver template"
            )));
        }
        if args.stq.is_none() {
            return Err(IreError::InvalidConfig(format!(
                "interface route {dest} has no outbound interface"
            )));
        }
    }

    if kind.is_resolvable() && args.stq.is_none() {
        return Err(IreError::InvalidConfig(format!(
            "{kind} entry {dest} has no outbound interface"
        )));
    }

    let host_only = matches!(
        kind,
        EntryKind::Cache
            | EntryKind::Broadcast
            | EntryKind::Local
            | EntryKind::Loopback
            | EntryKind::Host
    );
    if host_only && !dest.is_host() {
        return Err(IreError::InvalidConfig(format!(
            "{kind} entry {dest} must be a host address"
        )));
    }

    if kind == EntryKind::Default && !dest.is_default() {
        return Err(IreError::InvalidConfig(format!(
            "default route with destination {dest}"
        )));
    }

    let no_gw_ok =
        args.flags.intersects(RouteFlags::REJECT | RouteFlags::BLACKHOLE);
    if kind.is_offsubnet() && args.gateway.is_none() && !no_gw_ok {
        return Err(IreError::InvalidConfig(format!(
            "{kind} route {dest} has no gateway"
        )));
    }

    Ok(())
}

impl RoutingEngine {
    /// Build an unlinked entry from `args`.
    ///
    /// Cache and broadcast entries are bound to the neighbor entry for
    /// their next hop, which is created on first use. A new binding is
    /// made reachable immediately when `args` carries a resolver
    /// template, and handed to the resolver otherwise.
    pub fn create(&self, mut args: EntryArgs) -> Result<RouteEntry, IreError> {
        validate(&args)?;

        if let Some(label) = &args.label {
            if !self.cfg.labeled {
                return Err(IreError::InvalidConfig(format!(
                    "label on {} but the system is unlabeled",
                    args.dest
                )));
            }
            if !self.providers.label.admit(label) {
                return Err(IreError::PolicyDenied(format!(
                    "label doi {} refused for {}",
                    label.doi, args.dest
                )));
            }
        }

        let nce = match (&args.stq, args.kind.is_resolvable()) {
            (Some(stq), true) => {
                let next_hop = args.gateway.unwrap_or(args.dest.ip());
                let template = args.resolver_template.take();
                Some(self.bind_neighbor(stq, next_hop, template))
            }
            _ => None,
        };

        self.stats.vals.alloced.incr(1);
        Ok(RouteEntry::from_args(args, nce, self.stats.clone()))
    }

    fn bind_neighbor(
        &self,
        stq: &Arc<Ill>,
        addr: Ipv4Addr,
        template: Option<Vec<u8>>,
    ) -> Arc<NeighborEntry> {
        let (nce, created) = self.ncec.lookup_or_create(stq, addr);
        if !created {
            return nce;
        }

        // Build the fast-path header whenever the binding (re)resolves.
        let stats = self.stats.clone();
        nce.subscribe(Arc::new(move |nce, state| {
            if state != NeighborState::Reachable {
                return;
            }
            let hdr = nce.ill().and_then(|ill| ill.fastpath_probe(nce));
            if let Some(hdr) = hdr {
                nce.set_fp_hdr(hdr);
                stats.vals.fastpath_probes.incr(1);
            }
        }));

        match template {
            Some(template) => nce.set_reachable(&template),
            None => self.providers.resolver.resolve(stq, &nce),
        }
        nce
    }

    /// Link `entry` into its table.
    ///
    /// Returns the linked entry, which is an existing one when `entry`
    /// duplicates it. If an interface the entry references is
    /// reconfiguring, the add is queued on that interface and
    /// [`IreError::Deferred`] is returned; `done` is then called with
    /// the final result once the interface settles. Otherwise `done`
    /// is dropped uncalled.
    pub fn add(
        self: &Arc<Self>,
        entry: RouteEntry,
        done: Option<AddDone>,
    ) -> Result<EntryRef, IreError> {
        let mut done = done;
        self.add_ref(Arc::new(entry), &mut done)
    }

    fn home_bucket(&self, entry: &RouteEntry) -> Arc<EntryBucket> {
        match entry.table() {
            TableKind::Cache => self.ctable.bucket(entry.dest().ip()).clone(),
            TableKind::Forwarding => self.ftable.get_or_create(entry.dest()),
        }
    }

    fn add_ref(
        self: &Arc<Self>,
        entry: EntryRef,
        done: &mut Option<AddDone>,
    ) -> Result<EntryRef, IreError> {
        debug_assert!(!entry.is_linked());

        let usesrc = self.usesrc_lock.read();
        let bucket = self.home_bucket(&entry);
        let mut inner = bucket.write();
        if inner.is_freed() {
            // Lost a race with the bucket being freed.
            drop(inner);
            drop(usesrc);
            return self.add_ref(entry, done);
        }

        let swept = bucket.sweep_locked(&mut inner);
        let ills = entry.ills();
        let mut held = Vec::with_capacity(ills.len());
        for ill in &ills {
            held.push(ill.lock());
        }

        let mut verdict = Ok(());
        for (ill, state) in ills.iter().zip(held.iter_mut()) {
            if state.flags.contains(IllFlags::CONDEMNED) {
                verdict = Err(IreError::InterfaceUnusable(format!(
                    "{} is condemned",
                    ill.name()
                )));
                break;
            }

            // Only the outbound interface refuses entries while offline.
            let is_stq = entry.stq().is_some_and(|stq| Arc::ptr_eq(ill, stq));
            if is_stq
                && state.flags.contains(IllFlags::OFFLINE)
                && !entry.is_hidden()
            {
                verdict = Err(IreError::InterfaceUnusable(format!(
                    "{} is offline",
                    ill.name()
                )));
                break;
            }

            if state.flags.contains(IllFlags::CHANGING) {
                let engine = Arc::downgrade(self);
                let retry = entry.clone();
                let cb = done.take();
                state.enqueue_retry(Box::new(move || {
                    Self::retry_add(engine, retry, cb)
                }));
                self.deferred_probe(&entry, ill);
                verdict = Err(IreError::Deferred);
                break;
            }
        }

        if verdict.is_ok() {
            verdict = self.check_neighbor(&entry);
        }

        if let Err(e) = verdict {
            release_reverse(held);
            drop(inner);
            drop(usesrc);
            self.teardown(swept);
            if e == IreError::Deferred {
                self.stats.vals.deferred.incr(1);
                self.note(&format!("add of {} deferred", entry.dest()));
            } else {
                self.warn(&format!("add of {} failed: {e}", entry.dest()));
            }
            return Err(e);
        }

        // Snapshot the outbound MTU.
        let stq_pos = entry
            .stq()
            .and_then(|stq| ills.iter().position(|ill| Arc::ptr_eq(ill, stq)));
        if let Some(pos) = stq_pos {
            let mtu = held[pos].mtu;
            let cur = entry.max_frag();
            entry.set_max_frag(if cur == 0 { mtu } else { cur.min(mtu) });
        }

        if let Some(existing) = inner.find_duplicate(&entry) {
            release_reverse(held);
            drop(inner);
            drop(usesrc);
            self.teardown(swept);
            self.stats.vals.duplicates.incr(1);
            self.add_probe(&existing, true);
            return Ok(existing);
        }

        if entry.kind().is_interface() && entry.interface_handle() == 0 {
            entry.set_interface_handle(self.new_handle());
        }
        if entry.table() == TableKind::Forwarding
            && entry.gateway().is_some()
            && entry.parent_handle() == 0
        {
            entry.set_parent_handle(self.new_handle());
        }

        let slot = match inner.insert(entry.clone()) {
            Ok(slot) => slot,
            Err(e) => {
                release_reverse(held);
                drop(inner);
                drop(usesrc);
                self.teardown(swept);
                return Err(e);
            }
        };
        entry.set_home(Some(Home { bucket: Arc::downgrade(&bucket), slot }));
        for ill in &ills {
            ill.ire_cnt_incr();
        }

        release_reverse(held);
        drop(inner);
        drop(usesrc);

        self.teardown(swept);
        self.stats.vals.inserted.incr(1);
        self.add_probe(&entry, false);

        match entry.kind() {
            EntryKind::Cache => {
                if self.cfg.evict_on_add {
                    self.evict_idle(&bucket, EvictLimits::from_cfg(&self.cfg));
                }
            }

            kind if kind.in_cache_table() => {}

            _ => {
                self.flush_affected_cache_entries(&entry, FlushReason::Added);
            }
        }

        if entry.kind().is_resolvable() {
            self.fastpath(&entry);
        }

        Ok(entry)
    }

    // A cache entry may only be linked against a usable binding.
    fn check_neighbor(&self, entry: &RouteEntry) -> Result<(), IreError> {
        if entry.kind() != EntryKind::Cache {
            return Ok(());
        }
        let Some(nce) = entry.nce() else {
            return Ok(());
        };

        let state = nce.state();
        let unusable = nce.is_condemned() || state == NeighborState::Failed;
        let unresolved =
            !entry.allow_unresolved() && state != NeighborState::Reachable;
        if unusable || unresolved {
            return Err(IreError::UnresolvedNotAllowed(nce.addr()));
        }
        Ok(())
    }

    fn retry_add(
        engine: Weak<RoutingEngine>,
        entry: EntryRef,
        mut done: Option<AddDone>,
    ) {
        let res = match engine.upgrade() {
            Some(engine) => engine.add_ref(entry, &mut done),
            None => Err(IreError::InterfaceUnusable(
                "routing engine has shut down".into(),
            )),
        };

        // A second deferral has taken ownership of `done`.
        if let Some(done) = done {
            done(res);
        }
    }

    /// Delete `entry`, consuming the caller's reference.
    ///
    /// The entry is condemned at once, so no new lookup can return it.
    /// It is unlinked now if its bucket is not being walked, and by
    /// the last walker out otherwise.
    pub fn delete(&self, entry: EntryRef) {
        let Some(home) = entry.home() else {
            return;
        };
        let Some(bucket) = home.bucket.upgrade() else {
            return;
        };

        let removal = {
            let mut inner = bucket.write();
            bucket.remove_locked(&mut inner, home.slot, &entry)
        };

        match removal {
            Removal::NotLinked => {}

            Removal::Deferred => {
                self.stats.vals.condemned.incr(1);
                self.condemn_probe(&entry);
            }

            Removal::Unlinked(unlinked) => {
                self.teardown(alloc::vec![unlinked]);
                self.ftable.try_free(&bucket);
            }
        }
    }

    /// Drop a reference obtained from a lookup or walk.
    ///
    /// The entry is freed if this was the last reference, which can
    /// only happen once it has been unlinked.
    pub fn release(&self, entry: EntryRef) {
        debug_assert!(Arc::strong_count(&entry) > 1 || !entry.is_linked());
        drop(entry);
    }

    /// Finish off entries that have been unlinked.
    ///
    /// Forwarding entries take the cache entries derived from them
    /// along, and a default route also takes the redirects learned
    /// through its gateway.
    pub(crate) fn teardown(&self, entries: Vec<EntryRef>) {
        for entry in entries {
            self.stats.vals.deleted.incr(1);
            self.delete_probe(&entry);
            if entry.table() == TableKind::Cache {
                continue;
            }

            self.flush_affected_cache_entries(&entry, FlushReason::Removed);
            if entry.kind() == EntryKind::Default {
                if let Some(gw) = entry.gateway() {
                    self.delete_redirects(gw);
                }
            }
        }
    }

    fn delete_redirects(&self, gw: Ipv4Addr) -> usize {
        let mut n = 0;
        self.walk_table(TableKind::Forwarding, |e| {
            if e.kind() == EntryKind::Host
                && e.flags().contains(RouteFlags::DYNAMIC)
                && e.gateway() == Some(gw)
            {
                self.delete(e);
                n += 1;
            }
        });
        n
    }

    /// Delete the cache entries made stale by a change to the
    /// forwarding entry `entry`. Returns the number deleted.
    ///
    /// On [`FlushReason::Added`] that is every cache entry the new
    /// route is more specific for, or whose gateway the new route
    /// covers. On [`FlushReason::Removed`] it is every cache entry
    /// derived from `entry`, as recorded by its handles.
    pub fn flush_affected_cache_entries(
        &self,
        entry: &RouteEntry,
        reason: FlushReason,
    ) -> usize {
        if entry.table() == TableKind::Cache {
            return 0;
        }

        let mut n = 0;
        match reason {
            FlushReason::Added => {
                if entry.kind() == EntryKind::Default {
                    return 0;
                }

                let route = entry.dest();
                self.walk_table(TableKind::Cache, |c| {
                    if c.kind() != EntryKind::Cache {
                        return;
                    }
                    let covered = route.is_member(c.dest().ip())
                        && c.cmask() < route.prefix();
                    let gw_moved =
                        c.gateway().is_some_and(|gw| route.is_member(gw));
                    if covered || gw_moved {
                        self.delete(c);
                        n += 1;
                    }
                });
            }

            FlushReason::Removed => {
                let crit = MatchCriteria::new()
                    .kinds(EntryKind::Cache.bit())
                    .hidden()
                    .private_addr();
                let crit = if entry.kind().is_interface() {
                    crit.interface_handle(entry.interface_handle())
                } else {
                    crit.parent_handle(entry.parent_handle())
                };
                let handle = crit.interface_handle.or(crit.parent_handle);
                if handle == Some(0) {
                    return 0;
                }

                let m = self.matcher();
                self.walk_table(TableKind::Cache, |c| {
                    if m.matches_attrs(&c, &crit) {
                        self.delete(c);
                        n += 1;
                    }
                });
            }
        }

        if n > 0 {
            self.stats.vals.flushed.incr(n as u64);
            self.note(&format!(
                "flushed {n} cache entries after {reason} of {}",
                entry.dest()
            ));
        }
        self.flush_probe(entry.dest(), &reason.to_string(), n as u64);
        n
    }

    /// Delete the cache entries for `addr`, or reached through the
    /// gateway `addr`, visible from `zone`.
    pub fn delete_cache_gw(&self, addr: Ipv4Addr, zone: ZoneId) -> usize {
        let mut n = 0;
        self.walk_table(TableKind::Cache, |c| {
            let zone_ok =
                zone.is_all() || c.zone() == zone || c.zone().is_all();
            let hit = c.dest().ip() == addr || c.gateway() == Some(addr);
            if c.kind() == EntryKind::Cache && zone_ok && hit {
                self.delete(c);
                n += 1;
            }
        });
        n
    }

    /// Delete every entry referencing `ill`.
    pub fn delete_by_interface(&self, ill: &Arc<Ill>) -> usize {
        let mut n = 0;
        self.walk_all(
            |e| e.references_ill(ill),
            |e| {
                self.delete(e);
                n += 1;
            },
        );
        if n > 0 {
            self.note(&format!("deleted {n} entries on {}", ill.name()));
        }
        n
    }

    /// Delete the entries for exactly `dest` that satisfy `crit`.
    pub fn delete_matching(
        &self,
        dest: Ipv4Cidr,
        crit: &MatchCriteria,
    ) -> Result<usize, IreError> {
        let m = self.matcher();
        let mut n = 0;
        self.walk_all(
            |e| e.dest() == dest && m.matches_attrs(e, crit),
            |e| {
                self.delete(e);
                n += 1;
            },
        );

        if n == 0 {
            return Err(IreError::NotFound(dest.to_string()));
        }
        Ok(n)
    }

    /// The next broadcast entry for the same address after `entry` in
    /// its bucket, on another interface.
    pub fn next_broadcast(&self, entry: &RouteEntry) -> Option<EntryRef> {
        let home = entry.home()?;
        let bucket = home.bucket.upgrade()?;
        let inner = bucket.read();
        inner.next_after(home.slot, |e| {
            e.kind() == EntryKind::Broadcast && e.dest() == entry.dest()
        })
    }

    /// Build the fast-path header for a resolvable entry's neighbor
    /// binding, if it is resolved and has none yet.
    pub fn fastpath(&self, entry: &RouteEntry) -> bool {
        let (Some(nce), Some(stq)) = (entry.nce(), entry.stq()) else {
            return false;
        };
        if nce.has_fp_hdr()
            || !nce.is_reachable()
            || nce.res_template().is_none()
        {
            return false;
        }

        match stq.fastpath_probe(nce) {
            Some(hdr) => {
                nce.set_fp_hdr(hdr);
                self.stats.vals.fastpath_probes.incr(1);
                true
            }

            None => {
                self.warn(&format!(
                    "fast-path probe failed for {} on {}",
                    nce.addr(),
                    stq.name()
                ));
                false
            }
        }
    }
}
