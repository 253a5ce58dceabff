// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Route and cache entries.
//!
//! A [`RouteEntry`] is shared through an [`EntryRef`]. The home bucket
//! holds one strong reference for as long as the entry is linked;
//! every lookup result is another. The entry is freed when the last of
//! them is dropped, wherever that happens.
use super::IreStats;
use super::bucket::EntryBucket;
use super::bucket::SlotId;
use super::ill::Ill;
use super::nce::NeighborEntry;
use crate::api::EntryKind;
use crate::api::EntryMarks;
use crate::api::IreError;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::Ipv4PrefixLen;
use crate::api::RouteFlags;
use crate::api::SecLabel;
use crate::api::TableKind;
use crate::api::ZoneId;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use itertools::Itertools;

pub type EntryRef = Arc<RouteEntry>;

/// Path metrics, updated in place by transport feedback.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RouteMetrics {
    pub max_frag: u32,
    pub rtt: u32,
    pub rtt_sd: u32,
    pub ssthresh: u32,
}

/// Where a linked entry lives.
#[derive(Clone)]
pub(crate) struct Home {
    pub(crate) bucket: Weak<EntryBucket>,
    pub(crate) slot: SlotId,
}

/// Arguments to [`super::RoutingEngine::create`].
#[derive(Clone, Debug)]
pub struct EntryArgs {
    pub kind: EntryKind,
    pub dest: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub src_addr: Option<Ipv4Addr>,
    pub zone: ZoneId,
    pub flags: RouteFlags,
    pub marks: EntryMarks,
    pub stq: Option<Arc<Ill>>,
    pub ipif: Option<Arc<Ill>>,
    pub in_ill: Option<Arc<Ill>>,
    pub resolver_template: Option<Vec<u8>>,
    pub label: Option<SecLabel>,
    pub metrics: RouteMetrics,
    pub cmask: Ipv4PrefixLen,
    pub parent_handle: u32,
    pub interface_handle: u32,
    pub allow_unresolved: bool,
}

impl EntryArgs {
    pub fn new(kind: EntryKind, dest: Ipv4Cidr) -> Self {
        Self {
            kind,
            dest,
            gateway: None,
            src_addr: None,
            zone: ZoneId::GLOBAL,
            flags: RouteFlags::UP,
            marks: EntryMarks::empty(),
            stq: None,
            ipif: None,
            in_ill: None,
            resolver_template: None,
            label: None,
            metrics: RouteMetrics::default(),
            cmask: Ipv4PrefixLen::NETMASK_NONE,
            parent_handle: 0,
            interface_handle: 0,
            allow_unresolved: true,
        }
    }

    pub fn gateway(mut self, gw: Ipv4Addr) -> Self {
        self.gateway = Some(gw);
        self.flags.insert(RouteFlags::GATEWAY);
        self
    }

    pub fn src_addr(mut self, src: Ipv4Addr) -> Self {
        self.src_addr = Some(src);
        self
    }

    pub fn zone(mut self, zone: ZoneId) -> Self {
        self.zone = zone;
        self
    }

    pub fn flags(mut self, flags: RouteFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    pub fn marks(mut self, marks: EntryMarks) -> Self {
        self.marks.insert(marks);
        self
    }

    /// The outbound interface.
    pub fn stq(mut self, ill: &Arc<Ill>) -> Self {
        self.stq = Some(ill.clone());
        self
    }

    /// The interface owning the source address.
    pub fn ipif(mut self, ill: &Arc<Ill>) -> Self {
        self.ipif = Some(ill.clone());
        self
    }

    pub fn in_ill(mut self, ill: &Arc<Ill>) -> Self {
        self.in_ill = Some(ill.clone());
        self
    }

    pub fn template(mut self, template: Vec<u8>) -> Self {
        self.resolver_template = Some(template);
        self
    }

    pub fn label(mut self, label: SecLabel) -> Self {
        self.label = Some(label);
        self
    }

    pub fn metrics(mut self, metrics: RouteMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn allow_unresolved(mut self, allow: bool) -> Self {
        self.allow_unresolved = allow;
        self
    }

    /// Record the forwarding entries a cache entry is derived from:
    /// the off-link `route` it was resolved against, and the interface
    /// entry `iface` that reaches its next hop.
    pub fn cache_via(
        mut self,
        route: &RouteEntry,
        iface: Option<&RouteEntry>,
    ) -> Self {
        self.cmask = route.dest().prefix();
        if route.kind().is_interface() {
            self.interface_handle = route.interface_handle();
        } else {
            self.parent_handle = route.parent_handle();
        }
        if let Some(iface) = iface {
            self.interface_handle = iface.interface_handle();
        }
        if route.flags().contains(RouteFlags::MULTIRT) {
            self.flags.insert(RouteFlags::MULTIRT);
        }
        self
    }
}

pub struct RouteEntry {
    dest: Ipv4Cidr,
    kind: EntryKind,
    gateway: Option<Ipv4Addr>,
    src_addr: Option<Ipv4Addr>,
    zone: ZoneId,
    flags: RouteFlags,
    marks: AtomicU32,
    cmask: Ipv4PrefixLen,
    nce: Option<Arc<NeighborEntry>>,
    stq: Option<Arc<Ill>>,
    ipif: Option<Arc<Ill>>,
    in_ill: Option<Arc<Ill>>,
    resolver_template: Option<Vec<u8>>,
    label: Option<SecLabel>,
    parent_handle: AtomicU32,
    interface_handle: AtomicU32,
    allow_unresolved: bool,
    created: Moment,
    last_used: KMutex<Moment>,
    ib_pkts: AtomicU64,
    ob_pkts: AtomicU64,
    tire_mark: AtomicU64,
    metrics: KMutex<RouteMetrics>,
    home: KMutex<Option<Home>>,
    stats: Arc<KStatNamed<IreStats>>,
}

impl Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("dest", &self.dest)
            .field("kind", &self.kind)
            .field("gateway", &self.gateway)
            .field("zone", &self.zone)
            .field("flags", &self.flags)
            .field("marks", &self.marks())
            .finish_non_exhaustive()
    }
}

impl Drop for RouteEntry {
    fn drop(&mut self) {
        // Entries are only freed while linked when their bucket is
        // itself being torn down.
        debug_assert!(
            self.home
                .lock()
                .as_ref()
                .is_none_or(|home| home.bucket.strong_count() == 0),
            "freeing linked entry {}",
            self.dest
        );
        self.stats.vals.freed.incr(1);
    }
}

impl RouteEntry {
    pub(crate) fn from_args(
        args: EntryArgs,
        nce: Option<Arc<NeighborEntry>>,
        stats: Arc<KStatNamed<IreStats>>,
    ) -> Self {
        let now = Moment::now();
        Self {
            dest: args.dest,
            kind: args.kind,
            gateway: args.gateway,
            src_addr: args.src_addr,
            zone: args.zone,
            flags: args.flags,
            marks: AtomicU32::new(args.marks.bits()),
            cmask: args.cmask,
            nce,
            stq: args.stq,
            ipif: args.ipif,
            in_ill: args.in_ill,
            resolver_template: args.resolver_template,
            label: args.label,
            parent_handle: AtomicU32::new(args.parent_handle),
            interface_handle: AtomicU32::new(args.interface_handle),
            allow_unresolved: args.allow_unresolved,
            created: now,
            last_used: KMutex::new(now),
            ib_pkts: AtomicU64::new(0),
            ob_pkts: AtomicU64::new(0),
            tire_mark: AtomicU64::new(0),
            metrics: KMutex::new(args.metrics),
            home: KMutex::new(None),
            stats,
        }
    }

    pub fn dest(&self) -> Ipv4Cidr {
        self.dest
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// The table this entry lives in.
    pub fn table(&self) -> TableKind {
        if self.kind.in_cache_table() {
            TableKind::Cache
        } else {
            TableKind::Forwarding
        }
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn src_addr(&self) -> Option<Ipv4Addr> {
        self.src_addr
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn flags(&self) -> RouteFlags {
        self.flags
    }

    pub fn marks(&self) -> EntryMarks {
        EntryMarks::from_bits_retain(self.marks.load(Ordering::Acquire))
    }

    pub fn is_condemned(&self) -> bool {
        self.marks().contains(EntryMarks::CONDEMNED)
    }

    pub fn is_hidden(&self) -> bool {
        self.marks().contains(EntryMarks::HIDDEN)
    }

    pub fn is_temporary(&self) -> bool {
        self.marks().contains(EntryMarks::TEMPORARY)
    }

    /// Set the condemned mark. Returns true for the call that set it.
    ///
    /// Condemning releases the entry's hold on its interfaces' entry
    /// counts: it is the point of logical deletion.
    pub(crate) fn condemn(&self) -> bool {
        let prev = self
            .marks
            .fetch_or(EntryMarks::CONDEMNED.bits(), Ordering::AcqRel);
        if prev & EntryMarks::CONDEMNED.bits() != 0 {
            return false;
        }

        for ill in self.ills() {
            ill.ire_cnt_decr();
        }
        true
    }

    /// The mask of the route this cache entry was resolved against.
    pub fn cmask(&self) -> Ipv4PrefixLen {
        self.cmask
    }

    pub fn nce(&self) -> Option<&Arc<NeighborEntry>> {
        self.nce.as_ref()
    }

    pub fn stq(&self) -> Option<&Arc<Ill>> {
        self.stq.as_ref()
    }

    pub fn ipif(&self) -> Option<&Arc<Ill>> {
        self.ipif.as_ref()
    }

    pub fn in_ill(&self) -> Option<&Arc<Ill>> {
        self.in_ill.as_ref()
    }

    /// The interface owning the source address, or failing that the
    /// outbound interface.
    pub fn src_ill(&self) -> Option<&Arc<Ill>> {
        self.ipif.as_ref().or(self.stq.as_ref())
    }

    /// Every distinct interface this entry references, ordered by
    /// address. This is the order interface locks are taken in.
    pub(crate) fn ills(&self) -> Vec<&Arc<Ill>> {
        [&self.stq, &self.ipif, &self.in_ill]
            .into_iter()
            .flatten()
            .sorted_by_key(|ill| Arc::as_ptr(ill))
            .dedup_by(|a, b| Arc::ptr_eq(a, b))
            .collect()
    }

    pub fn references_ill(&self, ill: &Arc<Ill>) -> bool {
        self.ills().into_iter().any(|i| Arc::ptr_eq(i, ill))
    }

    pub fn resolver_template(&self) -> Option<&[u8]> {
        self.resolver_template.as_deref()
    }

    pub fn label(&self) -> Option<&SecLabel> {
        self.label.as_ref()
    }

    pub fn parent_handle(&self) -> u32 {
        self.parent_handle.load(Ordering::Relaxed)
    }

    pub fn interface_handle(&self) -> u32 {
        self.interface_handle.load(Ordering::Relaxed)
    }

    pub(crate) fn set_parent_handle(&self, handle: u32) {
        self.parent_handle.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn set_interface_handle(&self, handle: u32) {
        self.interface_handle.store(handle, Ordering::Relaxed);
    }

    pub fn allow_unresolved(&self) -> bool {
        self.allow_unresolved
    }

    pub fn created(&self) -> Moment {
        self.created
    }

    pub fn last_used(&self) -> Moment {
        *self.last_used.lock()
    }

    pub fn set_last_used(&self, when: Moment) {
        *self.last_used.lock() = when;
    }

    pub fn ib_pkts(&self) -> u64 {
        self.ib_pkts.load(Ordering::Relaxed)
    }

    pub fn ob_pkts(&self) -> u64 {
        self.ob_pkts.load(Ordering::Relaxed)
    }

    /// Inbound plus outbound packets.
    pub fn pkts(&self) -> u64 {
        self.ib_pkts() + self.ob_pkts()
    }

    pub fn tire_mark(&self) -> u64 {
        self.tire_mark.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tire_mark(&self, mark: u64) {
        self.tire_mark.store(mark, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> RouteMetrics {
        *self.metrics.lock()
    }

    pub fn max_frag(&self) -> u32 {
        self.metrics.lock().max_frag
    }

    pub fn set_max_frag(&self, max_frag: u32) {
        self.metrics.lock().max_frag = max_frag;
    }

    /// Fold an rtt sample into the smoothed estimate.
    pub fn update_rtt(&self, rtt: u32, rtt_sd: u32) {
        let mut metrics = self.metrics.lock();
        metrics.rtt = if metrics.rtt == 0 {
            rtt
        } else {
            (metrics.rtt.saturating_mul(7) / 8).saturating_add(rtt / 8)
        };
        metrics.rtt_sd = rtt_sd;
    }

    pub fn set_ssthresh(&self, ssthresh: u32) {
        self.metrics.lock().ssthresh = ssthresh;
    }

    /// The number of strong references, the home bucket's included.
    pub fn refcnt(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn is_linked(&self) -> bool {
        self.home.lock().is_some()
    }

    pub(crate) fn home(&self) -> Option<Home> {
        self.home.lock().clone()
    }

    pub(crate) fn set_home(&self, home: Option<Home>) {
        *self.home.lock() = home;
    }

    /// Send `pkt` out the outbound interface, using the neighbor's
    /// fast-path header when one has been built.
    pub fn transmit(&self, pkt: Vec<u8>) -> Result<(), IreError> {
        let Some(stq) = &self.stq else {
            return Err(IreError::InterfaceUnusable(format!(
                "{} has no outbound interface",
                self.dest
            )));
        };

        let hdr = self.nce.as_ref().and_then(|nce| nce.fp_hdr());
        stq.transmit(hdr.as_deref(), pkt)?;
        self.ob_pkts.fetch_add(1, Ordering::Relaxed);
        self.set_last_used(Moment::now());
        Ok(())
    }

    pub fn record_inbound(&self) {
        self.ib_pkts.fetch_add(1, Ordering::Relaxed);
        self.set_last_used(Moment::now());
    }
}
