// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Interfaces.
//!
//! An [`Ill`] is the outbound side of a physical or logical link: the
//! thing a resolved entry transmits through. The engine never creates
//! or destroys interfaces; it only references them from entries, reads
//! their state under the interface lock during an add, and parks adds
//! on them while they reconfigure.
use super::nce::NeighborEntry;
use crate::api::GroupId;
use crate::api::InterfaceId;
use crate::api::IreError;
use crate::api::ZoneId;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use crate::ddi::sync::KRwLock;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Debug;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IllFlags: u32 {
        /// Reconfiguration in progress; adds are parked until it
        /// clears.
        const CHANGING  = 0x1;
        /// Administratively down. Only hidden entries may be added.
        const OFFLINE   = 0x2;
        /// Being unplumbed. Nothing may be added.
        const CONDEMNED = 0x4;
    }
}

/// The Ethernet type for IPv4, used when building fast-path headers.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// A parked operation, run once the interface stops changing.
pub type Retry = Box<dyn FnOnce() + Send>;

/// The packet-send primitive of an interface.
pub trait Transmit: Send + Sync {
    /// Send `pkt`, prefixed by `hdr` when a fast-path header is known.
    fn tx(&self, hdr: Option<&[u8]>, pkt: Vec<u8>);
}

/// The state protected by the interface lock.
pub struct IllState {
    pub flags: IllFlags,
    pub mtu: u32,
    retry: VecDeque<Retry>,
}

impl IllState {
    /// Park `op` until the interface settles.
    pub fn enqueue_retry(&mut self, op: Retry) {
        self.retry.push_back(op);
    }

    pub fn pending_retries(&self) -> usize {
        self.retry.len()
    }
}

pub struct Ill {
    name: String,
    id: InterfaceId,
    group: Option<GroupId>,
    hw_addr: [u8; 6],
    state: KMutex<IllState>,
    usesrc: KRwLock<BTreeSet<ZoneId>>,
    ire_cnt: AtomicU32,
    tx: Option<Box<dyn Transmit>>,
}

impl Debug for Ill {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ill")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("group", &self.group)
            .field("ire_cnt", &self.ire_cnt())
            .finish_non_exhaustive()
    }
}

impl Ill {
    pub fn new(name: &str, id: InterfaceId, mtu: u32) -> Self {
        let mut usesrc = BTreeSet::new();
        usesrc.insert(ZoneId::GLOBAL);

        Self {
            name: name.into(),
            id,
            group: None,
            hw_addr: [0; 6],
            state: KMutex::new(IllState {
                flags: IllFlags::empty(),
                mtu,
                retry: VecDeque::new(),
            }),
            usesrc: KRwLock::new(usesrc),
            ire_cnt: AtomicU32::new(0),
            tx: None,
        }
    }

    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_hw_addr(mut self, hw_addr: [u8; 6]) -> Self {
        self.hw_addr = hw_addr;
        self
    }

    pub fn with_transmit(mut self, tx: Box<dyn Transmit>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn hw_addr(&self) -> [u8; 6] {
        self.hw_addr
    }

    /// Take the interface lock.
    pub fn lock(&self) -> KMutexGuard<'_, IllState> {
        self.state.lock()
    }

    pub fn flags(&self) -> IllFlags {
        self.state.lock().flags
    }

    pub fn is_changing(&self) -> bool {
        self.flags().contains(IllFlags::CHANGING)
    }

    pub fn is_offline(&self) -> bool {
        self.flags().contains(IllFlags::OFFLINE)
    }

    pub fn mtu(&self) -> u32 {
        self.state.lock().mtu
    }

    pub fn set_mtu(&self, mtu: u32) {
        self.state.lock().mtu = mtu;
    }

    /// Enter or leave reconfiguration.
    ///
    /// Leaving it runs every operation parked by
    /// [`Ill::enqueue_retry`], in the order they were parked, after the
    /// interface lock is dropped.
    pub fn set_changing(&self, changing: bool) {
        let parked: Vec<Retry> = {
            let mut state = self.state.lock();
            if changing {
                state.flags.insert(IllFlags::CHANGING);
                return;
            }
            state.flags.remove(IllFlags::CHANGING);
            state.retry.drain(..).collect()
        };

        for op in parked {
            op();
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().flags.set(IllFlags::OFFLINE, offline);
    }

    pub fn condemn(&self) {
        self.state.lock().flags.insert(IllFlags::CONDEMNED);
    }

    pub fn enqueue_retry(&self, op: Retry) {
        self.state.lock().enqueue_retry(op);
    }

    pub fn pending_retries(&self) -> usize {
        self.state.lock().pending_retries()
    }

    /// The number of linked entries referencing this interface.
    pub fn ire_cnt(&self) -> u32 {
        self.ire_cnt.load(Ordering::Relaxed)
    }

    pub(crate) fn ire_cnt_incr(&self) {
        self.ire_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ire_cnt_decr(&self) {
        let prev = self.ire_cnt.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "ire_cnt underflow on {}", self.name);
    }

    /// Does this interface offer a source address usable from `zone`?
    pub fn has_usable_src(&self, zone: ZoneId) -> bool {
        zone.is_all() || self.usesrc.read().contains(&zone)
    }

    pub(crate) fn set_usable_src(&self, zone: ZoneId, usable: bool) {
        let mut zones = self.usesrc.write();
        if usable {
            zones.insert(zone);
        } else {
            zones.remove(&zone);
        }
    }

    /// Build the link-layer fast-path header for a resolved neighbor.
    ///
    /// Returns `None` until the neighbor carries a resolution
    /// template, which holds the neighbor's link address.
    pub fn fastpath_probe(&self, nce: &NeighborEntry) -> Option<Vec<u8>> {
        let template = nce.res_template()?;
        if template.len() != 6 {
            return None;
        }

        let mut hdr = Vec::with_capacity(14);
        hdr.extend_from_slice(&template);
        hdr.extend_from_slice(&self.hw_addr);
        hdr.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        Some(hdr)
    }

    /// Hand a packet to this interface's transmit sink.
    pub fn transmit(
        &self,
        hdr: Option<&[u8]>,
        pkt: Vec<u8>,
    ) -> Result<(), IreError> {
        match &self.tx {
            Some(tx) => {
                tx.tx(hdr, pkt);
                Ok(())
            }

            None => Err(IreError::InterfaceUnusable(format!(
                "{} has no transmit sink",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn retries_run_when_settled() {
        let ill = Ill::new("net0", InterfaceId(1), 1500);
        let ran = Arc::new(AtomicUsize::new(0));

        ill.set_changing(true);
        for _ in 0..3 {
            let ran = ran.clone();
            ill.enqueue_retry(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(ill.pending_retries(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        ill.set_changing(false);
        assert!(!ill.is_changing());
        assert_eq!(ill.pending_retries(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn usable_src_zones() {
        let ill = Ill::new("net0", InterfaceId(1), 1500);
        assert!(ill.has_usable_src(ZoneId::GLOBAL));
        assert!(ill.has_usable_src(ZoneId::ALL));
        assert!(!ill.has_usable_src(ZoneId(3)));
        ill.set_usable_src(ZoneId(3), true);
        assert!(ill.has_usable_src(ZoneId(3)));
    }

    #[test]
    fn no_sink() {
        let ill = Ill::new("net0", InterfaceId(1), 1500);
        assert!(matches!(
            ill.transmit(None, vec![1, 2, 3]),
            Err(IreError::InterfaceUnusable(_))
        ));
    }
}
