// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Neighbor bindings: link-layer resolution state for a next hop.
//!
//! A binding is shared by every resolvable entry using the same
//! (interface, next hop) pair. The [`NeighborTable`] only holds weak
//! references, so a binding lives exactly as long as the entries that
//! use it.
use super::ill::Ill;
use crate::api::InterfaceId;
use crate::api::Ipv4Addr;
use crate::api::NeighborState;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;

/// Called after every state transition of a binding, outside the
/// binding lock.
pub type StateListener =
    Arc<dyn Fn(&NeighborEntry, NeighborState) + Send + Sync>;

struct NceInner {
    state: NeighborState,
    condemned: bool,
    res_template: Option<Vec<u8>>,
    fp_hdr: Option<Vec<u8>>,
    updated: Moment,
    listeners: Vec<StateListener>,
}

pub struct NeighborEntry {
    ill_id: InterfaceId,
    ill: Weak<Ill>,
    addr: Ipv4Addr,
    inner: KMutex<NceInner>,
}

impl Debug for NeighborEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NeighborEntry")
            .field("ill", &self.ill_id)
            .field("addr", &self.addr)
            .field("state", &inner.state)
            .field("condemned", &inner.condemned)
            .finish()
    }
}

impl NeighborEntry {
    pub fn new(ill: &Arc<Ill>, addr: Ipv4Addr) -> Self {
        Self {
            ill_id: ill.id(),
            ill: Arc::downgrade(ill),
            addr,
            inner: KMutex::new(NceInner {
                state: NeighborState::Initial,
                condemned: false,
                res_template: None,
                fp_hdr: None,
                updated: Moment::now(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn ill_id(&self) -> InterfaceId {
        self.ill_id
    }

    /// The interface this binding resolves on, if it still exists.
    pub fn ill(&self) -> Option<Arc<Ill>> {
        self.ill.upgrade()
    }

    pub fn state(&self) -> NeighborState {
        self.inner.lock().state
    }

    pub fn is_reachable(&self) -> bool {
        self.state() == NeighborState::Reachable
    }

    pub fn is_condemned(&self) -> bool {
        self.inner.lock().condemned
    }

    pub fn condemn(&self) {
        self.inner.lock().condemned = true;
    }

    pub fn res_template(&self) -> Option<Vec<u8>> {
        self.inner.lock().res_template.clone()
    }

    pub fn fp_hdr(&self) -> Option<Vec<u8>> {
        self.inner.lock().fp_hdr.clone()
    }

    pub fn has_fp_hdr(&self) -> bool {
        self.inner.lock().fp_hdr.is_some()
    }

    pub fn set_fp_hdr(&self, hdr: Vec<u8>) {
        self.inner.lock().fp_hdr = Some(hdr);
    }

    /// Milliseconds since the last state transition.
    pub fn age_ms(&self, now: Moment) -> u64 {
        now.delta_as_millis(self.inner.lock().updated)
    }

    pub fn subscribe(&self, listener: StateListener) {
        self.inner.lock().listeners.push(listener);
    }

    /// Resolution finished: `link_addr` is the neighbor's link
    /// address. Any cached fast-path header is discarded.
    pub fn set_reachable(&self, link_addr: &[u8]) {
        self.transition(NeighborState::Reachable, Some(link_addr.to_vec()));
    }

    pub fn set_failed(&self) {
        self.transition(NeighborState::Failed, None);
    }

    fn transition(&self, state: NeighborState, template: Option<Vec<u8>>) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.state = state;
            inner.res_template = template;
            inner.fp_hdr = None;
            inner.updated = Moment::now();
            inner.listeners.clone()
        };

        for listener in listeners {
            listener(self, state);
        }
    }
}

/// The bindings in use, keyed by interface and next hop.
#[derive(Default)]
pub struct NeighborTable {
    map: KMutex<BTreeMap<(InterfaceId, Ipv4Addr), Weak<NeighborEntry>>>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(
        &self,
        ill: InterfaceId,
        addr: Ipv4Addr,
    ) -> Option<Arc<NeighborEntry>> {
        self.map.lock().get(&(ill, addr)).and_then(Weak::upgrade)
    }

    /// Find the binding for `addr` on `ill`, creating it in the
    /// `Initial` state if there is none. The flag is true when the
    /// binding was created by this call.
    pub fn lookup_or_create(
        &self,
        ill: &Arc<Ill>,
        addr: Ipv4Addr,
    ) -> (Arc<NeighborEntry>, bool) {
        let mut map = self.map.lock();
        let key = (ill.id(), addr);
        if let Some(nce) = map.get(&key).and_then(Weak::upgrade) {
            return (nce, false);
        }

        let nce = Arc::new(NeighborEntry::new(ill, addr));
        map.insert(key, Arc::downgrade(&nce));
        (nce, true)
    }

    /// The number of live bindings.
    pub fn len(&self) -> usize {
        self.map.lock().values().filter(|nce| nce.strong_count() > 0).count()
    }

    /// Forget the keys of bindings nothing holds any longer. Returns the
    /// number of keys removed.
    pub fn prune(&self) -> usize {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|_, nce| nce.strong_count() > 0);
        before - map.len()
    }
}
