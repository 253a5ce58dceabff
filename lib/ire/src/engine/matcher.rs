// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Entry matching.
//!
//! A [`MatchCriteria`] is a set of optional constraints combined with
//! AND; an absent constraint matches anything. The same predicate
//! drives lookups, walks and maintenance passes.
use super::ire::RouteEntry;
use crate::api::EntryKindSet;
use crate::api::EntryMarks;
use crate::api::GroupId;
use crate::api::InterfaceId;
use crate::api::Ipv4Addr;
use crate::api::Ipv4PrefixLen;
use crate::api::SecLabel;
use crate::api::ZoneId;
use crate::provider::LabelPolicy;

#[derive(Clone, Debug, Default)]
pub struct MatchCriteria {
    pub mask: Option<Ipv4PrefixLen>,
    pub kinds: Option<EntryKindSet>,
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<InterfaceId>,
    pub interface_group: Option<GroupId>,
    pub zone: Option<ZoneId>,
    pub require_zone_exact: bool,
    pub include_hidden: bool,
    pub include_private_addr: bool,
    pub security_label: Option<SecLabel>,
    pub interface_handle: Option<u32>,
    pub parent_handle: Option<u32>,
    pub src: Option<Ipv4Addr>,
    /// Forwarding lookups only: require the gateway chain of an
    /// off-link result to end at an interface route.
    pub recursive: bool,
}

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(mut self, mask: Ipv4PrefixLen) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn kinds(mut self, kinds: EntryKindSet) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn gateway(mut self, gw: Ipv4Addr) -> Self {
        self.gateway = Some(gw);
        self
    }

    pub fn interface(mut self, id: InterfaceId) -> Self {
        self.interface = Some(id);
        self
    }

    pub fn interface_group(mut self, group: GroupId) -> Self {
        self.interface_group = Some(group);
        self
    }

    pub fn zone(mut self, zone: ZoneId) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn zone_exact(mut self, zone: ZoneId) -> Self {
        self.zone = Some(zone);
        self.require_zone_exact = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.include_hidden = true;
        self
    }

    pub fn private_addr(mut self) -> Self {
        self.include_private_addr = true;
        self
    }

    pub fn label(mut self, label: Option<SecLabel>) -> Self {
        self.security_label = label;
        self
    }

    pub fn interface_handle(mut self, handle: u32) -> Self {
        self.interface_handle = Some(handle);
        self
    }

    pub fn parent_handle(mut self, handle: u32) -> Self {
        self.parent_handle = Some(handle);
        self
    }

    pub fn src(mut self, src: Ipv4Addr) -> Self {
        self.src = Some(src);
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// Evaluates [`MatchCriteria`] against entries.
pub struct Matcher<'a> {
    labeled: bool,
    policy: &'a dyn LabelPolicy,
}

impl<'a> Matcher<'a> {
    pub fn new(labeled: bool, policy: &'a dyn LabelPolicy) -> Self {
        Self { labeled, policy }
    }

    /// Does `entry` cover `addr` and satisfy `crit`?
    ///
    /// Condemned entries never match.
    pub fn matches(
        &self,
        entry: &RouteEntry,
        addr: Ipv4Addr,
        crit: &MatchCriteria,
    ) -> bool {
        let dest = entry.dest();
        if !dest.is_member(addr) {
            return false;
        }

        if let Some(mask) = crit.mask {
            if dest.prefix() != mask {
                return false;
            }
        }

        self.matches_attrs(entry, crit)
    }

    /// Like [`Matcher::matches`], ignoring the destination.
    pub fn matches_attrs(
        &self,
        entry: &RouteEntry,
        crit: &MatchCriteria,
    ) -> bool {
        let marks = entry.marks();
        if marks.contains(EntryMarks::CONDEMNED) {
            return false;
        }
        if marks.contains(EntryMarks::HIDDEN) && !crit.include_hidden {
            return false;
        }
        if marks.contains(EntryMarks::PRIVATE_ADDR)
            && !crit.include_private_addr
        {
            return false;
        }

        if let Some(kinds) = crit.kinds {
            if !kinds.contains(entry.kind().bit()) {
                return false;
            }
        }

        if let Some(gw) = crit.gateway {
            if entry.gateway() != Some(gw) {
                return false;
            }
        }

        if let Some(id) = crit.interface {
            if entry.stq().map(|ill| ill.id()) != Some(id) {
                return false;
            }
        }

        if let Some(group) = crit.interface_group {
            if entry.stq().and_then(|ill| ill.group()) != Some(group) {
                return false;
            }
        }

        if let Some(handle) = crit.interface_handle {
            if entry.interface_handle() != handle {
                return false;
            }
        }

        if let Some(handle) = crit.parent_handle {
            if entry.parent_handle() != handle {
                return false;
            }
        }

        if let Some(src) = crit.src {
            if entry.src_addr() != Some(src) {
                return false;
            }
        }

        if let Some(zone) = crit.zone {
            if !self.zone_ok(entry, zone, crit.require_zone_exact) {
                return false;
            }
        }

        self.label_ok(entry, crit.security_label.as_ref())
    }

    /// Zone policy. A lookup from all zones, or an entry shared by all
    /// zones, always passes. Otherwise the zones must agree, except
    /// that an interface entry also serves any zone its interface
    /// offers a usable source address to.
    fn zone_ok(&self, entry: &RouteEntry, zone: ZoneId, exact: bool) -> bool {
        if zone.is_all() || entry.zone() == zone {
            return true;
        }
        if exact {
            return false;
        }
        if entry.zone().is_all() {
            return true;
        }

        entry.kind().is_interface()
            && entry.src_ill().is_some_and(|ill| ill.has_usable_src(zone))
    }

    fn label_ok(&self, entry: &RouteEntry, want: Option<&SecLabel>) -> bool {
        if !self.labeled {
            return true;
        }

        match (entry.label(), want) {
            (Some(have), Some(want)) => self.policy.matches(have, want),
            _ => true,
        }
    }
}
