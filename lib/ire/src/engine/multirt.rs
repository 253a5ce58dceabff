// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Multirouting: several routes to one destination, each of which is
//! resolved into its own cache entry so that traffic can be copied
//! down all of them.
//!
//! A route is *resolved* when a multirouted cache entry derived from
//! it exists. The selection below picks an unresolved route whose
//! gateway can be reached, throttling retries of any one route by the
//! multirouting resolution interval. A route's last-used time doubles
//! as its last resolution attempt.
use super::RoutingEngine;
use super::ire::EntryRef;
use super::ire::RouteEntry;
use super::matcher::MatchCriteria;
use crate::api::EntryKind;
use crate::api::EntryKindSet;
use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::MultirtPolicy;
use crate::api::RouteFlags;
use crate::api::SecLabel;
use crate::api::TableKind;
use crate::api::ZoneId;
use crate::ddi::time::Moment;
use alloc::vec::Vec;

fn is_multirt(e: &RouteEntry) -> bool {
    e.flags().contains(RouteFlags::MULTIRT)
}

impl RoutingEngine {
    /// Pick an unresolved multirouted route to `dst` together with
    /// the entry its gateway resolves through.
    ///
    /// Unicast candidates are the multirouted host routes for `dst`.
    /// Multicast candidates are the multirouted routes of the most
    /// specific prefix covering `dst`, and their gateways must be
    /// directly reachable through an interface route.
    pub fn find_resolvable_alternate(
        &self,
        dst: Ipv4Addr,
        policy: MultirtPolicy,
        label: Option<&SecLabel>,
    ) -> Option<(EntryRef, EntryRef)> {
        let cached = self.multirt_cached(dst);
        let m = self.matcher();

        if dst.is_multicast() {
            let crit = MatchCriteria::new()
                .kinds(EntryKindSet::OFFSUBNET)
                .label(label.cloned());
            let cands = self
                .ftable
                .covering(dst, None)
                .into_iter()
                .map(|bucket| {
                    bucket
                        .walk(self)
                        .filter(|e| is_multirt(e) && m.matches(e, dst, &crit))
                        .collect::<Vec<_>>()
                })
                .find(|cands| !cands.is_empty())?;

            let iface = MatchCriteria::new()
                .kinds(EntryKindSet::INTERFACE)
                .label(label.cloned());
            self.select_alternate(
                cands,
                policy,
                |fire| {
                    let handle = fire.parent_handle();
                    cached.iter().any(|c| c.parent_handle() == handle)
                },
                |gw| self.lpm(gw, &iface, false),
            )
        } else {
            let crit = MatchCriteria::new()
                .kinds(EntryKindSet::HOST)
                .label(label.cloned());
            let bucket = self.ftable.get(Ipv4Cidr::host(dst))?;
            let cands: Vec<EntryRef> = bucket
                .walk(self)
                .filter(|e| is_multirt(e) && m.matches_attrs(e, &crit))
                .collect();

            self.select_alternate(
                cands,
                policy,
                |fire| {
                    cached.iter().any(|c| {
                        c.gateway().is_some() && c.gateway() == fire.gateway()
                    })
                },
                |gw| self.route_quiet(gw, ZoneId::ALL, label),
            )
        }
    }

    fn select_alternate(
        &self,
        cands: Vec<EntryRef>,
        policy: MultirtPolicy,
        resolved: impl Fn(&RouteEntry) -> bool,
        gw_lookup: impl Fn(Ipv4Addr) -> Option<EntryRef>,
    ) -> Option<(EntryRef, EntryRef)> {
        let now = Moment::now();
        let interval = self.cfg.multirt_resolution_interval_ms;
        let cachegw = policy.contains(MultirtPolicy::CACHEGW);
        let mut best: Option<(EntryRef, EntryRef)> = None;

        for fire in cands {
            if resolved(&fire) {
                continue;
            }
            let Some(gw) = fire.gateway() else {
                continue;
            };
            let gw_ire = gw_lookup(gw);

            // A cached gateway beats anything else.
            if cachegw {
                if let Some(g) = &gw_ire {
                    if g.table() == TableKind::Cache {
                        best = Some((fire, g.clone()));
                        break;
                    }
                }
            }

            let due = !policy.contains(MultirtPolicy::USESTAMP)
                || now.delta_as_millis(fire.last_used()) > interval;
            if !due {
                continue;
            }

            match gw_ire {
                Some(g) => {
                    if best.is_none() {
                        best = Some((fire, g));
                    }
                    if !cachegw {
                        break;
                    }
                }

                None => {
                    if policy.contains(MultirtPolicy::SETSTAMP) {
                        fire.set_last_used(now);
                    }
                }
            }
        }

        if let Some((fire, _)) = &best {
            if policy.contains(MultirtPolicy::USESTAMP) {
                fire.set_last_used(now);
            }
        }
        best
    }

    // Multirouted cache entries for `dst`.
    fn multirt_cached(&self, dst: Ipv4Addr) -> Vec<EntryRef> {
        self.ctable
            .bucket(dst)
            .walk(self)
            .filter(|e| {
                e.kind() == EntryKind::Cache
                    && e.dest().ip() == dst
                    && is_multirt(e)
                    && !e.is_hidden()
            })
            .collect()
    }

    /// Should the caller try to resolve another route to `dst`?
    ///
    /// True when there is no multirouted host route or no cache entry
    /// for `dst`. Otherwise true only if some declared route is still
    /// unresolved and one of those can be resolved now.
    pub fn multirt_need_resolve(
        &self,
        dst: Ipv4Addr,
        label: Option<&SecLabel>,
    ) -> bool {
        let routes = self
            .ftable
            .get(Ipv4Cidr::host(dst))
            .map(|bucket| {
                bucket
                    .walk(self)
                    .filter(|e| e.kind() == EntryKind::Host && is_multirt(e))
                    .count()
            })
            .unwrap_or(0);
        if routes == 0 {
            return true;
        }

        let any_cache =
            self.find_cache(dst, ZoneId::ALL, label, EntryKindSet::CACHE);
        if any_cache.is_none() {
            return true;
        }

        let resolved = self.multirt_cached(dst).len();
        if routes <= resolved {
            return false;
        }

        let policy = MultirtPolicy::USESTAMP | MultirtPolicy::CACHEGW;
        self.find_resolvable_alternate(dst, policy, label).is_some()
    }
}
