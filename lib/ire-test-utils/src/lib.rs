// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

// Let's make our lives easier and pub use a bunch of stuff.
pub use ire::api::EngineCfg;
pub use ire::api::EntryKind;
pub use ire::api::EntryKindSet;
pub use ire::api::EntryMarks;
pub use ire::api::ExpireFlags;
pub use ire::api::InterfaceId;
pub use ire::api::IreError;
pub use ire::api::Ipv4Addr;
pub use ire::api::Ipv4Cidr;
pub use ire::api::MultirtPolicy;
pub use ire::api::NeighborState;
pub use ire::api::ReclaimFractions;
pub use ire::api::Resolution;
pub use ire::api::RouteFlags;
pub use ire::api::TableKind;
pub use ire::api::ZoneId;
pub use ire::engine::RoutingEngine;
pub use ire::engine::ill::Ill;
pub use ire::engine::ill::Transmit;
pub use ire::engine::ire::EntryArgs;
pub use ire::engine::ire::EntryRef;
pub use ire::engine::lifecycle::FlushReason;
pub use ire::engine::matcher::MatchCriteria;
pub use ire::provider::Providers;
use std::sync::Arc;
use std::sync::Mutex;

/// The link address every test neighbor resolves to.
pub const NEIGHBOR_MAC: [u8; 6] = [0xa8, 0x40, 0x25, 0x00, 0x00, 0x01];

/// The resolver template carried by test interface routes.
pub const IFACE_TEMPLATE: [u8; 6] = [0xff; 6];

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn cidr(s: &str) -> Ipv4Cidr {
    s.parse().unwrap()
}

/// A small engine: 16 cache buckets and no idle grace period.
pub fn test_cfg() -> EngineCfg {
    EngineCfg {
        cache_table_size: 16,
        max_cache_table_size: 16,
        mem_avail: 0,
        idle_cutoff_ms: 0,
        ..Default::default()
    }
}

pub fn engine() -> Arc<RoutingEngine> {
    engine_with(test_cfg())
}

pub fn engine_with(cfg: EngineCfg) -> Arc<RoutingEngine> {
    RoutingEngine::new(cfg, Providers::println()).unwrap()
}

/// Every packet handed to a test interface.
#[derive(Clone, Default)]
pub struct Capture {
    pkts: Arc<Mutex<Vec<(Option<Vec<u8>>, Vec<u8>)>>>,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.pkts.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<(Option<Vec<u8>>, Vec<u8>)> {
        self.pkts.lock().unwrap().last().cloned()
    }
}

impl Transmit for Capture {
    fn tx(&self, hdr: Option<&[u8]>, pkt: Vec<u8>) {
        self.pkts.lock().unwrap().push((hdr.map(|h| h.to_vec()), pkt));
    }
}

pub fn ill(name: &str, id: u32) -> Arc<Ill> {
    ill_capture(name, id).0
}

pub fn ill_capture(name: &str, id: u32) -> (Arc<Ill>, Capture) {
    let cap = Capture::default();
    let ill = Ill::new(name, InterfaceId(id), 1500)
        .with_hw_addr([0x02, 0x08, 0x20, 0x00, 0x00, id as u8])
        .with_transmit(Box::new(cap.clone()));
    (Arc::new(ill), cap)
}

/// Add an interface route for `prefix` out `ill`.
pub fn add_iface(
    engine: &Arc<RoutingEngine>,
    ill: &Arc<Ill>,
    prefix: &str,
) -> EntryRef {
    let args =
        EntryArgs::new(EntryKind::Interface(Resolution::Resolver), cidr(prefix))
            .stq(ill)
            .ipif(ill)
            .template(IFACE_TEMPLATE.to_vec());
    engine.add(engine.create(args).unwrap(), None).unwrap()
}

/// Add an off-link route of `kind` for `dest` via `gw`.
pub fn add_route(
    engine: &Arc<RoutingEngine>,
    kind: EntryKind,
    dest: &str,
    gw: &str,
) -> EntryRef {
    add_route_flags(engine, kind, dest, gw, RouteFlags::empty())
}

pub fn add_route_flags(
    engine: &Arc<RoutingEngine>,
    kind: EntryKind,
    dest: &str,
    gw: &str,
    flags: RouteFlags,
) -> EntryRef {
    let args = EntryArgs::new(kind, cidr(dest)).gateway(ip(gw)).flags(
        RouteFlags::UP | RouteFlags::GATEWAY | flags,
    );
    engine.add(engine.create(args).unwrap(), None).unwrap()
}

/// The arguments of a resolved cache entry for `dest` out `ill`,
/// derived from `route` and optionally reached via `gw`.
pub fn cache_args(
    ill: &Arc<Ill>,
    dest: &str,
    gw: Option<&str>,
    route: &EntryRef,
) -> EntryArgs {
    let mut args = EntryArgs::new(EntryKind::Cache, cidr(dest))
        .stq(ill)
        .ipif(ill)
        .template(NEIGHBOR_MAC.to_vec())
        .cache_via(route, None);
    if let Some(gw) = gw {
        args = args.gateway(ip(gw));
    }
    args
}

pub fn add_cache(
    engine: &Arc<RoutingEngine>,
    ill: &Arc<Ill>,
    dest: &str,
    gw: Option<&str>,
    route: &EntryRef,
) -> EntryRef {
    let args = cache_args(ill, dest, gw, route);
    engine.add(engine.create(args).unwrap(), None).unwrap()
}

/// The number of live entries for exactly `dest`, across both tables.
pub fn count_dest(engine: &RoutingEngine, dest: &str) -> usize {
    let dest = cidr(dest);
    let mut n = 0;
    engine.walk_all(|e| e.dest() == dest, |_| n += 1);
    n
}
