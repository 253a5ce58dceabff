// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Creating, adding and deleting entries, and the cache flushes that
//! follow forwarding-table changes.

use ire_test_utils as common;

use common::*;
use std::sync::Arc;
use std::sync::Mutex;

type Outcome = Arc<Mutex<Option<Result<EntryRef, IreError>>>>;

fn completion() -> (Outcome, ire::engine::lifecycle::AddDone) {
    let out: Outcome = Arc::new(Mutex::new(None));
    let out2 = out.clone();
    (out, Box::new(move |res| *out2.lock().unwrap() = Some(res)))
}

#[test]
fn create_validates() {
    let engine = engine();
    let net0 = ill("net0", 1);

    let bad = [
        EntryArgs::new(EntryKind::Default, cidr("10.0.0.0/8"))
            .gateway(ip("10.0.0.1")),
        EntryArgs::new(EntryKind::Host, cidr("10.0.0.0/24"))
            .gateway(ip("10.0.0.1")),
        EntryArgs::new(EntryKind::Prefix, cidr("10.0.0.0/8")),
        EntryArgs::new(
            EntryKind::Interface(Resolution::Resolver),
            cidr("10.0.0.0/24"),
        )
        .stq(&net0),
        EntryArgs::new(EntryKind::Cache, cidr("10.0.0.5/32")),
        EntryArgs::new(EntryKind::Cache, cidr("10.0.0.0/24")).stq(&net0),
        EntryArgs::new(EntryKind::Local, cidr("10.0.0.5/32")).label(
            ire::api::SecLabel { doi: 1, level: 0, compartments: vec![] },
        ),
    ];
    for args in bad {
        let res = engine.create(args);
        assert!(matches!(res, Err(IreError::InvalidConfig(_))), "{res:?}");
    }

    // A reject route needs no gateway.
    let args = EntryArgs::new(EntryKind::Prefix, cidr("10.0.0.0/8"))
        .flags(RouteFlags::UP | RouteFlags::REJECT);
    assert!(engine.create(args).is_ok());
    assert_eq!(engine.stats().alloced, 1);
}

#[test]
fn add_assigns_handles_and_counts() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let route =
        add_route(&engine, EntryKind::Prefix, "10.9.0.0/16", "10.0.0.1");

    assert_ne!(iface.interface_handle(), 0);
    assert_eq!(iface.parent_handle(), 0);
    assert_ne!(route.parent_handle(), 0);
    assert_ne!(route.parent_handle(), iface.interface_handle());
    assert!(iface.is_linked());
    assert_eq!(net0.ire_cnt(), 1);

    let cache = add_cache(&engine, &net0, "10.9.1.1", Some("10.0.0.1"), &route);
    assert_eq!(cache.parent_handle(), route.parent_handle());
    assert_eq!(cache.cmask(), cidr("10.9.0.0/16").prefix());
    assert_eq!(cache.max_frag(), 1500);
    assert_eq!(net0.ire_cnt(), 2);

    engine.delete(cache.clone());
    assert!(cache.is_condemned());
    assert!(!cache.is_linked());
    assert_eq!(net0.ire_cnt(), 1);

    // Deleting twice is harmless.
    engine.delete(cache.clone());
    assert_eq!(engine.stats().deleted, 1);
}

#[test]
fn removing_default_route_flushes_derived_cache() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    let cache =
        add_cache(&engine, &net0, "8.8.8.8", Some("10.0.0.1"), &dflt);
    drop(cache);

    let hit = engine.lookup_cache(ip("8.8.8.8"), ZoneId::GLOBAL, None);
    assert_eq!(hit.unwrap().parent_handle(), dflt.parent_handle());

    engine.delete(dflt);
    assert!(engine.lookup_cache(ip("8.8.8.8"), ZoneId::GLOBAL, None).is_none());
    assert_eq!(count_dest(&engine, "8.8.8.8/32"), 0);
    assert_eq!(engine.stats().flushed, 1);
}

#[test]
fn more_specific_route_flushes_covered_cache() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let wide =
        add_route(&engine, EntryKind::Prefix, "192.168.0.0/16", "10.0.0.1");
    add_cache(&engine, &net0, "192.168.1.5", Some("10.0.0.1"), &wide);
    add_cache(&engine, &net0, "192.168.9.9", Some("10.0.0.1"), &wide);

    let narrow =
        add_route(&engine, EntryKind::Prefix, "192.168.1.0/24", "10.0.0.2");
    assert_eq!(count_dest(&engine, "192.168.1.5/32"), 0);
    assert_eq!(count_dest(&engine, "192.168.9.9/32"), 1);

    // A cache entry derived from the /24 is as specific as it.
    add_cache(&engine, &net0, "192.168.1.6", Some("10.0.0.2"), &narrow);
    let n = engine.flush_affected_cache_entries(&narrow, FlushReason::Added);
    assert_eq!(n, 0);
}

#[test]
fn equally_specific_route_keeps_cache() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let first =
        add_route(&engine, EntryKind::Prefix, "192.168.0.0/16", "10.0.0.1");
    add_cache(&engine, &net0, "192.168.1.5", Some("10.0.0.1"), &first);

    add_route(&engine, EntryKind::Prefix, "192.168.0.0/16", "10.0.0.2");
    assert_eq!(count_dest(&engine, "192.168.0.0/16"), 2);
    assert_eq!(count_dest(&engine, "192.168.1.5/32"), 1);
}

#[test]
fn new_route_covering_a_gateway_flushes() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    add_cache(&engine, &net0, "8.8.8.8", Some("172.16.0.1"), &dflt);

    add_route(&engine, EntryKind::Host, "172.16.0.1/32", "10.0.0.3");
    assert_eq!(count_dest(&engine, "8.8.8.8/32"), 0);
}

#[test]
fn removing_interface_route_flushes_onlink_cache() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    add_cache(&engine, &net0, "10.0.0.7", None, &iface);
    add_cache(&engine, &net0, "10.0.0.8", None, &iface);

    engine.delete(iface);
    assert_eq!(count_dest(&engine, "10.0.0.7/32"), 0);
    assert_eq!(count_dest(&engine, "10.0.0.8/32"), 0);
    assert_eq!(engine.stats().flushed, 2);
    assert_eq!(net0.ire_cnt(), 0);
}

#[test]
fn default_route_removal_drops_redirects() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    add_route_flags(
        &engine,
        EntryKind::Host,
        "198.51.100.7/32",
        "10.0.0.1",
        RouteFlags::DYNAMIC,
    );
    add_route(&engine, EntryKind::Host, "198.51.100.8/32", "10.0.0.1");

    engine.delete(dflt);
    assert_eq!(count_dest(&engine, "198.51.100.7/32"), 0);
    assert_eq!(count_dest(&engine, "198.51.100.8/32"), 1);
}

#[test]
fn empty_forwarding_buckets_are_freed() {
    let engine = engine();
    let route =
        add_route(&engine, EntryKind::Prefix, "10.9.0.0/16", "10.0.0.1");
    assert_eq!(engine.fwd_buckets(), 1);
    engine.delete(route);
    assert_eq!(engine.fwd_buckets(), 0);
    assert!(engine.fwd_bucket(cidr("10.9.0.0/16")).is_none());

    add_route(&engine, EntryKind::Prefix, "10.9.0.0/16", "10.0.0.1");
    assert_eq!(engine.fwd_buckets(), 1);
}

#[test]
fn add_waits_for_changing_interface() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");

    net0.set_changing(true);
    let (out, done) = completion();
    let entry = engine.create(cache_args(&net0, "10.0.0.7", None, &iface));
    let res = engine.add(entry.unwrap(), Some(done));
    assert_eq!(res.unwrap_err(), IreError::Deferred);
    assert_eq!(net0.pending_retries(), 1);
    assert!(out.lock().unwrap().is_none());
    assert_eq!(count_dest(&engine, "10.0.0.7/32"), 0);

    net0.set_changing(false);
    let linked = out.lock().unwrap().take().unwrap().unwrap();
    assert!(linked.is_linked());
    assert_eq!(count_dest(&engine, "10.0.0.7/32"), 1);
    assert_eq!(engine.stats().deferred, 1);
}

#[test]
fn deferred_add_fails_if_interface_is_condemned() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");

    net0.set_changing(true);
    let (out, done) = completion();
    let entry = engine.create(cache_args(&net0, "10.0.0.7", None, &iface));
    engine.add(entry.unwrap(), Some(done)).unwrap_err();

    net0.condemn();
    net0.set_changing(false);
    let res = out.lock().unwrap().take().unwrap();
    assert!(matches!(res, Err(IreError::InterfaceUnusable(_))));
    assert_eq!(count_dest(&engine, "10.0.0.7/32"), 0);
}

#[test]
fn deferred_add_outliving_the_engine() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");

    net0.set_changing(true);
    let (out, done) = completion();
    let entry = engine.create(cache_args(&net0, "10.0.0.7", None, &iface));
    engine.add(entry.unwrap(), Some(done)).unwrap_err();
    drop(iface);
    drop(engine);

    net0.set_changing(false);
    let res = out.lock().unwrap().take().unwrap();
    assert!(matches!(res, Err(IreError::InterfaceUnusable(_))));
}

#[test]
fn offline_interface_only_takes_hidden_entries() {
    let engine = engine();
    let net0 = ill("net0", 1);
    net0.set_offline(true);

    let args = EntryArgs::new(
        EntryKind::Interface(Resolution::Resolver),
        cidr("10.0.0.0/24"),
    )
    .stq(&net0)
    .template(IFACE_TEMPLATE.to_vec());
    let res = engine.add(engine.create(args.clone()).unwrap(), None);
    assert!(matches!(res, Err(IreError::InterfaceUnusable(_))));

    let args = args.marks(EntryMarks::HIDDEN);
    assert!(engine.add(engine.create(args).unwrap(), None).is_ok());
}

#[test]
fn offline_source_interface_takes_local_entries() {
    let engine = engine();
    let net0 = ill("net0", 1);
    net0.set_offline(true);

    let args =
        EntryArgs::new(EntryKind::Local, cidr("10.0.0.5/32")).ipif(&net0);
    let local = engine.add(engine.create(args).unwrap(), None).unwrap();
    assert!(!local.is_hidden());
    assert!(local.is_linked());
    assert_eq!(net0.ire_cnt(), 1);
}

#[test]
fn unresolved_cache_entries() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let unresolved = |addr: &str| {
        EntryArgs::new(EntryKind::Cache, cidr(addr))
            .stq(&net0)
            .cache_via(&iface, None)
    };

    let args = unresolved("10.0.0.7").allow_unresolved(false);
    let res = engine.add(engine.create(args).unwrap(), None);
    let want = IreError::UnresolvedNotAllowed(ip("10.0.0.7"));
    assert_eq!(res.unwrap_err(), want);

    let entry = engine
        .add(engine.create(unresolved("10.0.0.7")).unwrap(), None)
        .unwrap();
    let nce = entry.nce().unwrap().clone();
    assert_eq!(nce.state(), NeighborState::Initial);
    assert!(!nce.has_fp_hdr());

    // Resolution builds the fast-path header.
    nce.set_reachable(&NEIGHBOR_MAC);
    assert!(nce.has_fp_hdr());
    assert_eq!(engine.stats().fastpath_probes, 1);

    nce.set_failed();
    let res = engine.add(engine.create(unresolved("10.0.0.7")).unwrap(), None);
    let want = IreError::UnresolvedNotAllowed(ip("10.0.0.7"));
    assert_eq!(res.unwrap_err(), want);
}

#[test]
fn transmit_uses_fastpath_header() {
    let engine = engine();
    let (net0, cap) = ill_capture("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let cache = add_cache(&engine, &net0, "10.0.0.7", None, &iface);

    cache.transmit(vec![0x45, 0, 0, 20]).unwrap();
    assert_eq!(cap.len(), 1);
    let (hdr, pkt) = cap.last().unwrap();
    let hdr = hdr.unwrap();
    assert_eq!(hdr.len(), 14);
    assert_eq!(&hdr[..6], &NEIGHBOR_MAC);
    assert_eq!(&hdr[12..], &[0x08, 0x00]);
    assert_eq!(pkt, vec![0x45, 0, 0, 20]);
    assert_eq!(cache.ob_pkts(), 1);
}

#[test]
fn delete_helpers() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let net1 = ill("net1", 2);
    let iface0 = add_iface(&engine, &net0, "10.0.0.0/24");
    let iface1 = add_iface(&engine, &net1, "10.1.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    add_cache(&engine, &net0, "8.8.8.8", Some("10.0.0.1"), &dflt);
    add_cache(&engine, &net0, "8.8.4.4", Some("10.0.0.1"), &dflt);
    add_cache(&engine, &net0, "10.0.0.1", None, &iface0);
    add_cache(&engine, &net1, "10.1.0.9", None, &iface1);

    assert_eq!(engine.delete_cache_gw(ip("10.0.0.1"), ZoneId::ALL), 3);
    assert_eq!(count_dest(&engine, "10.1.0.9/32"), 1);

    drop(iface0);
    assert_eq!(engine.delete_by_interface(&net0), 1);
    assert_eq!(net0.ire_cnt(), 0);
    assert_eq!(net1.ire_cnt(), 2);

    let res =
        engine.delete_matching(cidr("10.0.0.0/24"), &MatchCriteria::new());
    assert!(matches!(res, Err(IreError::NotFound(_))));
    let n = engine
        .delete_matching(cidr("0.0.0.0/0"), &MatchCriteria::new())
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn broadcast_entries_chain() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let net1 = ill("net1", 2);
    let bcast = |ill: &Arc<Ill>| {
        let args = EntryArgs::new(EntryKind::Broadcast, cidr("10.0.0.255/32"))
            .stq(ill)
            .template(vec![0xff; 6]);
        engine.add(engine.create(args).unwrap(), None).unwrap()
    };
    let b0 = bcast(&net0);
    let b1 = bcast(&net1);
    add_iface(&engine, &net0, "10.0.0.0/24");

    let next = engine.next_broadcast(&b0).unwrap();
    assert!(Arc::ptr_eq(&next, &b1));
    assert!(engine.next_broadcast(&b1).is_none());
}

#[test]
fn freed_entries_are_counted() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    for i in 1..=5 {
        let addr = format!("10.0.0.{i}");
        add_cache(&engine, &net0, &addr, None, &iface);
    }
    engine.delete(iface);

    let stats = engine.stats();
    assert_eq!(stats.alloced, 6);
    assert_eq!(stats.inserted, 6);
    assert_eq!(stats.deleted, 6);
    assert_eq!(stats.freed, 6);
}
