// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Lookups against the cache and forwarding tables.

use ire_test_utils as common;

use common::*;
use ire::api::DumpEntriesResp;
use std::sync::Arc;

fn fwd() -> MatchCriteria {
    MatchCriteria::new().kinds(EntryKindSet::FORWARDTABLE)
}

#[test]
fn longest_prefix_wins() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let wide =
        add_route(&engine, EntryKind::Prefix, "192.168.0.0/16", "10.0.0.1");
    let narrow =
        add_route(&engine, EntryKind::Prefix, "192.168.1.0/24", "10.0.0.2");

    let hit = engine.lookup_route(ip("192.168.1.5"), ZoneId::GLOBAL, None);
    assert!(Arc::ptr_eq(&hit.unwrap(), &narrow));
    let hit = engine.lookup_route(ip("192.168.2.1"), ZoneId::GLOBAL, None);
    assert!(Arc::ptr_eq(&hit.unwrap(), &wide));
    let hit = engine.lookup_route(ip("10.0.0.9"), ZoneId::GLOBAL, None);
    assert!(hit.unwrap().kind().is_interface());
    let miss = engine.lookup_route(ip("8.8.8.8"), ZoneId::GLOBAL, None);
    assert!(miss.is_none());

    // Pinning the prefix length skips the more specific route.
    let crit = fwd().mask(cidr("192.168.0.0/16").prefix());
    let hit = engine.lookup_forwarding(ip("192.168.1.5"), &crit).unwrap();
    assert!(Arc::ptr_eq(&hit, &wide));

    let stats = engine.stats();
    assert_eq!(stats.lookups_cache, 4);
    assert_eq!(stats.lookups_cache_hit, 0);
    assert_eq!(stats.lookups_fwd, 5);
    assert_eq!(stats.lookups_fwd_hit, 4);
}

#[test]
fn recursive_lookup_needs_reachable_gateway() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let far =
        add_route(&engine, EntryKind::Prefix, "172.16.0.0/12", "10.9.9.9");

    let addr = ip("172.16.4.4");
    assert!(engine.lookup_forwarding(addr, &fwd()).is_some());
    assert!(engine.lookup_forwarding(addr, &fwd().recursive()).is_none());

    // The gateway becomes reachable through the default route.
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    let hit = engine.lookup_forwarding(addr, &fwd().recursive()).unwrap();
    assert!(Arc::ptr_eq(&hit, &far));
    let hit = engine.lookup_forwarding(ip("8.8.8.8"), &fwd().recursive());
    assert!(Arc::ptr_eq(&hit.unwrap(), &dflt));

    let iface = engine.resolve_gateway(&far, ZoneId::GLOBAL, None).unwrap();
    assert!(iface.kind().is_interface());
}

#[test]
fn gateway_loops_terminate() {
    let engine = engine();
    add_route(&engine, EntryKind::Prefix, "1.0.0.0/8", "2.0.0.1");
    let b = add_route(&engine, EntryKind::Prefix, "2.0.0.0/8", "1.0.0.1");

    let hit = engine.lookup_forwarding(ip("1.2.3.4"), &fwd().recursive());
    assert!(hit.is_none());
    assert!(engine.resolve_gateway(&b, ZoneId::GLOBAL, None).is_none());
}

#[test]
fn gateway_resolves_through_cache_first() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    let gw_cache = add_cache(&engine, &net0, "10.0.0.1", None, &iface);

    let via = engine.resolve_gateway(&dflt, ZoneId::GLOBAL, None).unwrap();
    assert!(Arc::ptr_eq(&via, &gw_cache));

    let hit = engine.lookup_cache(ip("10.0.0.1"), ZoneId::GLOBAL, None);
    assert!(Arc::ptr_eq(&hit.unwrap(), &gw_cache));
    assert_eq!(engine.stats().lookups_cache_hit, 1);
}

#[test]
fn default_routes_round_robin() {
    let engine = engine();
    let net0 = ill("net0", 1);
    add_iface(&engine, &net0, "10.0.0.0/24");
    let d1 = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    let d2 = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.2");
    // Its gateway is unreachable, so it is never chosen.
    add_route(&engine, EntryKind::Default, "0.0.0.0/0", "172.16.0.1");

    let picks: Vec<EntryRef> = (0..4)
        .map(|_| engine.lookup_forwarding(ip("8.8.8.8"), &fwd()).unwrap())
        .collect();
    assert!(Arc::ptr_eq(&picks[0], &d1));
    assert!(Arc::ptr_eq(&picks[1], &d2));
    assert!(Arc::ptr_eq(&picks[2], &d1));
    assert!(Arc::ptr_eq(&picks[3], &d2));

    // Deleting the cursor's entry restarts the rotation.
    engine.delete(d2.clone());
    let pick = engine.lookup_forwarding(ip("8.8.8.8"), &fwd()).unwrap();
    assert!(Arc::ptr_eq(&pick, &d1));
}

#[test]
fn hidden_entries_need_asking_for() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let args = EntryArgs::new(
        EntryKind::Interface(Resolution::Resolver),
        cidr("10.0.0.0/24"),
    )
    .stq(&net0)
    .ipif(&net0)
    .template(IFACE_TEMPLATE.to_vec())
    .marks(EntryMarks::HIDDEN);
    engine.add(engine.create(args).unwrap(), None).unwrap();

    assert!(engine.lookup_forwarding(ip("10.0.0.3"), &fwd()).is_none());
    let hit = engine.lookup_forwarding(ip("10.0.0.3"), &fwd().hidden());
    assert!(hit.unwrap().is_hidden());
}

#[test]
fn local_entries_across_zones() {
    let zone = ZoneId(7);
    let net0 = ill("net0", 1);
    let net1 = ill("net1", 2);

    let setup = |cfg: EngineCfg| {
        let engine = engine_with(cfg);
        let args = EntryArgs::new(
            EntryKind::Interface(Resolution::Resolver),
            cidr("10.0.0.0/24"),
        )
        .stq(&net0)
        .ipif(&net0)
        .zone(ZoneId::ALL)
        .template(IFACE_TEMPLATE.to_vec());
        engine.add(engine.create(args).unwrap(), None).unwrap();

        for (addr, ill) in [("10.0.0.5", &net0), ("10.0.0.6", &net1)] {
            let args = EntryArgs::new(EntryKind::Local, cidr(addr))
                .ipif(ill)
                .zone(ZoneId(5));
            engine.add(engine.create(args).unwrap(), None).unwrap();
        }
        engine
    };

    // Zone 7 would reach 10.0.0.5 over net0, where the entry lives.
    let engine = setup(test_cfg());
    assert!(engine.lookup_cache(ip("10.0.0.5"), zone, None).is_some());
    assert!(engine.lookup_cache(ip("10.0.0.6"), zone, None).is_none());
    assert!(engine.lookup_cache(ip("10.0.0.6"), ZoneId(5), None).is_some());

    let engine = setup(EngineCfg {
        restrict_interzone_loopback: true,
        ..test_cfg()
    });
    assert!(engine.lookup_cache(ip("10.0.0.5"), zone, None).is_none());
}

#[test]
fn walk_matching_filters() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let net1 = ill("net1", 2);
    add_iface(&engine, &net0, "10.0.0.0/24");
    add_iface(&engine, &net1, "10.1.0.0/24");
    add_route(&engine, EntryKind::Prefix, "192.168.0.0/16", "10.0.0.1");
    add_route(&engine, EntryKind::Prefix, "172.16.0.0/12", "10.0.0.1");

    let mut seen = Vec::new();
    engine.walk_matching(
        &MatchCriteria::new().gateway(ip("10.0.0.1")),
        |e| seen.push(e.dest()),
    );
    seen.sort();
    assert_eq!(seen, vec![cidr("172.16.0.0/12"), cidr("192.168.0.0/16")]);

    let mut n = 0;
    engine.walk_matching(
        &MatchCriteria::new().interface(InterfaceId(2)),
        |_| n += 1,
    );
    assert_eq!(n, 1);
}

#[test]
fn snapshot_and_print() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let cache = add_cache(&engine, &net0, "10.0.0.7", None, &iface);

    let snap = engine.snapshot();
    assert_eq!(snap.cache_buckets, 16);
    assert_eq!(snap.entries.len(), 2);

    let dump = snap
        .entries
        .iter()
        .find(|e| e.table == TableKind::Cache)
        .unwrap();
    assert_eq!(dump.dest, cache.dest());
    assert_eq!(dump.stq.as_deref(), Some("net0"));
    assert_eq!(dump.max_frag, 1500);
    // The bucket's reference and ours.
    assert_eq!(dump.refcnt, 2);
    assert_eq!(dump.nce_state, Some(NeighborState::Reachable));

    let mut out = Vec::new();
    ire::print::print_entries_into(&mut out, &snap).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Cache Table (16 buckets)"));
    assert!(out.contains("10.0.0.7/32"));
    assert!(out.contains("10.0.0.0/24"));

    let mut out = Vec::new();
    ire::print::print_stats_into(&mut out, &engine.stats()).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("inserted"));

    let json = serde_json::to_string(&snap).unwrap();
    let back: DumpEntriesResp = serde_json::from_str(&json).unwrap();
    assert_eq!(back.entries.len(), 2);
    assert!(back.entries.iter().any(|e| e.dest == cache.dest()));
}
