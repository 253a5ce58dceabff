// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Adds, deletes, lookups and walks racing each other.

use ire_test_utils as common;

use common::*;
use rand::Rng;
use std::sync::Barrier;
use std::thread;

const CHURNERS: usize = 4;
const ROUNDS: usize = 500;

fn random_host(rng: &mut impl Rng) -> String {
    format!("10.0.0.{}", rng.random_range(1..=200))
}

#[test]
fn churn_while_walking() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let dflt = add_route(&engine, EntryKind::Default, "0.0.0.0/0", "10.0.0.1");
    let start = Barrier::new(CHURNERS + 2);

    thread::scope(|s| {
        for _ in 0..CHURNERS {
            s.spawn(|| {
                let mut rng = rand::rng();
                start.wait();
                for _ in 0..ROUNDS {
                    let host = random_host(&mut rng);
                    if rng.random_bool(0.6) {
                        add_cache(&engine, &net0, &host, None, &iface);
                        continue;
                    }
                    let addr = ip(&host);
                    if let Some(hit) =
                        engine.lookup_cache(addr, ZoneId::ALL, None)
                    {
                        assert_eq!(hit.dest().ip(), addr);
                        engine.delete(hit);
                    }
                }
            });
        }

        // Forwarding buckets come and go under the cache churn.
        s.spawn(|| {
            let mut rng = rand::rng();
            start.wait();
            for _ in 0..ROUNDS {
                let net = format!("192.168.{}.0/24", rng.random_range(0..4));
                let route =
                    add_route(&engine, EntryKind::Prefix, &net, "10.0.0.1");
                if rng.random_bool(0.5) {
                    engine.delete(route);
                } else {
                    engine.release(route);
                }
            }
        });

        s.spawn(|| {
            start.wait();
            for _ in 0..ROUNDS {
                let mut seen = 0;
                engine.walk_table(TableKind::Cache, |e| {
                    assert_eq!(e.kind(), EntryKind::Cache);
                    seen += 1;
                    engine.release(e);
                });
                assert!(seen <= 200);
                let hit = engine.lookup_route(
                    ip("192.168.1.9"),
                    ZoneId::GLOBAL,
                    None,
                );
                assert!(hit.is_some());
            }
        });
    });

    // Quiesced: nothing is being walked and nothing condemned lingers.
    for i in 1..=200 {
        let state = engine.cache_bucket_state(ip(&format!("10.0.0.{i}")));
        assert_eq!(state.walkers, 0);
        assert!(!state.pending_condemned);
        assert_eq!(state.linked, state.entry_count);
    }

    drop((iface, dflt));
    engine.delete_by_interface(&net0);
    engine
        .delete_matching(cidr("0.0.0.0/0"), &MatchCriteria::new())
        .unwrap();
    for i in 0..4 {
        let net = format!("192.168.{i}.0/24");
        let _ = engine.delete_matching(cidr(&net), &MatchCriteria::new());
    }

    let mut left = 0;
    engine.walk_all(|_| true, |_| left += 1);
    assert_eq!(left, 0);
    assert_eq!(net0.ire_cnt(), 0);
    assert_eq!(engine.fwd_buckets(), 0);

    let stats = engine.stats();
    assert_eq!(stats.alloced, stats.freed);
    assert_eq!(stats.inserted, stats.deleted);
}

#[test]
fn deferred_adds_from_many_threads() {
    let engine = engine();
    let net0 = ill("net0", 1);
    let iface = add_iface(&engine, &net0, "10.0.0.0/24");
    let start = Barrier::new(CHURNERS + 1);

    net0.set_changing(true);
    thread::scope(|s| {
        for t in 0..CHURNERS {
            let (engine, net0, iface) = (&engine, &net0, &iface);
            let start = &start;
            s.spawn(move || {
                start.wait();
                for i in 0..10 {
                    let host = format!("10.0.0.{}", t * 10 + i + 1);
                    let args = cache_args(net0, &host, None, iface);
                    let entry = engine.create(args).unwrap();
                    let res = engine.add(entry, None);
                    assert_eq!(res.unwrap_err(), IreError::Deferred);
                }
            });
        }
        start.wait();
    });

    assert_eq!(net0.pending_retries(), CHURNERS * 10);
    net0.set_changing(false);
    let mut n = 0;
    engine.walk_table(TableKind::Cache, |_| n += 1);
    assert_eq!(n, CHURNERS * 10);
    assert_eq!(engine.stats().deferred, (CHURNERS * 10) as u64);
}
