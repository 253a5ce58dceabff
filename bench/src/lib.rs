// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Shared setup for the engine benchmarks.

use criterion::measurement::Measurement;
use criterion::measurement::WallTime;
use ire_test_utils::*;
use std::sync::Arc;

#[cfg(feature = "alloc")]
pub mod alloc;

/// Additional labelling information for [`Measurement`]s for
/// pretty-printing and grouping.
pub trait MeasurementInfo: Measurement {
    fn label() -> &'static str;
}

impl MeasurementInfo for WallTime {
    fn label() -> &'static str {
        "wallclock"
    }
}

/// An engine holding `routes` /24 prefixes under 172.16.0.0/12 and
/// `caches` resolved hosts under 10.0.0.0/16, all reached through
/// net0.
pub struct Fixture {
    pub engine: Arc<RoutingEngine>,
    pub net0: Arc<Ill>,
    pub iface: EntryRef,
    pub routes: Vec<EntryRef>,
    pub caches: Vec<EntryRef>,
}

impl Fixture {
    pub fn new(routes: usize, caches: usize) -> Self {
        let cfg = EngineCfg {
            cache_table_size: 1024,
            evict_on_add: false,
            ..Default::default()
        };
        let engine = RoutingEngine::new(cfg, Providers::quiet())
            .expect("valid bench config");
        let net0 = ill("net0", 1);
        let iface = add_iface(&engine, &net0, "10.0.0.0/16");

        let routes = (0..routes)
            .map(|i| {
                let dest = format!("172.{}.{}.0/24", 16 + i / 256, i % 256);
                add_route(&engine, EntryKind::Prefix, &dest, "10.0.0.1")
            })
            .collect();
        let caches = (0..caches)
            .map(|i| {
                let dest = Self::host(i);
                add_cache(&engine, &net0, &dest, None, &iface)
            })
            .collect();

        Self { engine, net0, iface, routes, caches }
    }

    /// The `i`th cached host.
    pub fn host(i: usize) -> String {
        format!("10.0.{}.{}", i / 250, i % 250 + 1)
    }

    /// An address inside the `i`th routed prefix.
    pub fn routed(i: usize) -> Ipv4Addr {
        ip(&format!("172.{}.{}.9", 16 + i / 256, i % 256))
    }
}
