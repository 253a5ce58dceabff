// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Load a routing topology from a TOML file into a [`RoutingEngine`].
//!
//! ```toml
//! [engine]
//! cache_table_size = 64
//!
//! [[interface]]
//! name = "net0"
//! id = 1
//! prefix = "10.0.0.0/24"
//!
//! [[route]]
//! dest = "0.0.0.0/0"
//! gateway = "10.0.0.1"
//!
//! [[cache]]
//! dest = "8.8.8.8"
//! link_addr = "a8:40:25:00:00:01"
//! ```

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use ire::api::EngineCfg;
use ire::api::EntryKind;
use ire::api::EntryKindSet;
use ire::api::GroupId;
use ire::api::InterfaceId;
use ire::api::Ipv4Addr;
use ire::api::Ipv4Cidr;
use ire::api::Resolution;
use ire::api::RouteFlags;
use ire::api::ZoneId;
use ire::engine::RoutingEngine;
use ire::engine::ill::Ill;
use ire::engine::ire::EntryArgs;
use ire::engine::ire::EntryRef;
use ire::engine::matcher::MatchCriteria;
use ire::provider::LogLevel;
use ire::provider::LogProvider;
use ire::provider::NoResolver;
use ire::provider::PermitLabels;
use ire::provider::Providers;
use serde::Deserialize;
use slog::Drain;
use slog::Logger;
use std::path::Path;
use std::sync::Arc;

/// Link-layer broadcast, the resolver template of interface routes.
pub const BCAST_TEMPLATE: [u8; 6] = [0xff; 6];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    #[serde(default)]
    pub engine: EngineCfg,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceCfg>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteCfg>,
    #[serde(default, rename = "cache")]
    pub caches: Vec<CacheCfg>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceCfg {
    pub name: String,
    pub id: u32,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    pub group: Option<u32>,
    pub hw_addr: Option<String>,
    /// The on-link prefix, installed as an interface route.
    pub prefix: Option<String>,
    /// Zones this interface offers a source address to.
    #[serde(default)]
    pub usable_src_zones: Vec<i32>,
    #[serde(default)]
    pub offline: bool,
}

fn default_mtu() -> u32 {
    1500
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteCfg {
    pub dest: String,
    pub gateway: Option<String>,
    /// Inferred from the prefix length when absent.
    pub kind: Option<String>,
    #[serde(default)]
    pub zone: i32,
    /// `RouteFlags` names, such as "multirt" or "dynamic".
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A resolved next hop, cached against whatever route reaches it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheCfg {
    pub dest: String,
    pub link_addr: String,
}

impl TopologyFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// A populated engine and the interfaces its entries reference.
pub struct Topology {
    pub engine: Arc<RoutingEngine>,
    pub ills: Vec<Arc<Ill>>,
}

impl Topology {
    pub fn build(
        file: &TopologyFile,
        providers: Providers,
    ) -> anyhow::Result<Self> {
        let engine = RoutingEngine::new(file.engine.clone(), providers)
            .context("create engine")?;
        let mut topo = Self { engine, ills: Vec::new() };

        for cfg in &file.interfaces {
            topo.add_interface(cfg)
                .with_context(|| format!("interface {}", cfg.name))?;
        }
        for cfg in &file.routes {
            topo.add_route(cfg)
                .with_context(|| format!("route {}", cfg.dest))?;
        }
        for cfg in &file.caches {
            topo.add_cache(cfg)
                .with_context(|| format!("cache {}", cfg.dest))?;
        }
        Ok(topo)
    }

    pub fn ill(&self, name: &str) -> Option<&Arc<Ill>> {
        self.ills.iter().find(|ill| ill.name() == name)
    }

    fn add_interface(&mut self, cfg: &InterfaceCfg) -> anyhow::Result<()> {
        if self.ill(&cfg.name).is_some() {
            bail!("duplicate interface name");
        }

        let mut ill = Ill::new(&cfg.name, InterfaceId(cfg.id), cfg.mtu);
        if let Some(group) = cfg.group {
            ill = ill.with_group(GroupId(group));
        }
        if let Some(mac) = &cfg.hw_addr {
            ill = ill.with_hw_addr(parse_mac(mac)?);
        }
        let ill = Arc::new(ill);
        for zone in &cfg.usable_src_zones {
            self.engine.set_usable_src(&ill, ZoneId(*zone), true);
        }

        if let Some(prefix) = &cfg.prefix {
            let args = EntryArgs::new(
                EntryKind::Interface(Resolution::Resolver),
                parse(prefix)?,
            )
            .stq(&ill)
            .ipif(&ill)
            .template(BCAST_TEMPLATE.to_vec());
            self.add(args)?;
        }

        // Taking the interface offline afterwards keeps its route.
        ill.set_offline(cfg.offline);
        self.ills.push(ill);
        Ok(())
    }

    fn add_route(&mut self, cfg: &RouteCfg) -> anyhow::Result<()> {
        let dest: Ipv4Cidr = parse(&cfg.dest)?;
        let kind = match &cfg.kind {
            Some(kind) => parse(kind)?,
            None if dest.is_default() => EntryKind::Default,
            None if dest.is_host() => EntryKind::Host,
            None => EntryKind::Prefix,
        };

        let mut args = EntryArgs::new(kind, dest)
            .zone(ZoneId(cfg.zone))
            .flags(RouteFlags::UP | parse_flags(&cfg.flags)?);
        if let Some(gw) = &cfg.gateway {
            args = args.gateway(parse(gw)?);
        }
        self.add(args)?;
        Ok(())
    }

    fn add_cache(&mut self, cfg: &CacheCfg) -> anyhow::Result<()> {
        let dest: Ipv4Addr = parse(&cfg.dest)?;
        let link_addr = parse_mac(&cfg.link_addr)?;
        let crit =
            MatchCriteria::new().kinds(EntryKindSet::FORWARDTABLE).recursive();
        let route = self
            .engine
            .lookup_forwarding(dest, &crit)
            .ok_or_else(|| anyhow!("no route to {dest}"))?;

        let iface = if route.kind().is_interface() {
            route.clone()
        } else {
            self.engine
                .resolve_gateway(&route, ZoneId::ALL, None)
                .ok_or_else(|| {
                    anyhow!("gateway of {} unreachable", route.dest())
                })?
        };
        let ill = iface
            .stq()
            .ok_or_else(|| anyhow!("{} has no interface", iface.dest()))?
            .clone();

        let via = iface.kind().is_interface().then_some(&*iface);
        let mut args = EntryArgs::new(EntryKind::Cache, Ipv4Cidr::host(dest))
            .stq(&ill)
            .ipif(&ill)
            .template(link_addr.to_vec())
            .cache_via(&route, via);
        if let Some(gw) = route.gateway() {
            args = args.gateway(gw);
        }
        self.add(args)?;
        Ok(())
    }

    fn add(&self, args: EntryArgs) -> anyhow::Result<EntryRef> {
        let entry = self.engine.create(args)?;
        Ok(self.engine.add(entry, None)?)
    }
}

fn parse<T>(val: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    val.parse::<T>().map_err(|e| anyhow!(e))
}

fn parse_flags(names: &[String]) -> anyhow::Result<RouteFlags> {
    names.iter().try_fold(RouteFlags::empty(), |acc, name| {
        RouteFlags::from_name(&name.to_ascii_uppercase())
            .map(|f| acc | f)
            .ok_or_else(|| anyhow!("unknown route flag: {name}"))
    })
}

pub fn parse_mac(val: &str) -> anyhow::Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut octets = val.split(':');
    for byte in mac.iter_mut() {
        let octet = octets
            .next()
            .ok_or_else(|| anyhow!("short link address: {val}"))?;
        *byte = u8::from_str_radix(octet, 16)
            .with_context(|| format!("bad link address: {val}"))?;
    }
    if octets.next().is_some() {
        bail!("long link address: {val}");
    }
    Ok(mac)
}

/// Forwards engine log messages to a `slog` logger.
pub struct SlogLog {
    log: Logger,
}

impl SlogLog {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => slog::info!(self.log, "{msg}"),
            LogLevel::Warn => slog::warn!(self.log, "{msg}"),
            LogLevel::Error => slog::error!(self.log, "{msg}"),
        }
    }
}

/// A terminal logger filtered by `RUST_LOG`.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "ireadm"))
}

pub fn providers(log: Logger) -> Providers {
    Providers {
        log: Box::new(SlogLog::new(log)),
        resolver: Box::new(NoResolver),
        label: Box::new(PermitLabels),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ire::api::TableKind;

    const TOPOLOGY: &str = r#"
        [engine]
        cache_table_size = 16
        max_cache_table_size = 16
        mem_avail = 0

        [[interface]]
        name = "net0"
        id = 1
        hw_addr = "02:08:20:00:00:01"
        prefix = "10.0.0.0/24"

        [[interface]]
        name = "net1"
        id = 2
        mtu = 9000
        group = 4
        prefix = "10.1.0.0/24"
        usable_src_zones = [3]

        [[route]]
        dest = "0.0.0.0/0"
        gateway = "10.0.0.1"

        [[route]]
        dest = "203.0.113.5/32"
        gateway = "10.1.0.2"
        flags = ["multirt"]

        [[cache]]
        dest = "8.8.8.8"
        link_addr = "a8:40:25:00:00:01"

        [[cache]]
        dest = "10.1.0.9"
        link_addr = "a8:40:25:00:00:02"
    "#;

    fn quiet() -> Providers {
        Providers::quiet()
    }

    #[test]
    fn builds_topology() {
        let file = TopologyFile::parse(TOPOLOGY).unwrap();
        assert_eq!(file.engine.cache_table_size, 16);
        let topo = Topology::build(&file, quiet()).unwrap();
        let engine = &topo.engine;
        assert_eq!(engine.cache_buckets(), 16);
        assert_eq!(topo.ill("net1").unwrap().mtu(), 9000);
        assert_eq!(topo.ill("net1").unwrap().group(), Some(GroupId(4)));
        assert_eq!(topo.ill("net0").unwrap().hw_addr()[5], 1);

        let mut fwd = 0;
        engine.walk_table(TableKind::Forwarding, |_| fwd += 1);
        assert_eq!(fwd, 4);

        let via_dflt = engine
            .lookup_cache("8.8.8.8".parse().unwrap(), ZoneId::ALL, None)
            .unwrap();
        assert_eq!(via_dflt.gateway(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(via_dflt.stq().unwrap().name(), "net0");
        assert_eq!(via_dflt.cmask().val(), 0);

        let onlink = engine
            .lookup_cache("10.1.0.9".parse().unwrap(), ZoneId::ALL, None)
            .unwrap();
        assert_eq!(onlink.gateway(), None);
        assert_eq!(onlink.stq().unwrap().name(), "net1");

        let host = engine
            .lookup_route("203.0.113.5".parse().unwrap(), ZoneId::ALL, None)
            .unwrap();
        assert!(host.flags().contains(RouteFlags::MULTIRT));
    }

    #[test]
    fn rejects_bad_input() {
        let bad = [
            "[[route]]\ndest = \"10.0.0.0/33\"",
            "[[route]]\ndest = \"10.0.0.0/8\"\nflags = [\"bogus\"]",
            "[[interface]]\nname = \"a\"\nid = 1\nhw_addr = \"zz\"",
            "[[cache]]\ndest = \"8.8.8.8\"\nlink_addr = \"ff:ff:ff:ff:ff:ff\"",
            "[[interface]]\nname = \"a\"\nid = 1\n\
             [[interface]]\nname = \"a\"\nid = 2",
        ];
        for raw in bad {
            let file = TopologyFile::parse(raw).unwrap();
            assert!(Topology::build(&file, quiet()).is_err(), "{raw}");
        }

        assert!(TopologyFile::parse("[nope]").is_err());
    }

    #[test]
    fn mac_addresses() {
        assert_eq!(
            parse_mac("a8:40:25:0:0:1").unwrap(),
            [0xa8, 0x40, 0x25, 0, 0, 1],
        );
        assert!(parse_mac("a8:40:25:00:00").is_err());
        assert!(parse_mac("a8:40:25:00:00:01:02").is_err());
    }
}
