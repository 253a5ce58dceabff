// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;

use ire::api::DumpEntriesResp;
use ire::api::ExpireFlags;
use ire::api::Ipv4Addr;
use ire::api::ReclaimFractions;
use ire::api::ZoneId;
use ire::print::print_cache_counts;
use ire::print::print_entries;
use ire::print::print_stats;
use ireadm::Topology;
use ireadm::TopologyFile;

/// Load a routing topology into an IRE engine and inspect it
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The topology to load before running the command.
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dump the cache and forwarding tables.
    Dump {
        #[arg(long)]
        json: bool,
    },

    /// Find the entry used to reach an address.
    Lookup {
        addr: Ipv4Addr,

        #[arg(long, default_value_t = ZoneId::GLOBAL)]
        zone: ZoneId,
    },

    /// Count cache entries by reclaim category.
    CacheCounts,

    /// Free roughly one in N cache entries of each category.
    Reclaim {
        #[arg(long, default_value_t = 0)]
        onlink: u32,

        #[arg(long, default_value_t = 0)]
        pmtu: u32,

        #[arg(long, default_value_t = 0)]
        offlink: u32,

        #[arg(long, default_value_t = 0)]
        unused: u32,
    },

    /// Delete or reset aged state.
    Expire {
        /// Delete dynamic (redirect) routes.
        #[arg(long)]
        redirect: bool,

        /// Delete cache entries with stale neighbor bindings.
        #[arg(long)]
        arp: bool,

        /// Reset cached path MTUs.
        #[arg(long)]
        mtu: bool,
    },

    /// Print engine counters.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Report whether another multirouted route to an address should
    /// be resolved.
    NeedResolve { addr: Ipv4Addr },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = ireadm::logger();
    let file = TopologyFile::load(&cli.config)?;
    let topo = Topology::build(&file, ireadm::providers(log))?;
    let engine = &topo.engine;

    match cli.cmd {
        Command::Dump { json } => {
            let snap = engine.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                print_entries(&snap)?;
            }
        }

        Command::Lookup { addr, zone } => {
            let hit = engine
                .lookup_route(addr, zone, None)
                .ok_or_else(|| anyhow!("no route to {addr} from zone {zone}"))?;
            let dump = engine.describe(&hit);
            print_entries(&DumpEntriesResp::new(
                engine.cache_buckets(),
                vec![dump],
            ))?;
        }

        Command::CacheCounts => {
            print_cache_counts(&engine.cache_counts())?;
        }

        Command::Reclaim { onlink, pmtu, offlink, unused } => {
            let before = engine.cache_counts();
            let fr = ReclaimFractions { onlink, pmtu, offlink, unused };
            let n = engine.cache_reclaim(fr);
            println!("reclaimed {n} of {} cache entries", before.total);
        }

        Command::Expire { redirect, arp, mtu } => {
            let mut flags = ExpireFlags::empty();
            flags.set(ExpireFlags::REDIRECT, redirect);
            flags.set(ExpireFlags::ARP, arp);
            flags.set(ExpireFlags::MTU, mtu);
            if flags.is_empty() {
                return Err(anyhow!("expected --redirect, --arp or --mtu"));
            }
            println!("expired {} entries", engine.expire(flags));
        }

        Command::Stats { json } => {
            let stats = engine.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats)?;
            }
        }

        Command::NeedResolve { addr } => {
            println!("{}", engine.multirt_need_resolve(addr, None));
        }
    }

    Ok(())
}
