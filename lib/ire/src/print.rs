// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print engine state in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both ireadm and integration tests.

use crate::api::CacheCounts;
use crate::api::DumpEntriesResp;
use crate::api::EntryDump;
use crate::api::TableKind;
use crate::engine::IreStatsSnap;
use std::io::Write;
use std::string::String;
use std::string::ToString;
use tabwriter::TabWriter;

/// Print a [`DumpEntriesResp`].
pub fn print_entries(resp: &DumpEntriesResp) -> std::io::Result<()> {
    print_entries_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpEntriesResp`] into a given writer.
pub fn print_entries_into(
    writer: &mut impl Write,
    resp: &DumpEntriesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Cache Table ({} buckets)", resp.cache_buckets)?;
    write_hrb(&mut t)?;
    print_entry_header(&mut t)?;
    for e in resp.entries.iter().filter(|e| e.table == TableKind::Cache) {
        print_entry(&mut t, e)?;
    }
    t.flush()?;

    writeln!(t, "\nForwarding Table")?;
    write_hrb(&mut t)?;
    print_entry_header(&mut t)?;
    for e in resp.entries.iter().filter(|e| e.table == TableKind::Forwarding)
    {
        print_entry(&mut t, e)?;
    }
    t.flush()?;

    writeln!(t)?;
    t.flush()
}

fn print_entry_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(
        t,
        "DEST\tGATEWAY\tKIND\tIF\tZONE\tMTU\tREF\tIN\tOUT\tFLAGS\tNCE"
    )
}

fn print_entry(t: &mut impl Write, e: &EntryDump) -> std::io::Result<()> {
    let gw = e.gateway.map(|gw| gw.to_string()).unwrap_or("-".into());
    let ifname = e.stq.clone().unwrap_or_else(|| String::from("-"));
    let nce = e.nce_state.map(|s| s.to_string()).unwrap_or("-".into());

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        e.dest,
        gw,
        e.kind,
        ifname,
        e.zone,
        e.max_frag,
        e.refcnt,
        e.ib_pkts,
        e.ob_pkts,
        flags_str(e),
        nce,
    )
}

// One letter per route flag and mark, in the style of netstat(8).
fn flags_str(e: &EntryDump) -> String {
    use crate::api::EntryMarks;
    use crate::api::RouteFlags;

    let letters = [
        (e.flags.contains(RouteFlags::UP), 'U'),
        (e.flags.contains(RouteFlags::GATEWAY), 'G'),
        (e.flags.contains(RouteFlags::HOST), 'H'),
        (e.flags.contains(RouteFlags::REJECT), 'R'),
        (e.flags.contains(RouteFlags::DYNAMIC), 'D'),
        (e.flags.contains(RouteFlags::BLACKHOLE), 'B'),
        (e.flags.contains(RouteFlags::MULTIRT), 'M'),
        (e.flags.contains(RouteFlags::SETSRC), 'S'),
        (e.marks.contains(EntryMarks::HIDDEN), 'h'),
        (e.marks.contains(EntryMarks::TEMPORARY), 't'),
        (e.marks.contains(EntryMarks::PRIVATE_ADDR), 'p'),
    ];
    let s: String =
        letters.iter().filter(|(set, _)| *set).map(|(_, c)| *c).collect();
    if s.is_empty() { "-".into() } else { s }
}

/// Print [`CacheCounts`].
pub fn print_cache_counts(counts: &CacheCounts) -> std::io::Result<()> {
    print_cache_counts_into(&mut std::io::stdout(), counts)
}

/// Print [`CacheCounts`] into a given writer.
pub fn print_cache_counts_into(
    writer: &mut impl Write,
    counts: &CacheCounts,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "TOTAL\tONLINK\tPMTU\tOFFLINK\tUNUSED")?;
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}",
        counts.total, counts.onlink, counts.pmtu, counts.offlink, counts.unused
    )?;
    t.flush()
}

/// Print an [`IreStatsSnap`].
pub fn print_stats(stats: &IreStatsSnap) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print an [`IreStatsSnap`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &IreStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "STAT\tVALUE")?;
    write_hr(&mut t)?;
    for (name, val) in stats.fields() {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
