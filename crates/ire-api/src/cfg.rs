// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine tunables.

use serde::Deserialize;
use serde::Serialize;

/// Tunables for a routing engine.
///
/// Every field defaults to its historical value, so a configuration
/// file only needs to name what it changes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct EngineCfg {
    /// Minimum number of cache-table buckets.
    pub cache_table_size: u32,
    /// Upper bound on the number of cache-table buckets.
    pub max_cache_table_size: u32,
    /// Memory available for sizing the cache table, in bytes.
    pub mem_avail: u64,
    /// Shift applied to `mem_avail` before dividing it among entries.
    pub mem_ratio: u32,
    /// Cache bucket length past which `evict_idle` starts deleting.
    pub max_bucket_cnt: u32,
    /// Victims per category per `evict_idle` pass.
    pub cleanup_cnt: u32,
    /// An off-link cache entry unused for this long is idle.
    pub idle_cutoff_ms: u64,
    /// Minimum time between resolution attempts of one multirouting
    /// candidate.
    pub multirt_resolution_interval_ms: u64,
    /// Age past which a neighbor binding is expired by an ARP expiry
    /// pass.
    pub arp_expire_ms: u64,
    /// Run `evict_idle` on the target bucket after each cache add.
    pub evict_on_add: bool,
    /// The system runs with security labels.
    pub labeled: bool,
    /// Never let a local entry answer a lookup from another zone.
    pub restrict_interzone_loopback: bool,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            cache_table_size: 256,
            max_cache_table_size: 65536,
            mem_avail: 64 * 1024 * 1024,
            mem_ratio: 6,
            max_bucket_cnt: 10,
            cleanup_cnt: 2,
            idle_cutoff_ms: 60_000,
            multirt_resolution_interval_ms: 15_000,
            arp_expire_ms: 1_200_000,
            evict_on_add: true,
            labeled: false,
            restrict_interzone_loopback: false,
        }
    }
}

impl EngineCfg {
    /// The number of cache-table buckets for entries of `entry_size`
    /// bytes: the configured minimum or the memory-derived size,
    /// whichever is larger, capped at the maximum and rounded up to a
    /// power of two.
    pub fn cache_buckets(&self, entry_size: usize) -> usize {
        let entry_size = entry_size.max(1) as u64;
        let derived = self
            .mem_avail
            .checked_shr(self.mem_ratio)
            .unwrap_or(0)
            / entry_size
            / u64::from(self.max_bucket_cnt.max(1));
        let size = u64::from(self.cache_table_size)
            .max(derived)
            .min(u64::from(self.max_cache_table_size));
        power2_roundup(size as u32) as usize
    }
}

/// Round up to a power of two no smaller than 2 and no larger than
/// 2^31.
pub fn power2_roundup(value: u32) -> u32 {
    let mut i = 1;
    while i < 31 {
        if value <= (1 << i) {
            break;
        }
        i += 1;
    }
    1 << i
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundup() {
        assert_eq!(power2_roundup(0), 2);
        assert_eq!(power2_roundup(2), 2);
        assert_eq!(power2_roundup(3), 4);
        assert_eq!(power2_roundup(256), 256);
        assert_eq!(power2_roundup(257), 512);
        assert_eq!(power2_roundup(u32::MAX), 1 << 31);
    }

    #[test]
    fn bucket_sizing() {
        let cfg = EngineCfg::default();
        // (64M >> 6) / 256 / 10 = 409 -> 512
        assert_eq!(cfg.cache_buckets(256), 512);

        let small = EngineCfg { mem_avail: 0, ..Default::default() };
        assert_eq!(small.cache_buckets(256), 256);

        let capped = EngineCfg {
            mem_avail: u64::MAX,
            max_cache_table_size: 1000,
            ..Default::default()
        };
        assert_eq!(capped.cache_buckets(256), 1024);
    }

    #[test]
    fn oversized_mem_ratio() {
        let cfg: EngineCfg = toml::from_str("mem_ratio = 64").unwrap();
        assert_eq!(cfg.cache_buckets(256), 256);

        let cfg: EngineCfg = toml::from_str("mem_ratio = 4000").unwrap();
        assert_eq!(cfg.cache_buckets(256), 256);
    }

    #[test]
    fn partial_toml() {
        let cfg: EngineCfg =
            toml::from_str("idle_cutoff_ms = 5\nlabeled = true\n").unwrap();
        assert_eq!(cfg.idle_cutoff_ms, 5);
        assert!(cfg.labeled);
        assert_eq!(cfg.max_bucket_cnt, 10);
    }
}
