// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 addresses and prefixes as the routing tables key them.

use alloc::string::String;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An IPv4 address, stored in network order.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    /// Zero every bit past a raw prefix length.
    pub fn mask(self, prefix_len: u8) -> Result<Self, String> {
        Ok(self.safe_mask(Ipv4PrefixLen::new(prefix_len)?))
    }

    /// Zero every bit past `prefix_len`.
    pub fn safe_mask(self, prefix_len: Ipv4PrefixLen) -> Self {
        Self::from(u32::from(self) & prefix_len.mask_bits())
    }

    /// Class D, `224.0.0.0/4`.
    pub const fn is_multicast(&self) -> bool {
        self.inner[0] & 0xf0 == 0xe0
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip: core::net::Ipv4Addr) -> Self {
        Self { inner: ip.octets() }
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from(ip.inner)
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.inner)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self { inner: val.to_be_bytes() }
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(inner: [u8; 4]) -> Self {
        Self { inner }
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        val.parse::<core::net::Ipv4Addr>()
            .map(Self::from)
            .map_err(|_| format!("malformed IPv4 address: {val}"))
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.inner;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A prefix length in `0..=32`.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4PrefixLen(u8);

impl Ipv4PrefixLen {
    pub const NETMASK_NONE: Self = Self(0);
    pub const NETMASK_ALL: Self = Self(32);

    pub fn new(prefix_len: u8) -> Result<Self, String> {
        if prefix_len > 32 {
            return Err(format!("bad IPv4 prefix length: {prefix_len}"));
        }
        Ok(Self(prefix_len))
    }

    /// The mask as a host-order integer.
    pub fn mask_bits(self) -> u32 {
        u32::MAX.checked_shl(32 - u32::from(self.0)).unwrap_or(0)
    }

    pub fn val(&self) -> u8 {
        self.0
    }
}

/// A destination prefix. The address never has bits set past the
/// prefix length.
///
/// Ordered by address, then by prefix length.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Cidr {
    ip: Ipv4Addr,
    prefix_len: Ipv4PrefixLen,
}

impl Ipv4Cidr {
    pub fn new(ip: Ipv4Addr, prefix_len: Ipv4PrefixLen) -> Self {
        Self { ip: ip.safe_mask(prefix_len), prefix_len }
    }

    pub fn host(ip: Ipv4Addr) -> Self {
        Self { ip, prefix_len: Ipv4PrefixLen::NETMASK_ALL }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == Ipv4PrefixLen::NETMASK_NONE
    }

    pub fn is_host(&self) -> bool {
        self.prefix_len == Ipv4PrefixLen::NETMASK_ALL
    }

    pub fn is_member(&self, ip: Ipv4Addr) -> bool {
        ip.safe_mask(self.prefix_len) == self.ip
    }

    pub fn prefix_len(self) -> u8 {
        self.prefix_len.val()
    }

    pub fn prefix(self) -> Ipv4PrefixLen {
        self.prefix_len
    }

    /// The prefix as a dotted netmask.
    pub fn to_mask(self) -> Ipv4Addr {
        Ipv4Addr::from(self.prefix_len.mask_bits())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    /// Parse `a.b.c.d/len`. A bare address is a host prefix.
    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let (ip_s, len_s) = val.split_once('/').unwrap_or((val, "32"));
        let ip = ip_s.parse()?;
        let len = len_s
            .parse::<u8>()
            .map_err(|e| format!("bad prefix length in {val}: {e}"))?;
        Ok(Self::new(ip, Ipv4PrefixLen::new(len)?))
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len.val())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn cidr_is_premasked() {
        let cidr = "10.1.2.3/8".parse::<Ipv4Cidr>().unwrap();
        assert_eq!(cidr.ip(), "10.0.0.0".parse().unwrap());
        assert_eq!(cidr.prefix_len(), 8);
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert_eq!(cidr.to_mask(), "255.0.0.0".parse().unwrap());

        let ip: Ipv4Addr = "172.16.9.9".parse().unwrap();
        assert_eq!(ip.mask(12).unwrap(), "172.16.0.0".parse().unwrap());
        assert!(ip.mask(40).is_err());
        let std_ip = core::net::Ipv4Addr::from(ip);
        assert_eq!(Ipv4Addr::from(std_ip), ip);
    }

    #[test]
    fn cidr_membership() {
        let cidr = "192.168.2.0/24".parse::<Ipv4Cidr>().unwrap();
        assert!(cidr.is_member("192.168.2.77".parse().unwrap()));
        assert!(!cidr.is_member("192.168.3.77".parse().unwrap()));

        let dflt = "0.0.0.0/0".parse::<Ipv4Cidr>().unwrap();
        assert!(dflt.is_default());
        assert!(dflt.is_member("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn parse_errors() {
        assert!("10.0.0.5".parse::<Ipv4Cidr>().unwrap().is_host());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.256".parse::<Ipv4Addr>().is_err());
    }

    #[test]
    fn masks() {
        let bits = |n| Ipv4PrefixLen::new(n).unwrap().mask_bits();
        assert_eq!(bits(0), 0);
        assert_eq!(bits(1), 0x8000_0000);
        assert_eq!(bits(24), 0xffff_ff00);
        assert_eq!(bits(32), u32::MAX);
    }

    #[test]
    fn multicast() {
        assert!("224.0.0.1".parse::<Ipv4Addr>().unwrap().is_multicast());
        assert!("239.9.9.9".parse::<Ipv4Addr>().unwrap().is_multicast());
        assert!(!"240.0.0.1".parse::<Ipv4Addr>().unwrap().is_multicast());
        assert!(!"10.0.0.1".parse::<Ipv4Addr>().unwrap().is_multicast());
    }
}
