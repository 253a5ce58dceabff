// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Route semantics: entry kinds, route flags, and lifecycle marks.

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// Whether an interface route needs link-layer resolution of its
/// next hops.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum Resolution {
    Resolver,
    NoResolver,
}

/// The kind of an entry. An entry never changes kind after creation.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum EntryKind {
    Host,
    Prefix,
    Default,
    Interface(Resolution),
    Cache,
    Broadcast,
    Local,
    Loopback,
    MobileReverseTunnel,
}

bitflags! {
    /// A set of [`EntryKind`]s, used as a type filter by lookups and
    /// walks.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct EntryKindSet: u16 {
        const BROADCAST     = 0x0001;
        const DEFAULT       = 0x0002;
        const LOCAL         = 0x0004;
        const LOOPBACK      = 0x0008;
        const PREFIX        = 0x0010;
        const CACHE         = 0x0020;
        const IF_RESOLVER   = 0x0040;
        const IF_NORESOLVER = 0x0080;
        const HOST          = 0x0100;
        const MIPRTUN       = 0x0200;

        const INTERFACE = Self::IF_RESOLVER.bits() | Self::IF_NORESOLVER.bits();
        const OFFSUBNET = Self::DEFAULT.bits() | Self::PREFIX.bits()
            | Self::HOST.bits();
        const CACHETABLE = Self::CACHE.bits() | Self::BROADCAST.bits()
            | Self::LOCAL.bits() | Self::LOOPBACK.bits();
        const FORWARDTABLE = Self::OFFSUBNET.bits() | Self::INTERFACE.bits()
            | Self::MIPRTUN.bits();
    }
}

impl EntryKind {
    pub fn bit(&self) -> EntryKindSet {
        match self {
            Self::Host => EntryKindSet::HOST,
            Self::Prefix => EntryKindSet::PREFIX,
            Self::Default => EntryKindSet::DEFAULT,
            Self::Interface(Resolution::Resolver) => EntryKindSet::IF_RESOLVER,
            Self::Interface(Resolution::NoResolver) => {
                EntryKindSet::IF_NORESOLVER
            }
            Self::Cache => EntryKindSet::CACHE,
            Self::Broadcast => EntryKindSet::BROADCAST,
            Self::Local => EntryKindSet::LOCAL,
            Self::Loopback => EntryKindSet::LOOPBACK,
            Self::MobileReverseTunnel => EntryKindSet::MIPRTUN,
        }
    }

    /// Entries of this kind live in the cache table.
    pub fn in_cache_table(&self) -> bool {
        EntryKindSet::CACHETABLE.contains(self.bit())
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, Self::Interface(_))
    }

    pub fn is_offsubnet(&self) -> bool {
        EntryKindSet::OFFSUBNET.contains(self.bit())
    }

    /// Entries of this kind carry a neighbor binding.
    pub fn is_resolvable(&self) -> bool {
        matches!(self, Self::Cache | Self::Broadcast)
    }

    /// Local and loopback entries are delivered up the stack rather
    /// than out an interface.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local | Self::Loopback)
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Host => "HOST",
            Self::Prefix => "PREFIX",
            Self::Default => "DEFAULT",
            Self::Interface(Resolution::Resolver) => "IF_RESOLV",
            Self::Interface(Resolution::NoResolver) => "IF_NORESOLV",
            Self::Cache => "CACHE",
            Self::Broadcast => "BROADCAST",
            Self::Local => "LOCAL",
            Self::Loopback => "LOOPBACK",
            Self::MobileReverseTunnel => "MIPRTUN",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val.to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "prefix" => Ok(Self::Prefix),
            "default" => Ok(Self::Default),
            "if_resolv" | "interface" => {
                Ok(Self::Interface(Resolution::Resolver))
            }
            "if_noresolv" => Ok(Self::Interface(Resolution::NoResolver)),
            "cache" => Ok(Self::Cache),
            "broadcast" => Ok(Self::Broadcast),
            "local" => Ok(Self::Local),
            "loopback" => Ok(Self::Loopback),
            "miprtun" => Ok(Self::MobileReverseTunnel),
            _ => Err(format!("unknown entry kind: {val}")),
        }
    }
}

bitflags! {
    /// Route semantics, modeled after the `RTF_*` routing socket flags.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct RouteFlags: u32 {
        const UP        = 0x0000_0001;
        const GATEWAY   = 0x0000_0002;
        const HOST      = 0x0000_0004;
        const REJECT    = 0x0000_0008;
        const DYNAMIC   = 0x0000_0010;
        const MODIFIED  = 0x0000_0020;
        const STATIC    = 0x0000_0800;
        const BLACKHOLE = 0x0000_1000;
        const PRIVATE   = 0x0000_2000;
        const MULTIRT   = 0x0001_0000;
        const SETSRC    = 0x0002_0000;
    }
}

bitflags! {
    /// Lifecycle and lookup-filter state of an entry. Unlike
    /// [`RouteFlags`] these change while the entry is linked.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
        Serialize,
    )]
    pub struct EntryMarks: u32 {
        /// Logically deleted; invisible to new lookups.
        const CONDEMNED    = 0x0001;
        /// Hidden from lookups unless asked for.
        const HIDDEN       = 0x0004;
        /// A cache entry created for a one-off purpose; first in line
        /// for eviction.
        const TEMPORARY    = 0x0010;
        /// Private to the local host; hidden unless asked for.
        const PRIVATE_ADDR = 0x0040;
        /// Not to be cached by upper layers.
        const UNCACHED     = 0x0080;
    }
}

bitflags! {
    /// Policy flags for multirouting alternate selection.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MultirtPolicy: u8 {
        /// Prefer a candidate whose gateway is already cached.
        const CACHEGW  = 0x01;
        /// Skip candidates tried within the resolution interval.
        const USESTAMP = 0x02;
        /// Stamp candidates that could not be resolved.
        const SETSTAMP = 0x04;
    }
}

bitflags! {
    /// What a periodic expiry pass should age out.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct ExpireFlags: u8 {
        /// Delete dynamic (redirect) routes.
        const REDIRECT = 0x01;
        /// Delete cache entries whose neighbor binding aged out.
        const ARP      = 0x02;
        /// Raise path MTUs back to the interface MTU.
        const MTU      = 0x04;
    }
}

/// The state of a neighbor binding.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum NeighborState {
    #[default]
    Initial,
    Reachable,
    Failed,
}

impl Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Initial => "INITIAL",
            Self::Reachable => "REACHABLE",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}
