// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::API_VERSION;
use super::EntryKind;
use super::EntryMarks;
use super::InterfaceId;
use super::NeighborState;
use super::RouteFlags;
use super::ZoneId;
use super::ip::Ipv4Addr;
use super::ip::Ipv4Cidr;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use libc::c_int;
use serde::Deserialize;
use serde::Serialize;

/// Errors returned by entry creation, insertion and the delete-by-key
/// helpers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum IreError {
    /// Malformed construction parameters.
    #[error("invalid entry configuration: {0}")]
    InvalidConfig(String),

    /// A referenced interface is permanently unusable for this entry.
    #[error("interface unusable: {0}")]
    InterfaceUnusable(String),

    /// A referenced interface is reconfiguring; the add has been queued
    /// and completes when the interface settles.
    #[error("operation deferred until interface settles")]
    Deferred,

    /// The neighbor binding is not resolved and the caller did not
    /// allow unresolved entries.
    #[error("neighbor {0} not resolved")]
    UnresolvedNotAllowed(Ipv4Addr),

    #[error("out of memory")]
    OutOfMemory,

    /// Label or zone policy rejected the entry.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("no such entry: {0}")]
    NotFound(String),
}

impl IreError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> c_int {
        use libc::*;

        match self {
            Self::InvalidConfig(_) => EINVAL,
            Self::InterfaceUnusable(_) => EINVAL,
            Self::Deferred => EINPROGRESS,
            Self::UnresolvedNotAllowed(_) => EINVAL,
            Self::OutOfMemory => ENOMEM,
            Self::PolicyDenied(_) => EACCES,
            Self::NotFound(_) => ENOENT,
        }
    }

    /// Everything but [`IreError::Deferred`] is a final answer.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Deferred)
    }
}

/// Which table an entry lives in.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum TableKind {
    Cache,
    Forwarding,
}

impl Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Cache => "CACHE",
            Self::Forwarding => "FWD",
        };
        write!(f, "{s}")
    }
}

/// The public fields of one entry, as reported by a table snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntryDump {
    pub table: TableKind,
    pub dest: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub src_addr: Option<Ipv4Addr>,
    pub kind: EntryKind,
    pub flags: RouteFlags,
    pub marks: EntryMarks,
    pub zone: ZoneId,
    pub stq: Option<String>,
    pub stq_id: Option<InterfaceId>,
    pub max_frag: u32,
    pub refcnt: usize,
    pub ib_pkts: u64,
    pub ob_pkts: u64,
    pub parent_handle: u32,
    pub interface_handle: u32,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub rtt: u32,
    pub ssthresh: u32,
    pub nce_state: Option<NeighborState>,
}

/// A snapshot of both tables.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpEntriesResp {
    pub api_version: u64,
    pub cache_buckets: usize,
    pub entries: Vec<EntryDump>,
}

impl DumpEntriesResp {
    pub fn new(cache_buckets: usize, entries: Vec<EntryDump>) -> Self {
        Self { api_version: API_VERSION, cache_buckets, entries }
    }
}

/// Cache entries by category, as used to size a reclaim pass.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct CacheCounts {
    pub total: u32,
    /// No gateway.
    pub onlink: u32,
    /// Path MTU below the interface MTU.
    pub pmtu: u32,
    /// Off-link and used since the last reclaim.
    pub offlink: u32,
    /// Off-link and unused since the last reclaim.
    pub unused: u32,
}

/// Per-category reclaim fractions. A fraction of `N` frees roughly one
/// in `N` entries of that category; zero frees none.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct ReclaimFractions {
    pub onlink: u32,
    pub pmtu: u32,
    pub offlink: u32,
    pub unused: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(IreError::Deferred.to_errno(), libc::EINPROGRESS);
        assert_eq!(IreError::OutOfMemory.to_errno(), libc::ENOMEM);
        assert_eq!(
            IreError::NotFound("10.0.0.0/8".into()).to_errno(),
            libc::ENOENT
        );
        assert!(!IreError::Deferred.is_terminal());
        assert!(IreError::PolicyDenied("label".into()).is_terminal());
    }

    #[test]
    fn error_display() {
        let err = IreError::UnresolvedNotAllowed("10.0.0.1".parse().unwrap());
        assert_eq!(format!("{err}"), "neighbor 10.0.0.1 not resolved");
    }
}
