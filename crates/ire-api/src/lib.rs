// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the IRE engine and its administrative tooling.
//!
//! Nothing in here knows about locks or reference counts; these are
//! plain values that can be serialized, parsed from configuration, and
//! printed.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

pub mod cfg;
pub mod cmd;
pub mod ip;
pub mod route;

pub use cfg::*;
pub use cmd::*;
pub use ip::*;
pub use route::*;

/// The overall version of the API. Anytime a dump type, error, or
/// configuration field is added, removed, or modified, this number
/// should increment.
pub const API_VERSION: u64 = 3;

/// A zone identifier.
///
/// Entries owned by [`ZoneId::ALL`] are shared by every zone; entries
/// with any other id are visible only to lookups made on behalf of that
/// zone (subject to the matching rules in the engine).
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
pub struct ZoneId(pub i32);

impl ZoneId {
    /// Matches any zone.
    pub const ALL: Self = Self(-1);
    pub const GLOBAL: Self = Self(0);

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::GLOBAL
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_all() { write!(f, "all") } else { write!(f, "{}", self.0) }
    }
}

impl FromStr for ZoneId {
    type Err = alloc::string::String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "all" => Ok(Self::ALL),
            "global" => Ok(Self::GLOBAL),
            _ => val
                .parse::<i32>()
                .map(Self)
                .map_err(|e| format!("bad zone id {val}: {e}")),
        }
    }
}

/// The identifier of an interface (an "ill" in illumos parlance).
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
pub struct InterfaceId(pub u32);

impl Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifier of an interface group: interfaces in the same group
/// can stand in for one another when sending.
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
pub struct GroupId(pub u32);

impl Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A security label, treated as opaque by the engine.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SecLabel {
    pub doi: u32,
    pub level: u16,
    pub compartments: alloc::vec::Vec<u32>,
}
