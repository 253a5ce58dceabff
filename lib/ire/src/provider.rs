// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers let the engine run in different contexts by plugging in
//! implementations of the services it consumes but does not own:
//! logging, next-hop resolution, and security-label policy. If a
//! service doesn't have at least two obvious implementations it
//! probably doesn't need to be a provider.

use crate::api::SecLabel;
use crate::engine::ill::Ill;
use crate::engine::nce::NeighborEntry;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::fmt::Display;

/// The set of all platform-specific providers required by an engine.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub resolver: Box<dyn NeighborResolver>,
    pub label: Box<dyn LabelPolicy>,
}

impl Providers {
    /// Log to stdout, leave neighbor bindings for the caller to
    /// resolve, and accept every label.
    #[cfg(any(feature = "std", test))]
    pub fn println() -> Self {
        Self {
            log: Box::new(PrintlnLog),
            resolver: Box::new(NoResolver),
            label: Box::new(PermitLabels),
        }
    }

    /// Like [`Providers::println`], but silent.
    pub fn quiet() -> Self {
        Self {
            log: Box::new(NullLog),
            resolver: Box::new(NoResolver),
            label: Box::new(PermitLabels),
        }
    }
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// For example, in a unit test this could map to `println!`. In a
/// daemon it would map to a structured logger.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[cfg(any(feature = "std", test))]
#[derive(Clone, Copy)]
pub struct PrintlnLog;

#[cfg(any(feature = "std", test))]
impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

#[derive(Clone, Copy)]
pub struct NullLog;

impl LogProvider for NullLog {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

/// Starts link-layer resolution of a next hop.
///
/// The engine calls `resolve` once, when it creates a binding in the
/// `Initial` state. Resolution completes asynchronously: the resolver
/// (or whatever it talks to) later calls
/// [`NeighborEntry::set_reachable`] or [`NeighborEntry::set_failed`].
pub trait NeighborResolver: Send + Sync {
    fn resolve(&self, ill: &Arc<Ill>, nce: &Arc<NeighborEntry>);
}

/// Leaves every binding in `Initial` until someone else resolves it.
#[derive(Clone, Copy)]
pub struct NoResolver;

impl NeighborResolver for NoResolver {
    fn resolve(&self, _ill: &Arc<Ill>, _nce: &Arc<NeighborEntry>) {}
}

/// Security-label policy, consulted only when the engine runs in
/// labeled mode.
pub trait LabelPolicy: Send + Sync {
    /// May an entry carry `label`?
    fn admit(&self, label: &SecLabel) -> bool;

    /// Does an entry labeled `entry` satisfy a lookup made under
    /// `lookup`?
    fn matches(&self, entry: &SecLabel, lookup: &SecLabel) -> bool;
}

#[derive(Clone, Copy)]
pub struct PermitLabels;

impl LabelPolicy for PermitLabels {
    fn admit(&self, _label: &SecLabel) -> bool {
        true
    }

    fn matches(&self, entry: &SecLabel, lookup: &SecLabel) -> bool {
        entry.doi == lookup.doi
    }
}
