// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named statistics in the style of `kstat_create(9F)`.
use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// A provider of named kstats.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// # Example
///
/// To declare a new kstat provider simply define a struct of named
/// fields with type [`KStatU64`] and derive [`KStatProvider`].
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct SomeStats {
///     inserted: KStatU64,
///     deleted: KStatU64,
/// }
/// ```
///
/// Counters are bumped through a shared reference.
///
/// ```ignore
/// stats.vals.inserted.incr(1);
/// ```
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// An initialized [`KStatProvider`] registered under a module and
/// name.
///
/// There is no kstat framework to register with in userland; the
/// module and name are kept for reporting.
pub struct KStatNamed<T: KStatProvider> {
    module: String,
    name: String,
    pub vals: Box<T>,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        mut provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        if module.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(module.into()));
        }
        if name.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(name.into()));
        }
        provider.init()?;
        Ok(Self {
            module: module.into(),
            name: name.into(),
            vals: Box::new(provider),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The longest kstat name, including the terminating NUL.
pub const KSTAT_STRLEN: usize = 31;

/// A 64-bit unsigned named kstat.
///
/// Updates are relaxed atomics: individual counters never tear, but a
/// snapshot of several counters is not taken atomically as a group.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: AtomicU64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        if name.len() >= KSTAT_STRLEN {
            return Err(Error::NameTooLong(name.into()));
        }
        Ok(())
    }

    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum Error {
    NameTooLong(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NameTooLong(s) => write!(f, "name too long: {s}"),
        }
    }
}
