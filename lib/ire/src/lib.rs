// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IRE engine: a concurrent, reference-counted store of route and
//! cache entries.
//!
//! Forwarding-table entries are the declared routes; cache-table
//! entries are resolved next hops. Both tables are made of buckets
//! that readers walk without holding the bucket lock, using the
//! walker count in [`engine::bucket::EntryBucket`] to defer physical
//! removal of deleted entries until no walk can observe them.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

extern crate alloc;

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as ire;

pub use ire_api as api;

pub mod ddi;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;

// ================================================================
// DTrace USDT Provider
//
// Probes fire on every table mutation so that churn can be observed
// from outside the process.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod ire_provider {
    fn entry__add(table: &str, dest: &str, kind: &str, dup: u8) {}
    fn entry__condemn(table: &str, dest: &str, kind: &str) {}
    fn entry__delete(table: &str, dest: &str, kind: &str) {}
    fn bucket__sweep(table: &str, swept: u64) {}
    fn cache__flush(dest: &str, reason: &str, flushed: u64) {}
    fn cache__evict(bucket: u64, temp: u64, idle: u64) {}
    fn add__deferred(dest: &str, ill: &str) {}
}
