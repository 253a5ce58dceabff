// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Userland stand-ins for the kernel services the engine is written
//! against: locks, a monotonic clock, and named statistics.
pub mod kstat;
pub mod sync;
pub mod time;
