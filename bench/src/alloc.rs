// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A counting allocator exposed as `criterion` measurements, so that
//! benchmarks can report how many allocations a lookup or an add
//! costs.

use super::MeasurementInfo;
use criterion::Criterion;
use criterion::Throughput;
use criterion::measurement::Measurement;
use criterion::measurement::ValueFormatter;
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[global_allocator]
static BENCH_ALLOC: CountingAlloc = CountingAlloc {
    allocs: AtomicU64::new(0),
    bytes: AtomicU64::new(0),
};

// Criterion runs one benchmark at a time, so global counters are
// enough.
struct CountingAlloc {
    allocs: AtomicU64,
    bytes: AtomicU64,
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(layout.size() as u64, Ordering::Relaxed);
        // Safety: forwarded unchanged to the system allocator.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Safety: `ptr` came from `System.alloc` with this layout.
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Which allocator counter a measurement reads.
#[derive(Clone, Copy)]
pub enum AllocCounter {
    Count,
    Bytes,
}

impl AllocCounter {
    fn read(self) -> u64 {
        match self {
            Self::Count => BENCH_ALLOC.allocs.load(Ordering::Relaxed),
            Self::Bytes => BENCH_ALLOC.bytes.load(Ordering::Relaxed),
        }
    }
}

pub struct Allocs;
pub struct BytesAlloced;

impl Measurement for Allocs {
    type Intermediate = u64;
    type Value = u64;

    fn start(&self) -> u64 {
        AllocCounter::Count.read()
    }

    fn end(&self, start: u64) -> u64 {
        AllocCounter::Count.read() - start
    }

    fn add(&self, v1: &u64, v2: &u64) -> u64 {
        v1 + v2
    }

    fn zero(&self) -> u64 {
        0
    }

    fn to_f64(&self, value: &u64) -> f64 {
        *value as f64
    }

    fn formatter(&self) -> &dyn ValueFormatter {
        &COUNT_FMT
    }
}

impl Measurement for BytesAlloced {
    type Intermediate = u64;
    type Value = u64;

    fn start(&self) -> u64 {
        AllocCounter::Bytes.read()
    }

    fn end(&self, start: u64) -> u64 {
        AllocCounter::Bytes.read() - start
    }

    fn add(&self, v1: &u64, v2: &u64) -> u64 {
        v1 + v2
    }

    fn zero(&self) -> u64 {
        0
    }

    fn to_f64(&self, value: &u64) -> f64 {
        *value as f64
    }

    fn formatter(&self) -> &dyn ValueFormatter {
        &BYTES_FMT
    }
}

impl MeasurementInfo for Allocs {
    fn label() -> &'static str {
        "alloc_ct"
    }
}

impl MeasurementInfo for BytesAlloced {
    fn label() -> &'static str {
        "alloc_sz"
    }
}

/// Per-operation counts are small, so values are never scaled.
struct UnitFormatter(&'static str);

static COUNT_FMT: UnitFormatter = UnitFormatter("");
static BYTES_FMT: UnitFormatter = UnitFormatter("B");

impl ValueFormatter for UnitFormatter {
    fn scale_values(&self, _typical: f64, _values: &mut [f64]) -> &'static str {
        self.0
    }

    fn scale_throughputs(
        &self,
        _typical: f64,
        _throughput: &Throughput,
        _values: &mut [f64],
    ) -> &'static str {
        self.0
    }

    fn scale_for_machines(&self, _values: &mut [f64]) -> &'static str {
        self.0
    }
}

/// A [`Criterion`] tuned for allocation counts, which do not vary
/// between samples the way wall time does.
pub fn new_crit<M: Measurement>(measurement: M) -> Criterion<M> {
    Criterion::default()
        .with_measurement(measurement)
        .sample_size(10)
        .warm_up_time(Duration::from_nanos(1))
        .measurement_time(Duration::from_micros(10))
        .nresamples(1)
        .without_plots()
}
