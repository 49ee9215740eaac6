// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fedstream.
//
// fedstream is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fedstream is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fedstream.  If not,
// see <http://www.gnu.org/licenses/>.

//! # fedstream metrics
//!
//! fedstream reports through [OpenTelemetry]. OTel wants its "instruments" (counters, gauges &c)
//! built once & re-used, which raises the question of where to keep them. Rather than a struct
//! with a field per metric, or a central list of names that every module has to edit, each module
//! registers the metrics it uses via the [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("cache.hits", Sort::IntegralCounter) }
//! // ...
//! counter_add!(self.instruments, "cache.hits", 1, &[]);
//! ```
//!
//! [Instruments::new] walks the registrations, panics on duplicate names & pre-builds every
//! instrument, so that recording needs only `&self` and an [Instruments] can live in an `Arc`
//! shared by the fetcher & the cache.
//!
//! Looking up a name that was never registered, or using a counter name with a gauge macro, is a
//! logic error & panics.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Return the names of any metrics registered more than once
pub fn duplicate_registrations() -> Vec<&'static str> {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>)
        .filter(|reg| !names.insert(reg.name()))
        .map(Registration::name)
        .collect()
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<&'static str, Instrument>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments")
            .field("instruments", &self.map.len())
            .finish()
    }
}

impl Instruments {
    /// Build every registered instrument from the global meter named `prefix`
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<&'static str, Instrument> = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        });
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
