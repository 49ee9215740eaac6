// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
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

//! # fedstream
//!
//! Remote-object resolution for ActivityPub: fetch documents from peers ([fetch]), cache them
//! without ever fetching the same object twice at once ([cache]), walk the many sequence-valued
//! properties of the data model uniformly ([cursor], [deref]) and merge several collections into
//! one newest-first stream ([merge]).
//!
//! A typical setup:
//!
//! ```ignore
//! let cfg = config::parse_config(None)?;
//! let instruments = Arc::new(Instruments::new("fedstream"));
//! let fetcher = Arc::new(HttpFetcher::new(&cfg.fetch, instruments.clone())?);
//! let cache = Arc::new(ObjectCache::new(fetcher, Arc::new(JsonLdMarshal), &cfg.cache, instruments));
//! let inbox = cache.resolve(&inbox_page).await?;
//! let outbox = cache.resolve(&outbox_page).await?;
//! let mut stream = merge::merge(
//!     [cursor::begin_collection(&inbox)?, cursor::begin_collection(&outbox)?],
//!     cache.clone(),
//! ).await;
//! while !cursor::is_at_end(&stream) {
//!     // render stream.value()...
//!     stream = stream.advance().await;
//! }
//! cache.close().await?;
//! ```
pub mod cache;
pub mod config;
pub mod cursor;
pub mod deref;
pub mod document;
pub mod fetch;
pub mod marshal;
pub mod merge;
pub mod metrics;

#[cfg(test)]
mod test_support;
