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

//! # The object cache
//!
//! ## Introduction
//!
//! Rendering a stream, or delivering to a set of followers, means dereferencing a great many IRIs,
//! often the same ones over & over, and often concurrently. Peers are slow, flaky & not
//! necessarily friendly, so we want to hit them as little as possible. [ObjectCache] is a small,
//! time-bounded cache of resolved documents keyed by (normalized) [Iri] with two guarantees:
//!
//! 1. at most one fetch per key is ever in flight
//! 2. everyone waiting on that fetch sees the very same outcome, be it a document or an error
//!
//! ## Design
//!
//! The map from key to entry sits behind a single [std::sync::Mutex], held only long enough to
//! look-up or insert an entry, never across I/O. Each entry carries a one-shot completion
//! primitive: the fill is spawned as its own task when the entry is created, and the entry holds a
//! [Shared] future over that task's outcome. Any number of callers may clone & await it; the first
//! to find the entry missing is the only one to cause a fetch. Since the fill runs in its own task,
//! a caller that loses interest doesn't cancel a fetch others may be sharing.
//!
//! Failed resolutions are cached just like successful ones; the error (behind an [Arc]) is the
//! answer for that key until the entry expires.
//!
//! Entries expire `ttl` after the fetch was *started*. A background task sweeps expired entries
//! from the map every `eviction-interval`; an expired entry still in the map is replaced on the
//! next lookup. An entry whose fill is still running is never considered expired, so a slow peer
//! can't provoke a second concurrent fetch of the same object.
//!
//! [Shared]: futures::future::Shared

use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{debug, info, warn};

use fedstream_shared::Iri;

use crate::{
    config::CacheConfig,
    counter_add,
    document::FederatedDocument,
    fetch::Fetcher,
    gauge_setu,
    marshal::Marshal,
    metrics::{self, Instruments, Sort},
};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Ways in which filling a cache entry can fail
#[derive(Debug, Snafu)]
pub enum FillError {
    #[snafu(display("The fill task for {iri} failed to complete: {source}"))]
    Abandoned {
        iri: Iri,
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Fetch { source: crate::fetch::Error },
    #[snafu(display("Requested {requested}, but the peer answered with {found}"))]
    IdentityMismatch {
        requested: Iri,
        found: Iri,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode {iri}: {source}"))]
    Marshal {
        iri: Iri,
        source: crate::marshal::Error,
    },
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to resolve {iri}: {source}"))]
    Resolve { iri: Iri, source: Arc<FillError> },
    #[snafu(display("The eviction task failed: {source}"))]
    Sweeper {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timed-out waiting for the eviction task to exit: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

impl Error {
    /// The shared outcome of a failed fill; every waiter on that fill gets the same [Arc]
    pub fn fill_error(&self) -> Option<&Arc<FillError>> {
        match self {
            Error::Resolve { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Resolver                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Map an [Iri] to its document, by whatever means
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, iri: &Iri) -> Result<Arc<FederatedDocument>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ObjectCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("cache.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.evictions", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.fills.failed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.entries", Sort::IntegralGauge) }

type Outcome = StdResult<Arc<FederatedDocument>, Arc<FillError>>;

struct CacheEntry {
    requested_at: Instant,
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

impl CacheEntry {
    /// Spawn the (one & only) fill for `iri`
    fn fill(
        iri: Iri,
        fetcher: Arc<dyn Fetcher>,
        marshal: Arc<dyn Marshal>,
        instruments: Arc<Instruments>,
    ) -> CacheEntry {
        let handle: JoinHandle<Outcome> =
            tokio::spawn(fill(iri.clone(), fetcher, marshal, instruments));
        CacheEntry {
            requested_at: Instant::now(),
            outcome: async move {
                handle
                    .await
                    .unwrap_or_else(|err| Err(Arc::new(AbandonedSnafu { iri }.into_error(err))))
            }
            .boxed()
            .shared(),
        }
    }
    fn is_complete(&self) -> bool {
        // `peek` only sees the outcome once some waiter has polled it to completion; if every
        // waiter went away early, poll it ourselves (it's just a `JoinHandle` underneath).
        self.outcome.peek().is_some() || self.outcome.clone().now_or_never().is_some()
    }
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.requested_at) > ttl && self.is_complete()
    }
}

async fn fill(
    iri: Iri,
    fetcher: Arc<dyn Fetcher>,
    marshal: Arc<dyn Marshal>,
    instruments: Arc<Instruments>,
) -> Outcome {
    let result: StdResult<Arc<FederatedDocument>, FillError> = async {
        let bytes = fetcher.get(&iri).await.context(FetchSnafu)?;
        let document = marshal
            .bytes_to_document(&bytes)
            .context(MarshalSnafu { iri: iri.clone() })?;
        ensure!(
            document.id() == &iri,
            IdentityMismatchSnafu {
                requested: iri.clone(),
                found: document.id().clone(),
            }
        );
        Ok(Arc::new(document))
    }
    .await;
    result.map_err(|err| {
        warn!("Failed to resolve {iri}: {err}");
        counter_add!(instruments, "cache.fills.failed", 1, &[]);
        Arc::new(err)
    })
}

type EntryMap = Arc<Mutex<HashMap<Iri, Arc<CacheEntry>>>>;

/// Remove every expired entry from `map`; return the number removed
fn evict(map: &EntryMap, ttl: Duration, instruments: &Instruments) -> usize {
    let now = Instant::now();
    let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
    let before = map.len();
    map.retain(|_, entry| !entry.is_expired(now, ttl));
    let evicted = before - map.len();
    if evicted > 0 {
        counter_add!(instruments, "cache.evictions", evicted as u64, &[]);
    }
    gauge_setu!(instruments, "cache.entries", map.len() as u64, &[]);
    evicted
}

/// The background eviction task
async fn sweep(
    map: EntryMap,
    ttl: Duration,
    interval: Duration,
    instruments: Arc<Instruments>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let evicted = evict(&map, ttl, &instruments);
                debug!("Eviction pass removed {evicted} entries");
            }
            _ = shutdown.notified() => {
                info!("Object cache eviction task shutting down");
                break;
            }
        }
    }
}

struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Deduplicating, TTL-bound cache of resolved [FederatedDocument]s
pub struct ObjectCache {
    map: EntryMap,
    fetcher: Arc<dyn Fetcher>,
    marshal: Arc<dyn Marshal>,
    instruments: Arc<Instruments>,
    ttl: Duration,
    shutdown_timeout: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ObjectCache {
    /// Create a new cache & start its eviction task; must be called from within a Tokio runtime
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        marshal: Arc<dyn Marshal>,
        config: &CacheConfig,
        instruments: Arc<Instruments>,
    ) -> ObjectCache {
        let map: EntryMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(sweep(
            map.clone(),
            config.ttl,
            config.eviction_interval,
            instruments.clone(),
            shutdown.clone(),
        ));
        ObjectCache {
            map,
            fetcher,
            marshal,
            instruments,
            ttl: config.ttl,
            shutdown_timeout: config.shutdown_timeout,
            sweeper: Mutex::new(Some(Sweeper { handle, shutdown })),
        }
    }
    /// Look-up the entry for `iri`, creating it (and starting its fill) if need be
    fn entry(&self, iri: &Iri) -> Arc<CacheEntry> {
        let now = Instant::now();
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(iri) {
            Some(entry) if !entry.is_expired(now, self.ttl) => {
                debug!("Cache hit for {iri}");
                counter_add!(self.instruments, "cache.hits", 1, &[]);
                return entry.clone();
            }
            Some(_) => debug!("Cache entry for {iri} has expired"),
            None => debug!("Cache miss for {iri}"),
        }
        counter_add!(self.instruments, "cache.misses", 1, &[]);
        let entry = Arc::new(CacheEntry::fill(
            iri.clone(),
            self.fetcher.clone(),
            self.marshal.clone(),
            self.instruments.clone(),
        ));
        map.insert(iri.clone(), entry.clone());
        gauge_setu!(self.instruments, "cache.entries", map.len() as u64, &[]);
        entry
    }
    /// Stop the eviction task
    ///
    /// The task may complete one more sweep before it notices. The cache remains usable after
    /// closing (entries just won't be swept); closing twice is harmless.
    pub async fn close(&self) -> Result<()> {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Sweeper { handle, shutdown }) = sweeper {
            shutdown.notify_one();
            tokio::time::timeout(self.shutdown_timeout, handle)
                .await
                .context(ShutdownTimeoutSnafu)?
                .context(SweeperSnafu)?;
        }
        Ok(())
    }
    /// The number of entries currently in the cache (in-flight, resolved or expired-but-unswept)
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// True if there is an entry for `iri`, whether or not it's expired
    pub fn contains(&self, iri: &Iri) -> bool {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(iri)
    }
}

#[async_trait]
impl Resolver for ObjectCache {
    async fn resolve(&self, iri: &Iri) -> Result<Arc<FederatedDocument>> {
        let outcome = self.entry(iri).outcome.clone();
        outcome
            .await
            .map_err(|source| ResolveSnafu { iri: iri.clone() }.into_error(source))
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.shutdown.notify_one();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        marshal::JsonLdMarshal,
        test_support::{note, StubFetcher},
    };

    use http::StatusCode;

    /// A short TTL, so the timing tests needn't sleep for long
    fn config() -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(2),
            eviction_interval: Duration::from_secs(60),
            ..CacheConfig::default()
        }
    }

    fn cache_with(fetcher: Arc<StubFetcher>, config: &CacheConfig) -> ObjectCache {
        ObjectCache::new(
            fetcher,
            Arc::new(JsonLdMarshal),
            config,
            Arc::new(Instruments::new("fedstream-test")),
        )
    }

    fn cache_over(fetcher: Arc<StubFetcher>) -> ObjectCache {
        cache_with(fetcher, &config())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_share_one_fetch() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_millis(100)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_over(fetcher.clone());

        let results = futures::future::join_all((0..16).map(|_| cache.resolve(&iri))).await;
        assert_eq!(1, fetcher.calls());
        let first = results[0].as_ref().unwrap();
        assert_eq!(&iri, first.id());
        assert!(
            results
                .iter()
                .all(|result| Arc::ptr_eq(first, result.as_ref().unwrap()))
        );

        cache.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_entries_are_hits() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_millis(10)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_over(fetcher.clone());

        let first = cache.resolve(&iri).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = cache.resolve(&iri).await.unwrap();
        assert_eq!(1, fetcher.calls());
        assert!(Arc::ptr_eq(&first, &second));

        // Keys are normalized before lookup
        let third = cache
            .resolve(&Iri::parse("https://EXAMPLE.com//notes/1#fragment").unwrap())
            .await
            .unwrap();
        assert_eq!(1, fetcher.calls());
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_millis(10)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_over(fetcher.clone());

        let first = cache.resolve(&iri).await.unwrap();
        tokio::time::advance(Duration::from_millis(2001)).await;
        let second = cache.resolve(&iri).await.unwrap();
        assert_eq!(2, fetcher.calls());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_entries_never_expire() {
        let iri = Iri::parse("https://example.com/notes/slow").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_secs(3)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = Arc::new(cache_over(fetcher.clone()));

        let first = {
            let cache = cache.clone();
            let iri = iri.clone();
            tokio::spawn(async move { cache.resolve(&iri).await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let second = cache.resolve(&iri).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(1, fetcher.calls());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_entries() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_millis(10)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_over(fetcher.clone());

        cache.resolve(&iri).await.unwrap();
        assert!(cache.contains(&iri));
        assert_eq!(1, cache.len());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!cache.contains(&iri));
        assert!(cache.is_empty());

        // No resurrection: the next miss gets a brand-new entry
        cache.resolve(&iri).await.unwrap();
        assert_eq!(2, fetcher.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_shared_and_cached() {
        let iri = Iri::parse("https://example.com/notes/missing").unwrap();
        let fetcher = Arc::new(StubFetcher::new(Duration::from_millis(50)));
        let cache = cache_over(fetcher.clone());

        let (a, b) = futures::join!(cache.resolve(&iri), cache.resolve(&iri));
        let a = a.unwrap_err();
        let b = b.unwrap_err();
        assert!(Arc::ptr_eq(
            a.fill_error().unwrap(),
            b.fill_error().unwrap()
        ));
        assert!(matches!(
            a.fill_error().unwrap().as_ref(),
            FillError::Fetch { source } if source.status() == Some(StatusCode::NOT_FOUND)
        ));

        // Still the answer, with no further network traffic, until it expires
        let c = cache.resolve(&iri).await.unwrap_err();
        assert!(Arc::ptr_eq(
            a.fill_error().unwrap(),
            c.fill_error().unwrap()
        ));
        assert_eq!(1, fetcher.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_errors_are_refetched() {
        let iri = Iri::parse("https://example.com/notes/missing").unwrap();
        let fetcher = Arc::new(StubFetcher::new(Duration::from_millis(50)));
        let cache = cache_over(fetcher.clone());

        let first = cache.resolve(&iri).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(2001)).await;
        let second = cache.resolve(&iri).await.unwrap_err();
        assert_eq!(2, fetcher.calls());
        assert!(!Arc::ptr_eq(
            first.fill_error().unwrap(),
            second.fill_error().unwrap()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peers_stay_cached_by_default() {
        let iri = Iri::parse("https://slow.example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::from_secs(3)).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_with(fetcher.clone(), &CacheConfig::default());

        let first = cache.resolve(&iri).await.unwrap();
        let second = cache.resolve(&iri).await.unwrap();
        assert_eq!(1, fetcher.calls());
        assert!(Arc::ptr_eq(&first, &second));
        cache.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peers_may_not_answer_for_others() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::ZERO).serve(&iri, &note("https://evil.example.org/notes/1", None)),
        );
        let cache = cache_over(fetcher);

        let err = cache.resolve(&iri).await.unwrap_err();
        assert!(matches!(
            err.fill_error().unwrap().as_ref(),
            FillError::IdentityMismatch { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let iri = Iri::parse("https://example.com/notes/1").unwrap();
        let fetcher = Arc::new(
            StubFetcher::new(Duration::ZERO).serve(&iri, &note(iri.as_str(), None)),
        );
        let cache = cache_over(fetcher);
        cache.close().await.unwrap();
        cache.close().await.unwrap();
        // Still serves requests, just doesn't sweep
        assert_eq!(&iri, cache.resolve(&iri).await.unwrap().id());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_an_open_cache_stops_the_sweeper() {
        let cache = cache_over(Arc::new(StubFetcher::new(Duration::ZERO)));
        // The eviction task holds the only other reference to the map
        let map = Arc::downgrade(&cache.map);
        tokio::task::yield_now().await;
        assert_eq!(2, map.strong_count());

        drop(cache);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(0, map.strong_count());
    }
}
