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

//! # Merging streams
//!
//! [merge] combines any number of cursors (an inbox page & an outbox page, say) into a single
//! cursor that yields their entries newest-first. Since an entry may be a bare [Iri], each source's
//! head has to be dereferenced before it can be compared; that happens through a [Resolver].
//!
//! A source whose head can't be resolved is "dead": it's logged & dropped from the merge for good,
//! and the merge carries on with the remaining sources. A merge over nothing but empty, exhausted
//! or dead sources is simply [at_end], not an error.
//!
//! Documents with no published timestamp sort after everything that has one. Ties go to the source
//! that came first in the input.
//!
//! Like every other [Cursor], a merged cursor is a snapshot; [Cursor::advance] builds a new one.
//! Finding the next head is a linear scan over the live sources, of which there are only ever a
//! handful.
//!
//! [Iri]: fedstream_shared::Iri

use async_trait::async_trait;
use tracing::{debug, warn};

use fedstream_shared::Iri;

use crate::{
    cache::Resolver,
    cursor::{at_end, is_at_end, Cursor, CursorRef},
    deref::dereference,
    document::FederatedDocument,
};

use std::sync::Arc;

/// One live input to a merge: its current (substantive) position & the document found there
#[derive(Clone, Debug)]
struct Source {
    // position in the caller's list of sources
    ordinal: usize,
    cursor: CursorRef,
    document: Arc<FederatedDocument>,
}

/// Move `cursor` to its next substantive position & dereference it; `None` means the source is
/// exhausted or dead
async fn settle(ordinal: usize, cursor: CursorRef, resolver: &dyn Resolver) -> Option<Source> {
    let mut cursor = cursor;
    while !is_at_end(&cursor) && !cursor.has_any() {
        cursor = cursor.advance().await;
    }
    if is_at_end(&cursor) {
        debug!("Merge source {ordinal} is exhausted");
        return None;
    }
    match dereference(cursor.as_ref(), resolver).await {
        Ok(document) => Some(Source {
            ordinal,
            cursor,
            document,
        }),
        Err(err) => {
            warn!("Dropping merge source {ordinal}: {err}");
            None
        }
    }
}

/// Index of the source with the most recent document
///
/// `sources` is kept in ordinal order & we only move on a strictly greater timestamp, so ties go
/// to the earliest source. `None` compares less than any `Some`.
fn newest(sources: &[Source]) -> usize {
    sources
        .iter()
        .enumerate()
        .skip(1)
        .fold(0, |best, (idx, source)| {
            if source.document.published() > sources[best].document.published() {
                idx
            } else {
                best
            }
        })
}

/// A [Cursor] over the chronological merge of several others
pub struct MergedCursor {
    resolver: Arc<dyn Resolver>,
    // Non-empty, every one live, in ordinal order
    sources: Vec<Source>,
    head: usize,
}

impl std::fmt::Debug for MergedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedCursor")
            .field("sources", &self.sources)
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl MergedCursor {
    fn from_sources(sources: Vec<Source>, resolver: Arc<dyn Resolver>) -> CursorRef {
        if sources.is_empty() {
            debug!("No live merge sources remain");
            at_end()
        } else {
            let head = newest(&sources);
            Arc::new(MergedCursor {
                resolver,
                sources,
                head,
            })
        }
    }
}

#[async_trait]
impl Cursor for MergedCursor {
    fn has_any(&self) -> bool {
        true
    }
    // The head has always been dereferenced
    fn reference(&self) -> Option<&Iri> {
        None
    }
    fn value(&self) -> Option<&Arc<FederatedDocument>> {
        Some(&self.sources[self.head].document)
    }
    async fn advance(&self) -> CursorRef {
        let mut sources = self.sources.clone();
        let winner = sources.remove(self.head);
        let next = winner.cursor.advance().await;
        if let Some(source) = settle(winner.ordinal, next, self.resolver.as_ref()).await {
            // Back where it was, preserving ordinal order
            sources.insert(self.head, source);
        }
        MergedCursor::from_sources(sources, self.resolver.clone())
    }
}

/// Merge `sources` into a single, newest-first cursor
///
/// Each source's head is resolved in turn before this returns; sources that are exhausted, or
/// whose head can't be resolved, are dropped.
pub async fn merge<I>(sources: I, resolver: Arc<dyn Resolver>) -> CursorRef
where
    I: IntoIterator<Item = CursorRef>,
{
    let mut live = Vec::new();
    for (ordinal, cursor) in sources.into_iter().enumerate() {
        if let Some(source) = settle(ordinal, cursor, resolver.as_ref()).await {
            live.push(source);
        }
    }
    MergedCursor::from_sources(live, resolver)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        cursor::{SequenceCursor, Slot},
        test_support::{note, StubResolver},
    };

    fn reference(iri: &str) -> Slot {
        Slot::Reference(Iri::parse(iri).unwrap())
    }

    fn inline(iri: &str, published: Option<&str>) -> Slot {
        Slot::Inline(Arc::new(note(iri, published)))
    }

    /// Walk `cursor` to the end, returning the ids of the documents it yields
    async fn drain(cursor: CursorRef) -> Vec<String> {
        let mut cursor = cursor;
        let mut ids = Vec::new();
        while !is_at_end(&cursor) {
            ids.push(cursor.value().unwrap().id().to_string());
            cursor = cursor.advance().await;
        }
        ids
    }

    fn resolver() -> Arc<StubResolver> {
        Arc::new(
            StubResolver::default()
                .with(note("https://a.example/1", Some("2025-01-01T00:00:01Z")))
                .with(note("https://a.example/3", Some("2025-01-01T00:00:03Z")))
                .with(note("https://a.example/5", Some("2025-01-01T00:00:05Z"))),
        )
    }

    #[tokio::test]
    async fn newest_first() {
        let a = SequenceCursor::begin([
            reference("https://a.example/3"),
            reference("https://a.example/1"),
        ]);
        let b = SequenceCursor::begin([inline("https://b.example/2", Some("2025-01-01T00:00:02Z"))]);
        assert_eq!(
            vec![
                "https://a.example/3",
                "https://b.example/2",
                "https://a.example/1"
            ],
            drain(merge([a, b], resolver()).await).await
        );
    }

    #[tokio::test]
    async fn dead_sources_are_dropped_silently() {
        let a = || SequenceCursor::begin([reference("https://a.example/5")]);
        let b = SequenceCursor::begin([reference("https://b.example/missing")]);
        let merged = merge([a(), b], resolver()).await;
        assert_eq!(
            drain(merge([a()], resolver()).await).await,
            drain(merged).await
        );
    }

    #[tokio::test]
    async fn sources_that_die_midstream_stay_dead() {
        let a = SequenceCursor::begin([
            reference("https://a.example/5"),
            reference("https://a.example/missing"),
            reference("https://a.example/1"),
        ]);
        let b = SequenceCursor::begin([
            Slot::Unrecognized,
            inline("https://b.example/3", Some("2025-01-01T00:00:03Z")),
        ]);
        let merged = merge([a, b], resolver()).await;
        assert_eq!(
            vec!["https://a.example/5", "https://b.example/3"],
            drain(merged).await
        );
    }

    #[tokio::test]
    async fn nothing_to_merge() {
        assert!(is_at_end(&merge(Vec::<CursorRef>::new(), resolver()).await));
        assert!(is_at_end(
            &merge(
                [
                    at_end(),
                    SequenceCursor::begin([Slot::Unrecognized, Slot::Unrecognized]),
                    SequenceCursor::begin([reference("https://b.example/missing")]),
                ],
                resolver()
            )
            .await
        ));
    }

    #[tokio::test]
    async fn undated_documents_sort_last_and_ties_are_consistent() {
        let sources = || {
            [
                SequenceCursor::begin([inline("https://a.example/undated", None)]),
                SequenceCursor::begin([inline("https://b.example/x", Some("2025-01-01T00:00:07Z"))]),
                SequenceCursor::begin([inline("https://c.example/y", Some("2025-01-01T00:00:07Z"))]),
            ]
        };
        let first = drain(merge(sources(), resolver()).await).await;
        let second = drain(merge(sources(), resolver()).await).await;
        assert_eq!(first, second);
        assert_eq!(3, first.len());
        assert_eq!("https://a.example/undated", first[2]);
    }

    #[tokio::test]
    async fn merged_cursors_are_snapshots() {
        let a = SequenceCursor::begin([
            reference("https://a.example/5"),
            reference("https://a.example/1"),
        ]);
        let b = SequenceCursor::begin([reference("https://a.example/3")]);
        let m0 = merge([a, b], resolver()).await;
        let m1 = m0.advance().await;
        let m2 = m1.advance().await;
        assert_eq!("https://a.example/5", m0.value().unwrap().id().as_str());
        assert_eq!("https://a.example/3", m1.value().unwrap().id().as_str());
        assert_eq!("https://a.example/1", m2.value().unwrap().id().as_str());
        // Advancing an old snapshot again gives the same answer
        assert_eq!(
            m1.value().unwrap().id(),
            m0.advance().await.value().unwrap().id()
        );
        assert!(is_at_end(&m2.advance().await));
    }

    #[tokio::test]
    async fn merges_nest() {
        let resolver = resolver();
        let inner = merge(
            [
                SequenceCursor::begin([reference("https://a.example/5")]),
                SequenceCursor::begin([reference("https://a.example/1")]),
            ],
            resolver.clone(),
        )
        .await;
        let outer = merge(
            [
                inner,
                SequenceCursor::begin([reference("https://a.example/3")]),
            ],
            resolver.clone(),
        )
        .await;
        assert_eq!(
            vec![
                "https://a.example/5",
                "https://a.example/3",
                "https://a.example/1"
            ],
            drain(outer).await
        );
        // Each reference resolved exactly once
        assert_eq!(3, resolver.calls());
    }
}
