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

//! # Dereferencing cursor positions
//!
//! Turning a cursor position into a document: inline documents are returned as-is, references go
//! through a [Resolver] (in production, the [ObjectCache]).
//!
//! [ObjectCache]: crate::cache::ObjectCache

use snafu::{prelude::*, Backtrace};

use fedstream_shared::Iri;

use crate::{
    cache::Resolver,
    cursor::{is_at_end, Cursor, CursorRef},
    document::FederatedDocument,
};

use std::sync::Arc;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The cursor position holds neither a reference nor a document"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Resolve { source: crate::cache::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return the document at `cursor`, resolving it if it's a reference
pub async fn dereference(
    cursor: &dyn Cursor,
    resolver: &dyn Resolver,
) -> Result<Arc<FederatedDocument>> {
    match cursor.reference() {
        Some(iri) => resolver.resolve(iri).await.context(ResolveSnafu),
        None => cursor.value().cloned().context(EmptySnafu),
    }
}

/// Return the [Iri] at `cursor` without touching the network
pub fn identity(cursor: &dyn Cursor) -> Result<Iri> {
    cursor
        .reference()
        .cloned()
        .or_else(|| cursor.value().map(|document| document.id().clone()))
        .context(EmptySnafu)
}

/// Return the [Iri]s of every substantive position from `cursor` on, without touching the network
pub async fn identities(cursor: CursorRef) -> Vec<Iri> {
    let mut cursor = cursor;
    let mut iris = Vec::new();
    while !is_at_end(&cursor) {
        if let Ok(iri) = identity(cursor.as_ref()) {
            iris.push(iri);
        }
        cursor = cursor.advance().await;
    }
    iris
}

/// Dereference every substantive position from `cursor` on, in order
///
/// Positions holding neither a reference nor a document are skipped; the first failure to resolve
/// aborts the traversal.
pub async fn collect(
    cursor: CursorRef,
    resolver: &dyn Resolver,
) -> Result<Vec<Arc<FederatedDocument>>> {
    let mut cursor = cursor;
    let mut documents = Vec::new();
    while !is_at_end(&cursor) {
        if cursor.has_any() {
            documents.push(dereference(cursor.as_ref(), resolver).await?);
        }
        cursor = cursor.advance().await;
    }
    Ok(documents)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        cache::ObjectCache,
        config::CacheConfig,
        cursor::{at_end, SequenceCursor, Slot},
        marshal::JsonLdMarshal,
        metrics::Instruments,
        test_support::{note, StubFetcher, StubResolver},
    };

    use std::time::Duration;

    fn reference(iri: &str) -> Slot {
        Slot::Reference(Iri::parse(iri).unwrap())
    }

    fn inline(document: FederatedDocument) -> Slot {
        Slot::Inline(Arc::new(document))
    }

    #[tokio::test]
    async fn inline_values_need_no_network() {
        let resolver = StubResolver::default();
        let cursor = SequenceCursor::begin([inline(note(
            "https://example.com/notes/1",
            Some("2025-01-01T00:00:00Z"),
        ))]);
        let document = dereference(cursor.as_ref(), &resolver).await.unwrap();
        assert_eq!("https://example.com/notes/1", document.id().as_str());
        assert!(Arc::ptr_eq(cursor.value().unwrap(), &document));
        assert_eq!(0, resolver.calls());
    }

    #[tokio::test]
    async fn references_are_resolved() {
        let resolver = StubResolver::default().with(note("https://example.com/notes/1", None));
        let cursor = SequenceCursor::begin([
            reference("https://example.com/notes/1"),
            reference("https://example.com/notes/2"),
            Slot::Unrecognized,
        ]);
        let document = dereference(cursor.as_ref(), &resolver).await.unwrap();
        assert_eq!(cursor.reference(), Some(document.id()));

        let cursor = cursor.advance().await;
        assert!(matches!(
            dereference(cursor.as_ref(), &resolver).await,
            Err(Error::Resolve { .. })
        ));
        let cursor = cursor.advance().await;
        assert!(matches!(
            dereference(cursor.as_ref(), &resolver).await,
            Err(Error::Empty { .. })
        ));
        assert!(matches!(
            dereference(at_end().as_ref(), &resolver).await,
            Err(Error::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn dereferenced_identity_matches_the_reference() {
        let iris = [
            "https://example.com/notes/1",
            "https://example.com/notes/2",
            "https://example.com/notes/3",
        ];
        let fetcher = iris.iter().fold(StubFetcher::new(Duration::ZERO), |f, iri| {
            f.serve(&Iri::parse(iri).unwrap(), &note(iri, None))
        });
        let cache = ObjectCache::new(
            Arc::new(fetcher),
            Arc::new(JsonLdMarshal),
            &CacheConfig::default(),
            Arc::new(Instruments::new("fedstream-test")),
        );
        let mut cursor = SequenceCursor::begin(iris.iter().map(|iri| reference(iri)));
        while !is_at_end(&cursor) {
            let document = dereference(cursor.as_ref(), &cache).await.unwrap();
            assert_eq!(cursor.reference(), Some(document.id()));
            cursor = cursor.advance().await;
        }
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn identities_without_network() {
        let cursor = SequenceCursor::begin([
            reference("https://example.com/notes/1"),
            Slot::Unrecognized,
            inline(note("https://example.com/notes/2", None)),
        ]);
        assert_eq!(
            vec![
                Iri::parse("https://example.com/notes/1").unwrap(),
                Iri::parse("https://example.com/notes/2").unwrap()
            ],
            identities(cursor.clone()).await
        );
        assert!(matches!(
            identity(cursor.advance().await.as_ref()),
            Err(Error::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn collect_aborts_on_first_failure() {
        let resolver = StubResolver::default()
            .with(note("https://example.com/notes/1", None))
            .with(note("https://example.com/notes/3", None));

        let documents = collect(
            SequenceCursor::begin([
                reference("https://example.com/notes/1"),
                Slot::Unrecognized,
                inline(note("https://example.com/notes/2", None)),
                reference("https://example.com/notes/3"),
            ]),
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(
            vec![
                "https://example.com/notes/1",
                "https://example.com/notes/2",
                "https://example.com/notes/3"
            ],
            documents
                .iter()
                .map(|document| document.id().as_str())
                .collect::<Vec<_>>()
        );

        let before = resolver.calls();
        let result = collect(
            SequenceCursor::begin([
                reference("https://example.com/notes/404"),
                reference("https://example.com/notes/1"),
            ]),
            &resolver,
        )
        .await;
        assert!(matches!(result, Err(Error::Resolve { .. })));
        assert_eq!(before + 1, resolver.calls());

        assert!(collect(at_end(), &resolver).await.unwrap().is_empty());
    }
}
