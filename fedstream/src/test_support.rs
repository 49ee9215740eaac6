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

//! Fakes shared by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use fedstream_shared::Iri;

use crate::{
    cache::{self, FillError, Resolver},
    document::{FederatedDocument, Kind},
    fetch::{self, Fetcher},
    marshal::{JsonLdMarshal, Marshal},
};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub fn not_found(iri: &Iri) -> fetch::Error {
    fetch::Error::ProtocolStatus {
        iri: iri.clone(),
        status: StatusCode::NOT_FOUND,
        body: None,
    }
}

/// A Note at `iri`, optionally published at `published` (RFC 3339)
pub fn note(iri: &str, published: Option<&str>) -> FederatedDocument {
    let doc = FederatedDocument::new(Iri::parse(iri).unwrap(), Kind::Note);
    match published {
        Some(published) => doc.with_published(published.parse().unwrap()),
        None => doc,
    }
}

/// A [Fetcher] that serves canned bodies after a fixed delay & counts calls
pub struct StubFetcher {
    calls: AtomicUsize,
    bodies: HashMap<Iri, Bytes>,
    delay: Duration,
}

impl StubFetcher {
    pub fn new(delay: Duration) -> StubFetcher {
        StubFetcher {
            calls: AtomicUsize::new(0),
            bodies: HashMap::new(),
            delay,
        }
    }
    /// Serve `document` (JSON-LD encoded) when asked for `iri`
    pub fn serve(mut self, iri: &Iri, document: &FederatedDocument) -> StubFetcher {
        self.bodies.insert(
            iri.clone(),
            JsonLdMarshal.document_to_bytes(document).unwrap(),
        );
        self
    }
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn get(&self, iri: &Iri) -> fetch::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.bodies
            .get(iri)
            .cloned()
            .ok_or_else(|| not_found(iri))
    }
    async fn post(&self, _body: Bytes, _iri: &Iri) -> fetch::Result<()> {
        Ok(())
    }
}

/// A [Resolver] over a fixed set of documents; anything else is a 404
#[derive(Default)]
pub struct StubResolver {
    calls: AtomicUsize,
    documents: HashMap<Iri, Arc<FederatedDocument>>,
}

impl StubResolver {
    pub fn with(mut self, document: FederatedDocument) -> StubResolver {
        self.documents
            .insert(document.id().clone(), Arc::new(document));
        self
    }
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(&self, iri: &Iri) -> cache::Result<Arc<FederatedDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.documents
            .get(iri)
            .cloned()
            .ok_or_else(|| cache::Error::Resolve {
                iri: iri.clone(),
                source: Arc::new(FillError::Fetch {
                    source: not_found(iri),
                }),
            })
    }
}
