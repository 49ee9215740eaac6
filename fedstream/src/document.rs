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

//! # Federated Documents
//!
//! A [FederatedDocument] is our decoded view of one ActivityStreams object, actor, activity or
//! collection (page). We only care about three of its attributes directly: its identity (an
//! [Iri]), its [Kind] and, when present, its "published" timestamp (used for ordering &
//! nothing else). Everything else is retained verbatim as JSON so that sequence-valued properties
//! (`orderedItems`, `to`, `object` & so on) can be traversed later.
//!
//! Documents are immutable value objects once built; the cache hands them out as
//! `Arc<FederatedDocument>`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use snafu::{prelude::*, Backtrace};

use fedstream_shared::Iri;

use std::{fmt::Display, str::FromStr};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The document's id ({text}) is not a valid IRI: {source}"))]
    BadId {
        text: String,
        source: fedstream_shared::Error,
    },
    #[snafu(display("The document's published timestamp ({text}) is not RFC 3339: {source}"))]
    BadPublished {
        text: String,
        source: chrono::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("The document's {property} property is not a string"))]
    NotAString {
        property: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("The document has no id"))]
    NoId { backtrace: Backtrace },
    #[snafu(display("The document has no type"))]
    NoType { backtrace: Backtrace },
    #[snafu(display("Unsupported document type {text}"))]
    UnsupportedKind { text: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Kind                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The ActivityStreams types we know how to handle
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    // Activities
    Accept,
    Announce,
    Create,
    Delete,
    Follow,
    Like,
    Undo,
    Update,
    // Objects
    Article,
    Image,
    Note,
    Page,
    Tombstone,
    // Actors
    Application,
    Group,
    Organization,
    Person,
    Service,
    // Collections
    Collection,
    CollectionPage,
    OrderedCollection,
    OrderedCollectionPage,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Accept => "Accept",
            Kind::Announce => "Announce",
            Kind::Create => "Create",
            Kind::Delete => "Delete",
            Kind::Follow => "Follow",
            Kind::Like => "Like",
            Kind::Undo => "Undo",
            Kind::Update => "Update",
            Kind::Article => "Article",
            Kind::Image => "Image",
            Kind::Note => "Note",
            Kind::Page => "Page",
            Kind::Tombstone => "Tombstone",
            Kind::Application => "Application",
            Kind::Group => "Group",
            Kind::Organization => "Organization",
            Kind::Person => "Person",
            Kind::Service => "Service",
            Kind::Collection => "Collection",
            Kind::CollectionPage => "CollectionPage",
            Kind::OrderedCollection => "OrderedCollection",
            Kind::OrderedCollectionPage => "OrderedCollectionPage",
        }
    }
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Kind::Collection
                | Kind::CollectionPage
                | Kind::OrderedCollection
                | Kind::OrderedCollectionPage
        )
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Ok(match s {
            "Accept" => Kind::Accept,
            "Announce" => Kind::Announce,
            "Create" => Kind::Create,
            "Delete" => Kind::Delete,
            "Follow" => Kind::Follow,
            "Like" => Kind::Like,
            "Undo" => Kind::Undo,
            "Update" => Kind::Update,
            "Article" => Kind::Article,
            "Image" => Kind::Image,
            "Note" => Kind::Note,
            "Page" => Kind::Page,
            "Tombstone" => Kind::Tombstone,
            "Application" => Kind::Application,
            "Group" => Kind::Group,
            "Organization" => Kind::Organization,
            "Person" => Kind::Person,
            "Service" => Kind::Service,
            "Collection" => Kind::Collection,
            "CollectionPage" => Kind::CollectionPage,
            "OrderedCollection" => Kind::OrderedCollection,
            "OrderedCollectionPage" => Kind::OrderedCollectionPage,
            _ => {
                return UnsupportedKindSnafu {
                    text: s.to_owned(),
                }
                .fail();
            }
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       FederatedDocument                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Decoded, in-memory representation of a single ActivityStreams document
#[derive(Clone, Debug, PartialEq)]
pub struct FederatedDocument {
    id: Iri,
    kind: Kind,
    published: Option<DateTime<Utc>>,
    // Everything other than `@context`, `id`, `type` & `published`
    properties: Map<String, Value>,
}

impl FederatedDocument {
    pub fn new(id: Iri, kind: Kind) -> FederatedDocument {
        FederatedDocument {
            id,
            kind,
            published: None,
            properties: Map::new(),
        }
    }
    pub fn with_published(mut self, published: DateTime<Utc>) -> FederatedDocument {
        self.published = Some(published);
        self
    }
    /// Set an arbitrary property; the four properties with dedicated fields are ignored
    pub fn with_property(mut self, name: &str, value: Value) -> FederatedDocument {
        if !matches!(name, "@context" | "id" | "type" | "published") {
            self.properties.insert(name.to_owned(), value);
        }
        self
    }
    /// Decode a JSON object into a [FederatedDocument]
    ///
    /// `type` may be either a string or an array of strings, in which case the first supported
    /// type wins (some implementations emit `["Person", "schema:Person"]`, e.g.).
    pub fn from_map(mut map: Map<String, Value>) -> Result<FederatedDocument> {
        map.remove("@context");
        let id = match map.remove("id").context(NoIdSnafu)? {
            Value::String(text) => Iri::parse(&text).context(BadIdSnafu { text })?,
            _ => return NotAStringSnafu { property: "id" }.fail(),
        };
        let kind = match map.remove("type").context(NoTypeSnafu)? {
            Value::String(text) => text.parse::<Kind>()?,
            Value::Array(types) => {
                let mut first: Option<String> = None;
                let mut found: Option<Kind> = None;
                for ty in types.iter().filter_map(Value::as_str) {
                    first.get_or_insert_with(|| ty.to_owned());
                    if let Ok(kind) = ty.parse::<Kind>() {
                        found = Some(kind);
                        break;
                    }
                }
                match (found, first) {
                    (Some(kind), _) => kind,
                    (None, Some(text)) => return UnsupportedKindSnafu { text }.fail(),
                    (None, None) => return NoTypeSnafu.fail(),
                }
            }
            _ => return NotAStringSnafu { property: "type" }.fail(),
        };
        let published = match map.remove("published") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(
                DateTime::parse_from_rfc3339(&text)
                    .context(BadPublishedSnafu { text })?
                    .with_timezone(&Utc),
            ),
            Some(_) => {
                return NotAStringSnafu {
                    property: "published",
                }
                .fail();
            }
        };
        Ok(FederatedDocument {
            id,
            kind,
            published,
            properties: map,
        })
    }
    /// Encode this document as a JSON object (without `@context`)
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::with_capacity(self.properties.len() + 3);
        map.insert("id".to_owned(), Value::String(self.id.to_string()));
        map.insert("type".to_owned(), Value::String(self.kind.to_string()));
        if let Some(published) = &self.published {
            map.insert(
                "published".to_owned(),
                Value::String(published.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            );
        }
        map.extend(
            self.properties
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        map
    }
    pub fn id(&self) -> &Iri {
        &self.id
    }
    pub fn kind(&self) -> Kind {
        self.kind
    }
    pub fn published(&self) -> Option<&DateTime<Utc>> {
        self.published.as_ref()
    }
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }
}
