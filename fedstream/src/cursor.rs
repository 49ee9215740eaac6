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

//! # Cursors
//!
//! ActivityStreams is full of sequences: the `orderedItems` of an outbox page, the `items` of a
//! followers collection, the `to`, `cc` & `tag` of a note, and so on. Each position in such a
//! sequence is either a bare [Iri] (a *reference* that must be dereferenced to be useful), an
//! inline document, or something we don't understand (a `Link`, say, or a number). Structurally
//! they're all the same, so there is one [Cursor] trait & one implementation of it over document
//! properties, [SequenceCursor]; which properties are sequences (and on which kinds of document)
//! is recorded once, in a table built with [inventory]:
//!
//! ```ignore
//! inventory::submit! { SequenceKind::new("orderedItems", &[Kind::OrderedCollection, Kind::OrderedCollectionPage]) }
//! ```
//!
//! Cursors are immutable snapshots: [Cursor::advance] returns a *new* cursor & leaves the receiver
//! untouched. Every exhausted cursor is the same object, available through [at_end]; test for it
//! with [is_at_end].
//!
//! [inventory]: https://docs.rs/inventory

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;
use snafu::{prelude::*, Backtrace};

use fedstream_shared::Iri;

use crate::document::{FederatedDocument, Kind};

use std::{fmt::Debug, sync::Arc};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{id} is a {kind}, not a collection"))]
    NotACollection {
        id: Iri,
        kind: Kind,
        backtrace: Backtrace,
    },
    #[snafu(display("{property} is not a sequence on a {kind}"))]
    NotApplicable {
        property: String,
        kind: Kind,
        backtrace: Backtrace,
    },
    #[snafu(display("{property} is not a known sequence property"))]
    UnknownSequence {
        property: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Cursor                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Shared, immutable handle to a [Cursor]
pub type CursorRef = Arc<dyn Cursor>;

/// A position in a sequence of ActivityStreams entries
///
/// The inspectors are synchronous; [advance](Cursor::advance) is async because some cursors (the
/// merged cursor in particular) have to dereference their next head before they can say what it
/// is.
#[async_trait]
pub trait Cursor: Debug + Send + Sync {
    /// True if this position holds either a reference or an inline document
    fn has_any(&self) -> bool;
    /// True if this position holds a bare [Iri]
    fn is_reference(&self) -> bool {
        self.reference().is_some()
    }
    /// The [Iri] at this position, if it's a reference
    fn reference(&self) -> Option<&Iri>;
    /// The document at this position, if it's inline
    fn value(&self) -> Option<&Arc<FederatedDocument>>;
    /// The next position; advancing past the last entry yields [at_end]
    async fn advance(&self) -> CursorRef;
}

#[derive(Debug)]
struct End;

#[async_trait]
impl Cursor for End {
    fn has_any(&self) -> bool {
        false
    }
    fn reference(&self) -> Option<&Iri> {
        None
    }
    fn value(&self) -> Option<&Arc<FederatedDocument>> {
        None
    }
    async fn advance(&self) -> CursorRef {
        at_end()
    }
}

lazy_static! {
    static ref AT_END: CursorRef = Arc::new(End);
}

/// The terminal sentinel
pub fn at_end() -> CursorRef {
    AT_END.clone()
}

/// True if `cursor` is (by identity) the terminal sentinel
pub fn is_at_end(cursor: &CursorRef) -> bool {
    Arc::ptr_eq(cursor, &*AT_END)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         SequenceCursor                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One position in a sequence
#[derive(Clone, Debug)]
pub enum Slot {
    Reference(Iri),
    Inline(Arc<FederatedDocument>),
    /// Present, but nothing we can use (a `Link`, a number, an unsupported object type...)
    Unrecognized,
}

impl Slot {
    /// Interpret one JSON value from a sequence-valued property
    ///
    /// Strings are references. Objects are inline documents, except that an object with an `id`
    /// but no `type` is treated as a reference to that `id`.
    pub fn from_value(value: &Value) -> Slot {
        match value {
            Value::String(text) => Iri::parse(text)
                .map(Slot::Reference)
                .unwrap_or(Slot::Unrecognized),
            Value::Object(map) if !map.contains_key("type") => map
                .get("id")
                .and_then(Value::as_str)
                .and_then(|text| Iri::parse(text).ok())
                .map(Slot::Reference)
                .unwrap_or(Slot::Unrecognized),
            Value::Object(map) => FederatedDocument::from_map(map.clone())
                .map(|document| Slot::Inline(Arc::new(document)))
                .unwrap_or(Slot::Unrecognized),
            _ => Slot::Unrecognized,
        }
    }
}

/// A [Cursor] over an immutable, shared slice of [Slot]s
///
/// This is the one adapter behind every sequence kind; advancing just bumps an index into the
/// shared slice.
#[derive(Clone, Debug)]
pub struct SequenceCursor {
    slots: Arc<[Slot]>,
    pos: usize,
}

impl SequenceCursor {
    /// A cursor at the start of `slots` (the sentinel, if `slots` is empty)
    pub fn begin<I: IntoIterator<Item = Slot>>(slots: I) -> CursorRef {
        let slots: Arc<[Slot]> = slots.into_iter().collect();
        if slots.is_empty() {
            at_end()
        } else {
            Arc::new(SequenceCursor { slots, pos: 0 })
        }
    }
    fn slot(&self) -> Option<&Slot> {
        self.slots.get(self.pos)
    }
}

#[async_trait]
impl Cursor for SequenceCursor {
    fn has_any(&self) -> bool {
        matches!(self.slot(), Some(Slot::Reference(_) | Slot::Inline(_)))
    }
    fn reference(&self) -> Option<&Iri> {
        match self.slot() {
            Some(Slot::Reference(iri)) => Some(iri),
            _ => None,
        }
    }
    fn value(&self) -> Option<&Arc<FederatedDocument>> {
        match self.slot() {
            Some(Slot::Inline(document)) => Some(document),
            _ => None,
        }
    }
    async fn advance(&self) -> CursorRef {
        if self.pos + 1 < self.slots.len() {
            Arc::new(SequenceCursor {
                slots: self.slots.clone(),
                pos: self.pos + 1,
            })
        } else {
            at_end()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         sequence kinds                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A document property whose value is a sequence
///
/// `holders` lists the document [Kind]s on which the property is a sequence; empty means "any".
#[derive(Debug)]
pub struct SequenceKind {
    property: &'static str,
    holders: &'static [Kind],
}

impl SequenceKind {
    pub const fn new(property: &'static str, holders: &'static [Kind]) -> SequenceKind {
        SequenceKind { property, holders }
    }
    pub fn property(&self) -> &'static str {
        self.property
    }
    pub fn applies_to(&self, kind: Kind) -> bool {
        self.holders.is_empty() || self.holders.contains(&kind)
    }
}

inventory::collect!(SequenceKind);

// Collection contents
inventory::submit! { SequenceKind::new("orderedItems", &[Kind::OrderedCollection, Kind::OrderedCollectionPage]) }
inventory::submit! { SequenceKind::new("items", &[Kind::Collection, Kind::CollectionPage]) }
// Activity participants
inventory::submit! { SequenceKind::new("actor", &[]) }
inventory::submit! { SequenceKind::new("object", &[]) }
inventory::submit! { SequenceKind::new("target", &[]) }
// Addressing
inventory::submit! { SequenceKind::new("to", &[]) }
inventory::submit! { SequenceKind::new("cc", &[]) }
inventory::submit! { SequenceKind::new("bto", &[]) }
inventory::submit! { SequenceKind::new("bcc", &[]) }
inventory::submit! { SequenceKind::new("audience", &[]) }
// Relations
inventory::submit! { SequenceKind::new("attachment", &[]) }
inventory::submit! { SequenceKind::new("attributedTo", &[]) }
inventory::submit! { SequenceKind::new("inReplyTo", &[]) }
inventory::submit! { SequenceKind::new("tag", &[]) }

/// Look-up the registration for `property`
pub fn sequence_kind(property: &str) -> Option<&'static SequenceKind> {
    IntoIterator::into_iter(inventory::iter::<SequenceKind>).find(|kind| kind.property == property)
}

/// A cursor over the sequence-valued `property` of `document`
///
/// An absent (or `null`) property is an empty sequence; a single value is a sequence of one.
pub fn begin(document: &FederatedDocument, property: &str) -> Result<CursorRef> {
    let sequence = sequence_kind(property).context(UnknownSequenceSnafu { property })?;
    ensure!(
        sequence.applies_to(document.kind()),
        NotApplicableSnafu {
            property,
            kind: document.kind(),
        }
    );
    Ok(match document.property(property) {
        None | Some(Value::Null) => at_end(),
        Some(Value::Array(values)) => SequenceCursor::begin(values.iter().map(Slot::from_value)),
        Some(value) => SequenceCursor::begin(std::iter::once(Slot::from_value(value))),
    })
}

/// A cursor over the contents of a collection (or collection page)
pub fn begin_collection(document: &FederatedDocument) -> Result<CursorRef> {
    let kind = document.kind();
    ensure!(
        kind.is_collection(),
        NotACollectionSnafu {
            id: document.id().clone(),
            kind,
        }
    );
    match kind {
        Kind::OrderedCollection | Kind::OrderedCollectionPage => begin(document, "orderedItems"),
        _ => begin(document, "items"),
    }
}
