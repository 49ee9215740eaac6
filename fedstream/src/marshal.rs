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

//! # Marshalling
//!
//! Conversion between raw bytes on the wire & [FederatedDocument]s. The only contract the rest of
//! the crate relies upon is that a round trip preserves a document's identity and, when present,
//! its published timestamp.

use bytes::Bytes;
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tap::Pipe;

use crate::document::FederatedDocument;

/// The JSON-LD context we attach to everything we send
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The payload was not a recognizable document: {source}"))]
    Document { source: crate::document::Error },
    #[snafu(display("The payload was not valid JSON: {source}"))]
    FromJson {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The payload was valid JSON, but not an object"))]
    NotAnObject { backtrace: Backtrace },
    #[snafu(display("Failed to serialize a document: {source}"))]
    ToJson {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Marshal                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Convert between bytes & [FederatedDocument]s
pub trait Marshal: Send + Sync {
    fn bytes_to_document(&self, bytes: &[u8]) -> Result<FederatedDocument>;
    fn document_to_bytes(&self, document: &FederatedDocument) -> Result<Bytes>;
}

/// [Marshal] implementation for the JSON-LD serialization ActivityPub uses on the wire
///
/// We don't do any JSON-LD processing (expansion, compaction & so forth); like everyone else in
/// the Fediverse, we assume the compacted form with the ActivityStreams context.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLdMarshal;

impl Marshal for JsonLdMarshal {
    fn bytes_to_document(&self, bytes: &[u8]) -> Result<FederatedDocument> {
        match serde_json::from_slice::<Value>(bytes).context(FromJsonSnafu)? {
            Value::Object(map) => FederatedDocument::from_map(map).context(DocumentSnafu),
            _ => NotAnObjectSnafu.fail(),
        }
    }
    fn document_to_bytes(&self, document: &FederatedDocument) -> Result<Bytes> {
        let mut map = document.to_map();
        map.insert(
            "@context".to_owned(),
            Value::String(ACTIVITY_STREAMS_CONTEXT.to_owned()),
        );
        serde_json::to_vec(&Value::Object(map))
            .context(ToJsonSnafu)?
            .pipe(Bytes::from)
            .pipe(Ok)
    }
}
