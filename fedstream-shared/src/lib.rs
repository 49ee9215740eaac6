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

//! # fedstream-shared
//!
//! Types & plumbing that know nothing about caching or merging: the [Iri] newtype used to name
//! every actor, object & collection, and (in [service]) the adapter that lets us stack [tower]
//! middleware on top of a [reqwest] client.
//!
//! [tower]: https://docs.rs/tower
//! [reqwest]: https://docs.rs/reqwest

pub mod service;

use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use url::Url;

use std::{fmt::Display, ops::Deref, str::FromStr};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse {text} as an IRI: {source}"))]
    Parse {
        text: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Iri                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An ActivityPub identifier, in normalized form
///
/// ActivityPub names everything (actors, objects, collections, collection pages) by IRI, and in
/// practice those IRIs are always `http` or `https` URLs. Peers are not terribly careful about how
/// they write them, however: `HTTPS://Example.COM:443/users//alice#main` and
/// `https://example.com/users/alice` name the same thing. Since an [Iri] is used as a cache key,
/// equality has to be insensitive to that sort of thing, so we normalize on construction:
///
/// - scheme & host are lower-cased, default ports dropped and dot-segments resolved ([url] does
///   this for us)
/// - the fragment is dropped
/// - runs of `/` in the path are collapsed to one
/// - an empty query (a trailing `?`) is dropped
///
/// We do *not* force `http` to `https`, nor strip a leading `www.`; those name different
/// resources as far as the protocol is concerned.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Iri(Url);

fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    if !url.cannot_be_a_base() && url.path().contains("//") {
        let mut path: Vec<char> = url.path().chars().collect();
        path.dedup_by(|a, b| *a == '/' && *b == '/');
        url.set_path(&path.into_iter().collect::<String>());
    }
    url
}

impl Iri {
    pub fn parse(text: &str) -> Result<Iri> {
        Url::parse(text)
            .context(ParseSnafu {
                text: text.to_owned(),
            })
            .map(|url| Iri(normalize(url)))
    }
    pub fn as_url(&self) -> &Url {
        &self.0
    }
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<'de> Deserialize<'de> for Iri {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Iri::parse(&text).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for Iri {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<Url> for Iri {
    fn as_ref(&self) -> &Url {
        &self.0
    }
}

impl Deref for Iri {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Iri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Url> for Iri {
    fn from(value: Url) -> Self {
        Iri(normalize(value))
    }
}

impl From<Iri> for Url {
    fn from(value: Iri) -> Self {
        value.0
    }
}

impl FromStr for Iri {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Iri::parse(s)
    }
}

impl TryFrom<String> for Iri {
    type Error = Error;

    fn try_from(value: String) -> StdResult<Self, Self::Error> {
        Iri::parse(&value)
    }
}
