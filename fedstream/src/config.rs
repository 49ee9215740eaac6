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

//! # fedstream configuration
//!
//! The configuration file is TOML, versioned by an internal `version` tag so that the format can
//! evolve without breaking existing deployments:
//!
//! ```toml
//! version = "1"
//!
//! [fetch]
//! user-agent = "fedstream/0.1.0; +admin@example.com"
//! timeout = { secs = 8, nanos = 0 }
//! max-redirects = 10
//!
//! [cache]
//! ttl = { secs = 2, nanos = 0 }
//! eviction-interval = { secs = 60, nanos = 0 }
//! shutdown-timeout = { secs = 0, nanos = 500000000 }
//! ```
//!
//! Every key is optional.

use serde::Deserialize;
use snafu::{Backtrace, IntoError, Snafu};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Where we look for a configuration file when none is named
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fedstream.toml";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the configuration file {}: {source}", pth.display()))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the configuration file {}: {source}", pth.display()))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Outbound HTTP
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Sent verbatim as `User-Agent` on every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
    /// Bound on each request, from connect through reading the body
    pub timeout: Duration,
    /// Number of redirects we'll follow before giving up
    #[serde(rename = "max-redirects")]
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            user_agent: format!("fedstream/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(8),
            max_redirects: 10,
        }
    }
}

/// The object cache
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a resolution remains valid, measured from the moment the fetch was started
    ///
    /// Keep this well above [FetchConfig::timeout]: an entry for a peer that takes nearly the
    /// whole TTL to answer is stale as soon as it arrives.
    pub ttl: Duration,
    /// How often the eviction task sweeps the cache
    #[serde(rename = "eviction-interval")]
    pub eviction_interval: Duration,
    /// How long `close()` will wait for the eviction task to exit
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl: Duration::from_secs(30),
            eviction_interval: Duration::from_secs(180),
            shutdown_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ConfigV1 {
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
}

/// The configuration file, tagged by format version
#[derive(Debug, Deserialize)]
#[serde(tag = "version")] // tag "internally"
pub enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse configuration text
pub fn from_toml(text: &str) -> std::result::Result<ConfigV1, toml::de::Error> {
    toml::from_str::<Configuration>(text).map(|cfg| match cfg {
        Configuration::V1(cfg) => cfg,
    })
}

/// Parse the fedstream configuration file
///
/// If `cfg` names a file, it must exist & parse. Otherwise, we try [DEFAULT_CONFIG_PATH] and fall
/// back to the defaults if that's not there.
pub fn parse_config(cfg: Option<&Path>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG_PATH), true),
        |p| (p.to_path_buf(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => from_toml(&text).map_err(|err| ConfigParseSnafu { pth }.into_error(err)),
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}
