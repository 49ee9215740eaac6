// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
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

//! # fedstream as an HTTP client
//!
//! The [Fetcher] trait is the seam between the object cache & the network: GET a document by
//! [Iri], or POST one to an inbox. [HttpFetcher] is the production implementation: a single,
//! pooled [reqwest::Client] with a small [tower] stack on top:
//!
//! ```text
//!                              requests
//!                                  |
//!                                  v
//! +---------------------   Set User-Agent header   ---------------------+
//! | +-------------------  Set Accept header        -------------------+ |
//! | | +-----------------  Set Content-Type (POST)  -----------------+ | |
//! | | | +---------------      instrumentation      ---------------+ | | |
//! | | | | +-------------       Reqwest layer       -------------+ | | | |
//! | | | | |                                                     | | | | |
//! | | | | |                       remote                        | | | | |
//! | | | | |                                                     | | | | |
//! | | | | +------------>       Reqwest layer       <------------+ | | | |
//! | | | +-------------->      instrumentation      <--------------+ | | |
//! | | +---------------->  Set Content-Type (POST)  <----------------+ | |
//! | +------------------>  Set Accept header        <------------------+ |
//! +-------------------->   Set User-Agent header   <--------------------+
//!                                   |
//!                                   v
//!                               responses
//! ```
//!
//! `Accept` goes out on every request, POSTs included; left unset, reqwest would fill in `*/*`
//! beneath our stack.
//!
//! The underlying client is configured *not* to follow redirects; [HttpFetcher] follows them
//! itself, sending each hop back through the whole stack so that every request (not just the
//! first) carries our headers.
//!
//! There are no retries: a single failed attempt is reported to the caller immediately.
//!
//! [tower]: https://docs.rs/tower

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    header::{ACCEPT, CONTENT_TYPE, LOCATION, USER_AGENT},
    HeaderValue, Method, StatusCode,
};
use opentelemetry::KeyValue;
use pin_project::pin_project;
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tower::{util::BoxCloneSyncService, Layer, Service, ServiceBuilder, ServiceExt};
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, error};
use url::Url;

use fedstream_shared::{
    service::{self, Body, ReqwestServiceLayer},
    Iri,
};

use crate::{
    config::FetchConfig,
    counter_add,
    document::FederatedDocument,
    marshal::Marshal,
    metrics::{self, Instruments, Sort},
};

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// The ActivityPub content negotiation string, used for both `Accept` & `Content-Type`
pub const ACTIVITY_PUB_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to build the HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{iri} redirected ({status}) to an invalid location: {source}"))]
    BadLocation {
        iri: Iri,
        status: StatusCode,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to encode the document for {iri}: {source}"))]
    Marshal {
        iri: Iri,
        source: crate::marshal::Error,
    },
    #[snafu(display("{iri} redirected ({status}) without a Location header"))]
    MissingLocation {
        iri: Iri,
        status: StatusCode,
        backtrace: Backtrace,
    },
    #[snafu(display("While requesting {iri}: {source}"))]
    Network {
        iri: Iri,
        source: service::Error,
    },
    #[snafu(display("{iri} answered {status}{}", body.as_ref().map(|b| format!(": {b}")).unwrap_or_default()))]
    ProtocolStatus {
        iri: Iri,
        status: StatusCode,
        body: Option<String>,
    },
    #[snafu(display("Failed to build a request for {iri}: {source}"))]
    Request {
        iri: Iri,
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Gave up on {iri} after {max} redirects"))]
    TooManyRedirects {
        iri: Iri,
        max: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("{user_agent} is not a legal User-Agent: {source}"))]
    UserAgent {
        user_agent: String,
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Transport-level failure (connect, DNS, TLS, timeout...)
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
    /// The status code returned by the peer, if the peer answered with a non-success status
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::ProtocolStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Fetcher                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Network I/O on ActivityPub documents; no caching
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `iri`, returning the response body; any non-2xx status is an error
    async fn get(&self, iri: &Iri) -> Result<Bytes>;
    /// POST `body` to `iri`; any non-2xx status is an error
    async fn post(&self, body: Bytes, iri: &Iri) -> Result<()>;
}

/// Encode `document` with `marshal` & POST the result to `iri` (delivery to an inbox, e.g.)
pub async fn submit<F, M>(
    fetcher: &F,
    marshal: &M,
    document: &FederatedDocument,
    iri: &Iri,
) -> Result<()>
where
    F: Fetcher + ?Sized,
    M: Marshal + ?Sized,
{
    let body = marshal
        .document_to_bytes(document)
        .context(MarshalSnafu { iri: iri.clone() })?;
    fetcher.post(body, iri).await
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       InstrumentedService                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("fetch.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.errors", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.informational", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.success", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.redirect", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.client_error", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.server_error", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fetch.responses.unknown", Sort::IntegralCounter) }

/// A [Future] wrapping the inner service's future that logs & counts each response
// tower_http's TraceLayer would do, but getting the host from the request-side callback to the
// response-side callback is more trouble than writing this.
#[pin_project]
pub struct InstrumentedFuture<InnerFut> {
    host: String,
    span: tracing::Span,
    instruments: Arc<Instruments>,
    #[pin]
    inner: InnerFut,
}

impl<RspBody, E, InnerFut> Future for InstrumentedFuture<InnerFut>
where
    InnerFut: Future<Output = StdResult<http::Response<RspBody>, E>>,
    E: std::error::Error,
{
    type Output = StdResult<http::Response<RspBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.span.enter();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(rsp)) => {
                let name = match rsp.status().as_u16() {
                    100..=199 => "fetch.responses.informational",
                    200..=299 => "fetch.responses.success",
                    300..=399 => "fetch.responses.redirect",
                    400..=499 => "fetch.responses.client_error",
                    500..=599 => "fetch.responses.server_error",
                    _ => "fetch.responses.unknown",
                };
                counter_add!(
                    this.instruments,
                    name,
                    1,
                    &[KeyValue::new("host", this.host.clone())]
                );
                debug!("{} answered {}", this.host, rsp.status());
                Poll::Ready(Ok(rsp))
            }
            Poll::Ready(Err(err)) => {
                error!("While sending a request to {}, got {}", this.host, err);
                counter_add!(
                    this.instruments,
                    "fetch.errors",
                    1,
                    &[KeyValue::new("host", this.host.clone())]
                );
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedService<S> {
    inner: S,
    instruments: Arc<Instruments>,
}

impl<S, ReqBody, RspBody> Service<http::Request<ReqBody>> for InstrumentedService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<RspBody>>,
    S::Error: std::error::Error,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = InstrumentedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let host = request.uri().host().unwrap_or("localhost").to_owned();
        let span = tracing::debug_span!("fedstream-fetch", method = %request.method(), uri = %request.uri());
        let inner = {
            let _guard = span.enter();
            debug!("Sending {} request to {host}", request.method());
            counter_add!(
                self.instruments,
                "fetch.requests",
                1,
                &[KeyValue::new("host", host.clone())]
            );
            self.inner.call(request)
        };
        InstrumentedFuture {
            host,
            span,
            instruments: self.instruments.clone(),
            inner,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedLayer {
    instruments: Arc<Instruments>,
}

impl InstrumentedLayer {
    pub fn new(instruments: Arc<Instruments>) -> InstrumentedLayer {
        InstrumentedLayer { instruments }
    }
}

impl<S> Layer<S> for InstrumentedLayer {
    type Service = InstrumentedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentedService {
            inner,
            instruments: self.instruments.clone(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          HttpFetcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The type-erased client stack
pub type ClientType =
    BoxCloneSyncService<http::Request<Bytes>, http::Response<Bytes>, service::Error>;

fn content_type_on_post(request: &http::Request<Bytes>) -> Option<HeaderValue> {
    (request.method() == Method::POST)
        .then(|| HeaderValue::from_static(ACTIVITY_PUB_CONTENT_TYPE))
}

/// Build the [tower] stack on top of a single [reqwest::Client]
///
/// [tower]: https://docs.rs/tower
pub fn make_client(config: &FetchConfig, instruments: Arc<Instruments>) -> Result<ClientType> {
    let user_agent = HeaderValue::from_str(&config.user_agent).context(UserAgentSnafu {
        user_agent: config.user_agent.clone(),
    })?;
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context(ClientSnafu)?;
    ServiceBuilder::new()
        .layer(SetRequestHeaderLayer::overriding(USER_AGENT, user_agent))
        .layer(SetRequestHeaderLayer::overriding(
            ACCEPT,
            HeaderValue::from_static(ACTIVITY_PUB_CONTENT_TYPE),
        ))
        .layer(SetRequestHeaderLayer::overriding(
            CONTENT_TYPE,
            content_type_on_post as for<'a> fn(&'a http::Request<Bytes>) -> Option<HeaderValue>,
        ))
        .layer(InstrumentedLayer::new(instruments))
        .layer(ReqwestServiceLayer::new(Body))
        .service(client)
        .pipe(BoxCloneSyncService::new)
        .pipe(Ok)
}

const FOLLOWED_REDIRECTS: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

/// [Fetcher] implementation speaking HTTP(S)
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct HttpFetcher {
    client: ClientType,
    max_redirects: usize,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig, instruments: Arc<Instruments>) -> Result<HttpFetcher> {
        Ok(HttpFetcher {
            client: make_client(config, instruments)?,
            max_redirects: config.max_redirects,
        })
    }
    /// Send one logical request, following redirects
    ///
    /// 307 & 308 preserve the method & body; 303 (and, by long-standing convention, 301 & 302 in
    /// response to a POST) become a GET with no body.
    async fn send(&self, method: Method, iri: &Iri, body: Bytes) -> Result<http::Response<Bytes>> {
        let mut method = method;
        let mut body = body;
        let mut url: Url = iri.as_url().clone();
        let mut hops = 0usize;
        loop {
            let request = http::Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .body(body.clone())
                .context(RequestSnafu { iri: iri.clone() })?;
            // `oneshot` drives `poll_ready` for us; cloning the stack is how we get a `&mut`
            let response = self
                .client
                .clone()
                .oneshot(request)
                .await
                .context(NetworkSnafu { iri: iri.clone() })?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if !FOLLOWED_REDIRECTS.contains(&status) {
                let rsp_body = response.into_body();
                return ProtocolStatusSnafu {
                    iri: iri.clone(),
                    status,
                    body: (!rsp_body.is_empty())
                        .then(|| String::from_utf8_lossy(&rsp_body).into_owned()),
                }
                .fail();
            }
            if hops >= self.max_redirects {
                return TooManyRedirectsSnafu {
                    iri: iri.clone(),
                    max: self.max_redirects,
                }
                .fail();
            }
            hops += 1;
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .context(MissingLocationSnafu {
                    iri: iri.clone(),
                    status,
                })?;
            url = url.join(location).context(BadLocationSnafu {
                iri: iri.clone(),
                status,
            })?;
            if status == StatusCode::SEE_OTHER
                || (method == Method::POST
                    && (status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND))
            {
                method = Method::GET;
                body = Bytes::new();
            }
            debug!("{iri} redirected ({status}) to {url}");
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, iri: &Iri) -> Result<Bytes> {
        self.send(Method::GET, iri, Bytes::new())
            .await
            .map(http::Response::into_body)
    }
    async fn post(&self, body: Bytes, iri: &Iri) -> Result<()> {
        self.send(Method::POST, iri, body).await.map(|_| ())
    }
}
