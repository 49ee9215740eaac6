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

//! Client-Side tower Services
//!
//! # Introduction
//!
//! Every request fedstream sends to a peer needs the same treatment: the ActivityPub content
//! negotiation header, a fixed `User-Agent`, a log line or two and some counters. That's
//! "middleware", and in the Rust ecosystem the canonical implementation is [tower] (with
//! [tower-http] providing the HTTP-specific layers).
//!
//! The trouble is that [tower-http] is written in terms of the [http] crate's `Request` &
//! `Response`, while [reqwest], the client we actually want to use (one pooled `Client`, shared by
//! every call), has its own request & response types. `reqwest::Client` *does* implement
//! [Service], however, so all we need is a thin [Service] that wraps it and translates between
//! [http] requests & responses and [reqwest] requests & responses. Then we can stack whatever
//! [tower] & [tower-http] middleware we like on top.
//!
//! [tower]: https://docs.rs/tower
//! [tower-http]: https://docs.rs/tower-http
//! [reqwest]: https://docs.rs/reqwest
//! [http]: https://docs.rs/http

use async_trait::async_trait;
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tower::Service;

use std::{
    error::Error as StdError,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While waiting for the response body, {source}"))]
    Body {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert an http::Request to a reqwest::Request: {source}"))]
    Conversion {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The wrapped service speaking reqwest errored-out on poll_ready: {source}"))]
    PollReady {
        source: Box<dyn StdError + Send + Sync>,
    },
    #[snafu(display("The reqwest service reported an error: {source}"))]
    Reqwest {
        source: Box<dyn StdError + Send + Sync>,
    },
    #[snafu(display("When building an http response, {source}"))]
    Response {
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The response builder yielded no extensions"))]
    ResponseExtensions { backtrace: Backtrace },
}

impl Error {
    /// True if the failure happened on the wire (connect, DNS, TLS, timeout...) rather than while
    /// building the request or translating the response
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Reqwest { .. } | Error::Body { .. })
    }
    /// True if the wrapped client gave up waiting on the peer
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Reqwest { source } => source
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout),
            Error::Body { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ReqwestService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Implementing this trait signals the ability to fallibly convert a given HTTP response type into
/// an [http::Response] with a given response body type.
#[async_trait]
pub trait FromResponse: Clone {
    type InnerResponse;
    type ResponseBody;
    // The receiver is `self`, not `&self`, so that the resulting future doesn't borrow from the
    // service; implementors are `Clone` to make up for it.
    async fn try_into_response(
        self,
        _: Self::InnerResponse,
    ) -> Result<http::Response<Self::ResponseBody>>;
}

/// Wrap a [tower] [Service] that deals in [reqwest] requests & responses so as to produce one that
/// works in terms of [http] requests & responses
///
/// [tower]: https://docs.rs/tower
/// [reqwest]: https://docs.rs/reqwest
/// [http]: https://docs.rs/http
#[derive(Clone, Debug)]
pub struct ReqwestService<S, R>
where
    S: Service<reqwest::Request>,
    R: FromResponse<InnerResponse = S::Response>,
{
    inner: S,
    from_response: R,
}

/// The future returned by [ReqwestService]
///
/// Naming the composition of "convert the request, call the inner service, then convert the
/// response" is more trouble than it's worth; erase it.
pub type ReqwestServiceFuture<B> =
    Pin<Box<dyn Future<Output = Result<http::Response<B>>> + Send + 'static>>;

impl<S, ReqBody, R> Service<http::Request<ReqBody>> for ReqwestService<S, R>
where
    ReqBody: Into<reqwest::Body>,
    R: FromResponse<InnerResponse = S::Response> + Send + 'static,
    R::ResponseBody: Send + 'static,
    S: Service<reqwest::Request>,
    S::Future: Send + 'static,
    S::Error: StdError + Send + Sync + 'static,
{
    type Response = http::Response<R::ResponseBody>;
    type Error = Error;
    type Future = ReqwestServiceFuture<R::ResponseBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map(|res| res.map_err(|err| PollReadySnafu.into_error(Box::new(err))))
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The conversion has to happen here, not in the future, since the inner service must be
        // called synchronously (it's only guaranteed ready *now*).
        let from_response = self.from_response.clone();
        let inner = reqwest::Request::try_from(req).map(|req| self.inner.call(req));
        Box::pin(async move {
            let rsp = inner
                .context(ConversionSnafu)?
                .await
                .map_err(|err| ReqwestSnafu.into_error(Box::new(err)))?;
            from_response.try_into_response(rsp).await
        })
    }
}

/// A [tower::Layer] producing [ReqwestService]s
#[derive(Clone, Debug)]
pub struct ReqwestServiceLayer<R: FromResponse> {
    from_response: R,
}

impl<R: FromResponse> ReqwestServiceLayer<R> {
    pub fn new(from_response: R) -> ReqwestServiceLayer<R> {
        Self { from_response }
    }
}

impl<S, R> tower::Layer<S> for ReqwestServiceLayer<R>
where
    S: Service<reqwest::Request, Response = reqwest::Response>,
    R: FromResponse<InnerResponse = S::Response> + Clone,
{
    type Service = ReqwestService<S, R>;

    fn layer(&self, inner: S) -> Self::Service {
        ReqwestService {
            inner,
            from_response: self.from_response.clone(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Body                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [FromResponse] implementation that reads the entire response body into [Bytes]
///
/// ActivityPub documents are small; we never need to stream them.
///
/// [Bytes]: bytes::Bytes
#[derive(Clone, Debug)]
pub struct Body;

#[async_trait]
impl FromResponse for Body {
    type InnerResponse = reqwest::Response;
    type ResponseBody = bytes::Bytes;
    async fn try_into_response(
        self,
        rsp: Self::InnerResponse,
    ) -> Result<http::Response<Self::ResponseBody>> {
        let mut builder = rsp.headers().iter().fold(
            http::Response::builder()
                .status(rsp.status())
                .version(rsp.version()),
            |builder, (name, value)| builder.header(name, value),
        );
        *builder.extensions_mut().context(ResponseExtensionsSnafu)? = rsp.extensions().clone();
        builder
            .body(rsp.bytes().await.context(BodySnafu)?)
            .context(ResponseSnafu)
    }
}
