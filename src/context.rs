//! The request/response exchange handed to the proxy engines.

use bytes::Bytes;
use http::{Request, Response, uri::Scheme};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use std::{convert::Infallible, net::SocketAddr};

use crate::error::BoxError;

/// Body type used on both legs of a proxied exchange.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

#[must_use]
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

#[must_use]
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Boxes any body whose error converts into [`BoxError`], e.g. hyper's `Incoming`.
pub fn boxed_body<B>(body: B) -> ProxyBody
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// One inbound exchange: the caller's request, the response being built for
/// it, and where the request came from.
///
/// The server hands a context to the engine, which rewrites the request,
/// replaces the response and leaves it for the server to write back.
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request<ProxyBody>,
    pub response: Response<ProxyBody>,
    remote_addr: SocketAddr,
    scheme: Scheme,
}

impl RequestContext {
    #[must_use]
    pub fn new(request: Request<ProxyBody>, remote_addr: SocketAddr) -> Self {
        let scheme = request.uri().scheme().cloned().unwrap_or(Scheme::HTTP);
        Self {
            request,
            response: Response::new(empty_body()),
            remote_addr,
            scheme,
        }
    }

    /// Sets the scheme the request arrived over (e.g. `https` behind TLS).
    #[must_use]
    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[must_use]
    pub const fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Host of the inbound request: the URI authority, else the `Host` header.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.request.uri().authority().map(http::uri::Authority::as_str).or_else(|| {
            self.request
                .headers()
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
        })
    }

    #[must_use]
    pub fn into_response(self) -> Response<ProxyBody> {
        self.response
    }
}
