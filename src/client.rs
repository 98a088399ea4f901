//! Backend HTTP client seam and the call strategies used by the proxy.

use futures_util::future::BoxFuture;
use http::{Method, Request, Response, StatusCode, Uri, header};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use std::time::{Duration, Instant};

use crate::context::{ProxyBody, boxed_body, full_body};
use crate::error::{BackendError, BoxError};

/// Sends one request to a backend and yields its response.
pub trait HttpClient: Send + Sync {
    fn request(
        &self,
        request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<ProxyBody>, BoxError>>;
}

impl HttpClient for Client<HttpConnector, ProxyBody> {
    fn request(
        &self,
        request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<ProxyBody>, BoxError>> {
        let response = Client::request(self, request);
        Box::pin(async move {
            let response = response.await?;
            Ok::<_, BoxError>(response.map(boxed_body))
        })
    }
}

/// Plain HTTP/1 client over a pooled `HttpConnector`.
#[must_use]
pub fn default_client() -> Client<HttpConnector, ProxyBody> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// How the proxy calls the backend. Exactly one strategy per proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientBehavior {
    /// Single call without a deadline.
    #[default]
    Do,
    /// Fail with [`BackendError::Timeout`] if the response is not in by `Instant`.
    Deadline(Instant),
    /// Fail with [`BackendError::Timeout`] after `Duration`.
    Timeout(Duration),
    /// Follow at most this many redirects. The request body is buffered so it
    /// can be replayed.
    Redirects(usize),
}

impl ClientBehavior {
    pub async fn send(
        self,
        client: &dyn HttpClient,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, BackendError> {
        match self {
            Self::Do => client.request(request).await.map_err(BackendError::Transport),
            Self::Deadline(deadline) => {
                tokio::time::timeout_at(deadline.into(), client.request(request))
                    .await
                    .map_err(|_| BackendError::Timeout)?
                    .map_err(BackendError::Transport)
            }
            Self::Timeout(timeout) => tokio::time::timeout(timeout, client.request(request))
                .await
                .map_err(|_| BackendError::Timeout)?
                .map_err(BackendError::Transport),
            Self::Redirects(max) => send_following_redirects(client, request, max).await,
        }
    }
}

const fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

async fn send_following_redirects(
    client: &dyn HttpClient,
    request: Request<ProxyBody>,
    max_redirects: usize,
) -> Result<Response<ProxyBody>, BackendError> {
    let (mut parts, body) = request.into_parts();
    let mut body = body
        .collect()
        .await
        .map_err(BackendError::Transport)?
        .to_bytes();
    let mut redirects = 0;

    loop {
        let mut attempt = Request::new(full_body(body.clone()));
        *attempt.method_mut() = parts.method.clone();
        *attempt.uri_mut() = parts.uri.clone();
        *attempt.version_mut() = parts.version;
        *attempt.headers_mut() = parts.headers.clone();

        let response = client
            .request(attempt)
            .await
            .map_err(BackendError::Transport)?;
        let status = response.status();
        if !is_redirect(status) {
            return Ok(response);
        }

        redirects += 1;
        if redirects > max_redirects {
            return Err(BackendError::TooManyRedirects(max_redirects));
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| BackendError::InvalidRedirect("missing Location header".to_string()))?;
        parts.uri = resolve_location(&parts.uri, location)?;
        tracing::debug!(status = %status, location = %parts.uri, redirects, "Following backend redirect");

        if let Some(authority) = parts.uri.authority() {
            if let Ok(host) = authority.as_str().parse() {
                parts.headers.insert(header::HOST, host);
            }
        }

        let rewrite_to_get = status == StatusCode::SEE_OTHER
            || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                && parts.method == Method::POST);
        if rewrite_to_get && parts.method != Method::HEAD {
            parts.method = Method::GET;
            body = bytes::Bytes::new();
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.remove(header::CONTENT_TYPE);
        }
    }
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri, BackendError> {
    let invalid = || BackendError::InvalidRedirect(location.to_string());
    let target: Uri = location.parse().map_err(|_| invalid())?;
    if target.scheme().is_some() {
        return Ok(target);
    }

    let path_and_query = if location.starts_with('/') {
        location.to_string()
    } else {
        let dir = base.path().rsplit_once('/').map_or("", |(dir, _)| dir);
        format!("{dir}/{location}")
    };

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().map_err(|_| invalid())?);
    Uri::from_parts(parts).map_err(|_| invalid())
}
