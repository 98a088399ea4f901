//! Single-host HTTP reverse proxy with hop-by-hop header handling.

use http::{HeaderValue, Request, Response, StatusCode, Uri, Version, header::HOST};
use std::sync::Arc;
use tracing::{error, warn};

use crate::client::{ClientBehavior, HttpClient, default_client};
use crate::context::{ProxyBody, RequestContext, empty_body};
use crate::error::{BoxError, ProxyError};
use crate::forwarded::append_forwarded_headers;
use crate::headers::{HeaderSanitizer, HopHeaders};
use crate::path::join_url_path;
use crate::pool::HeaderPool;

/// Rewrites the outbound request before it is sent to the backend.
pub type Director = Arc<dyn Fn(&mut Request<ProxyBody>) + Send + Sync>;

/// Inspects or edits the backend response. An error is handed to the
/// [`ErrorHandler`].
pub type ModifyResponse =
    Arc<dyn Fn(&mut Response<ProxyBody>) -> Result<(), BoxError> + Send + Sync>;

/// Writes the caller's response when the backend call or the response
/// modifier fails.
pub type ErrorHandler = Arc<dyn Fn(&mut RequestContext, &ProxyError) + Send + Sync>;

/// Forwards requests to one backend address.
pub struct ReverseProxy {
    target: String,
    client: Arc<dyn HttpClient>,
    client_behavior: ClientBehavior,
    transfer_trailer: bool,
    save_origin_response_header: bool,
    director: Option<Director>,
    modify_response: Option<ModifyResponse>,
    error_handler: Option<ErrorHandler>,
    sanitizer: HeaderSanitizer,
    header_pool: HeaderPool,
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("target", &self.target)
            .field("client_behavior", &self.client_behavior)
            .field("transfer_trailer", &self.transfer_trailer)
            .field("save_origin_response_header", &self.save_origin_response_header)
            .field("sanitizer", &self.sanitizer)
            .finish_non_exhaustive()
    }
}

impl ReverseProxy {
    /// Proxy to `target`, e.g. `http://127.0.0.1:9000/base?k=v`. The inbound
    /// path is joined onto the target path and both queries are kept.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            director: Some(single_host_director(target.clone())),
            target,
            client: Arc::new(default_client()),
            client_behavior: ClientBehavior::default(),
            transfer_trailer: false,
            save_origin_response_header: false,
            modify_response: None,
            error_handler: None,
            sanitizer: HeaderSanitizer::default(),
            header_pool: HeaderPool::new(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The current director, for wrapping in a custom one.
    #[must_use]
    pub fn director(&self) -> Option<Director> {
        self.director.clone()
    }

    pub fn set_director(&mut self, director: impl Fn(&mut Request<ProxyBody>) + Send + Sync + 'static) {
        self.director = Some(Arc::new(director));
    }

    pub fn set_client(&mut self, client: Arc<dyn HttpClient>) {
        self.client = client;
    }

    pub fn set_client_behavior(&mut self, behavior: ClientBehavior) {
        self.client_behavior = behavior;
    }

    pub fn set_modify_response(
        &mut self,
        modify: impl Fn(&mut Response<ProxyBody>) -> Result<(), BoxError> + Send + Sync + 'static,
    ) {
        self.modify_response = Some(Arc::new(modify));
    }

    pub fn set_error_handler(
        &mut self,
        handler: impl Fn(&mut RequestContext, &ProxyError) + Send + Sync + 'static,
    ) {
        self.error_handler = Some(Arc::new(handler));
    }

    /// Forward `Trailer` when the caller sent `Te: trailers`.
    pub fn set_transfer_trailer(&mut self, transfer_trailer: bool) {
        self.transfer_trailer = transfer_trailer;
    }

    /// Keep headers already set on the context's response and add them to
    /// the backend response.
    pub fn set_save_origin_response_header(&mut self, save: bool) {
        self.save_origin_response_header = save;
    }

    pub fn set_hop_headers(&mut self, hop_headers: HopHeaders) {
        self.sanitizer = HeaderSanitizer::new(hop_headers);
    }

    /// Proxies `ctx.request` and leaves the result in `ctx.response`.
    #[tracing::instrument(
        skip_all,
        fields(method = %ctx.request.method(), path = %ctx.request.uri().path(), target = %self.target)
    )]
    pub async fn serve_http(&self, ctx: &mut RequestContext) {
        let saved = self.save_origin_response_header.then(|| {
            let mut saved = self.header_pool.acquire();
            for (name, value) in ctx.response.headers() {
                saved.append(name.clone(), value.clone());
            }
            saved
        });

        if let Some(director) = &self.director {
            director(&mut ctx.request);
        }

        *ctx.request.version_mut() = Version::HTTP_11;
        let keep_trailer = self
            .sanitizer
            .sanitize_request(ctx.request.headers_mut(), self.transfer_trailer);
        let client_ip = ctx.remote_addr().ip();
        let scheme = ctx.scheme().clone();
        append_forwarded_headers(ctx.request.headers_mut(), client_ip, &scheme);

        let outbound = detach_request(&mut ctx.request);
        let response = match self.client_behavior.send(self.client.as_ref(), outbound).await {
            Ok(response) => response,
            Err(err) => {
                let err = ProxyError::from(err);
                error!(uri = %ctx.request.uri(), error = %err, "Backend request failed");
                self.handle_error(ctx, &err);
                return;
            }
        };

        ctx.response = response;
        if let Some(saved) = saved {
            for (name, value) in saved.iter() {
                ctx.response.headers_mut().append(name.clone(), value.clone());
            }
        }
        self.sanitizer
            .sanitize_response(ctx.response.headers_mut(), keep_trailer);

        if let Some(modify) = &self.modify_response {
            if let Err(source) = modify(&mut ctx.response) {
                let err = ProxyError::ModifyResponse(source);
                error!(error = %err, "Response modifier failed");
                self.handle_error(ctx, &err);
            }
        }
    }

    fn handle_error(&self, ctx: &mut RequestContext, err: &ProxyError) {
        match &self.error_handler {
            Some(handler) => handler(ctx, err),
            None => *ctx.response.status_mut() = StatusCode::BAD_GATEWAY,
        }
    }
}

/// Takes the request out for sending and leaves its head behind, so error
/// handlers still see what was attempted.
fn detach_request(request: &mut Request<ProxyBody>) -> Request<ProxyBody> {
    let mut head = Request::new(empty_body());
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = request.uri().clone();
    *head.version_mut() = request.version();
    *head.headers_mut() = request.headers().clone();
    std::mem::replace(request, head)
}

fn single_host_director(target: String) -> Director {
    Arc::new(move |request: &mut Request<ProxyBody>| {
        let host = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_owned())
            .or_else(|| {
                request
                    .headers()
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        let joined = join_url_path(&target, &host, request.uri().path(), request.uri().query());
        let absolute = if joined.contains("://") {
            joined
        } else {
            format!("http://{joined}")
        };

        match absolute.parse::<Uri>() {
            Ok(uri) => {
                if let Some(authority) = uri.authority() {
                    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                        request.headers_mut().insert(HOST, value);
                    }
                }
                *request.uri_mut() = uri;
            }
            Err(e) => warn!(uri = %absolute, error = %e, "Cannot build backend URI"),
        }
    })
}
