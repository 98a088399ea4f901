//! Listener, per-connection HTTP/1 serving and path routing.

use anyhow::{Context, Result, bail};
use futures_util::future::BoxFuture;
use http::{Request, StatusCode, uri::Scheme};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RouteConfig, RouteKind};
use crate::context::{RequestContext, boxed_body};
use crate::forwarded::{X_FORWARDED_FOR, parse_original_client_ip};
use crate::options::Options;
use crate::reverse_proxy::ReverseProxy;
use crate::security::PeerAllowlist;
use crate::stream::StreamType;
use crate::tls::load_tls_acceptor;
use crate::ws_proxy::WsReverseProxy;

/// Fills in `ctx.response` for `ctx.request`.
pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()>;
}

impl Handler for ReverseProxy {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        Box::pin(self.serve_http(ctx))
    }
}

impl Handler for WsReverseProxy {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        Box::pin(self.serve(ctx))
    }
}

/// Dispatches on the exact request path, then on the longest matching
/// prefix route; anything else is a 404.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
    prefixes: Vec<(String, Arc<dyn Handler>)>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(prefix, _)| prefix).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.routes.insert(path.into(), handler);
        self
    }

    /// Serves `prefix` itself and every path below it.
    #[must_use]
    pub fn route_prefix(mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        self.prefixes.retain(|(existing, _)| *existing != prefix);
        self.prefixes.push((prefix, handler));
        self.prefixes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
        self
    }

    fn lookup(&self, path: &str) -> Option<Arc<dyn Handler>> {
        self.routes
            .get(path)
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|(prefix, _)| is_under(path, prefix))
                    .map(|(_, handler)| handler)
            })
            .cloned()
    }

    /// Builds one proxy per configured route.
    pub fn from_routes(routes: &[RouteConfig]) -> Result<Self> {
        let mut router = Self::new();
        let mut seen = HashSet::new();
        for route in routes {
            if !seen.insert(route.path.as_str()) {
                bail!("Duplicate route path: {}", route.path);
            }

            let handler: Arc<dyn Handler> = match route.kind {
                RouteKind::Http => {
                    let mut proxy = ReverseProxy::new(route.target.clone());
                    proxy.set_client_behavior(route.client_behavior()?);
                    proxy.set_transfer_trailer(route.transfer_trailer);
                    proxy.set_save_origin_response_header(route.save_origin_response_header);
                    Arc::new(proxy)
                }
                RouteKind::Websocket => {
                    let mut options = Options::new();
                    if let Some(grace) = route.close_grace() {
                        options = options.with_close_grace(Some(grace));
                    }
                    if route.dynamic_route {
                        options = options.with_dynamic_route();
                    }
                    Arc::new(
                        WsReverseProxy::new(route.target.clone(), options)
                            .with_context(|| format!("Invalid route {}", route.path))?,
                    )
                }
            };

            // A dynamic route forwards whatever lies below its path.
            let dynamic = route.kind == RouteKind::Websocket && route.dynamic_route;
            info!(
                path = %route.path,
                target = %route.target,
                kind = ?route.kind,
                dynamic,
                "Route configured"
            );
            router = if dynamic {
                router.route_prefix(route.path.clone(), handler)
            } else {
                router.route(route.path.clone(), handler)
            };
        }
        Ok(router)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len() + self.prefixes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

impl Handler for Router {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        let handler = self.lookup(ctx.request.uri().path());
        Box::pin(async move {
            match handler {
                Some(handler) => handler.handle(ctx).await,
                None => {
                    debug!(path = %ctx.request.uri().path(), "No route");
                    *ctx.response.status_mut() = StatusCode::NOT_FOUND;
                }
            }
        })
    }
}

/// Serves HTTP/1 requests on one connection, with upgrades enabled.
pub async fn serve_connection<S, H>(
    stream: S,
    remote_addr: SocketAddr,
    scheme: Scheme,
    handler: Arc<H>,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: Handler + ?Sized,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = handler.clone();
        let scheme = scheme.clone();
        async move {
            if let Some(original) = request
                .headers()
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_original_client_ip)
            {
                debug!(client_addr = %remote_addr, original_client = %original, "Forwarded request");
            }

            let mut ctx =
                RequestContext::new(request.map(boxed_body), remote_addr).with_scheme(scheme);
            handler.handle(&mut ctx).await;
            Ok::<_, Infallible>(ctx.into_response())
        }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

/// Accepts connections until the listener fails.
pub async fn serve<H>(
    listener: TcpListener,
    handler: Arc<H>,
    tls: Option<TlsAcceptor>,
    allowlist: PeerAllowlist,
) -> Result<()>
where
    H: Handler + ?Sized,
{
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept connection")?;

        if !allowlist.allows(peer.ip()) {
            warn!(client_addr = %peer, "Connection rejected: peer not in allowlist");
            continue;
        }

        let handler = handler.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let stream = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => StreamType::Tls(Box::new(stream)),
                    Err(e) => {
                        warn!(client_addr = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => StreamType::Plain(stream),
            };

            let scheme = stream.scheme();
            if let Err(e) = serve_connection(stream, peer, scheme, handler).await {
                error!(client_addr = %peer, error = %e, "Connection failed");
            }
        });
    }
}

/// Binds the configured listener and serves every configured route.
pub async fn run(config: Config) -> Result<()> {
    let router = Router::from_routes(&config.routes)?;
    if router.is_empty() {
        warn!("No routes configured; every request will get 404");
    }

    let allowlist = PeerAllowlist::parse(config.listen.allowed_proxy_ips.as_deref())?;
    let tls = config
        .listen
        .tls
        .as_ref()
        .map(load_tls_acceptor)
        .transpose()?;

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        tls = tls.is_some(),
        routes = router.len(),
        "Reverse proxy listening"
    );

    serve(listener, Arc::new(router), tls, allowlist).await
}

/// Serves `handler` over plain HTTP on a loopback port.
#[cfg(test)]
pub(crate) async fn spawn_test_server<H>(handler: Arc<H>) -> std::io::Result<u16>
where
    H: Handler + ?Sized,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, peer, Scheme::HTTP, handler.clone()));
        }
    });
    Ok(port)
}
