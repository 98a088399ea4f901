//! WebSocket proxy options: director, backend dialer and client upgrader.

use futures_util::future::BoxFuture;
use http::{
    HeaderMap, HeaderValue, Method, Response, StatusCode, Uri,
    header::{
        CONNECTION, HeaderName, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
    },
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::{fmt, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        error::{ProtocolError, SubProtocolError},
        handshake::{client::Response as HandshakeResponse, derive_accept_key},
        protocol::{Role, WebSocketConfig},
    },
};
use tracing::debug;

use crate::context::{RequestContext, empty_body};
use crate::error::{DialError, UpgradeError};

/// Backend side of a relayed WebSocket session.
pub type BackendConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Caller side of a relayed WebSocket session, running over hyper's upgraded IO.
pub type ClientConn = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// Edits the header set sent to the backend on the WebSocket handshake.
/// Entries it inserts replace the defaults of the same name.
pub type WsDirector = Arc<dyn Fn(&RequestContext, &mut HeaderMap) + Send + Sync>;

/// Decides whether the caller's `Origin` is acceptable.
pub type CheckOrigin = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Opens the backend WebSocket connection.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        url: &'a str,
        headers: HeaderMap,
    ) -> BoxFuture<'a, Result<(BackendConn, HandshakeResponse), DialError>>;
}

/// Dials with `tokio-tungstenite`, optionally with a custom frame config.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteDialer {
    config: Option<WebSocketConfig>,
}

impl TungsteniteDialer {
    #[must_use]
    pub const fn with_config(config: WebSocketConfig) -> Self {
        Self {
            config: Some(config),
        }
    }
}

impl Dialer for TungsteniteDialer {
    fn dial<'a>(
        &'a self,
        url: &'a str,
        headers: HeaderMap,
    ) -> BoxFuture<'a, Result<(BackendConn, HandshakeResponse), DialError>> {
        Box::pin(async move {
            let first = self.connect(url, &headers).await;
            let dialed = match first {
                // A backend may ignore every offered protocol; tungstenite fails
                // that handshake, so retry without the offer.
                Err(WsError::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                    SubProtocolError::NoSubProtocol,
                ))) => {
                    debug!(backend = %url, "Backend chose no subprotocol; redialing without an offer");
                    let mut headers = headers;
                    headers.remove(SEC_WEBSOCKET_PROTOCOL);
                    self.connect(url, &headers).await
                }
                dialed => dialed,
            };
            dialed.map_err(|e| DialError::new(url, e))
        })
    }
}

impl TungsteniteDialer {
    async fn connect(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<(BackendConn, HandshakeResponse), WsError> {
        let mut request = url.into_client_request()?;

        let outbound = request.headers_mut();
        for name in headers.keys() {
            outbound.remove(name);
        }
        for (name, value) in headers {
            outbound.append(name.clone(), value.clone());
        }

        connect_async_with_config(request, self.config.clone(), false).await
    }
}

/// Server side of the caller's handshake.
#[derive(Clone)]
pub struct Upgrader {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Protocols this proxy accepts, in preference order. When empty, the
    /// protocol the backend picked is echoed to the caller.
    pub subprotocols: Vec<String>,
    /// `None` accepts requests without `Origin` and same-host origins.
    pub check_origin: Option<CheckOrigin>,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            subprotocols: Vec::new(),
            check_origin: None,
        }
    }
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("subprotocols", &self.subprotocols)
            .field("check_origin", &self.check_origin.is_some())
            .finish()
    }
}

impl Upgrader {
    #[must_use]
    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_check_origin(
        mut self,
        check: impl Fn(&RequestContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_origin = Some(Arc::new(check));
        self
    }

    /// Validates the caller's handshake and writes the `101` response into
    /// `ctx`. The connection is only usable once the returned
    /// [`PendingUpgrade`] resolves, after the response has been sent.
    pub fn upgrade(
        &self,
        ctx: &mut RequestContext,
        backend_protocol: Option<&HeaderValue>,
    ) -> Result<PendingUpgrade, UpgradeError> {
        let method = ctx.request.method();
        if method != Method::GET {
            return Err(UpgradeError::MethodNotAllowed(method.clone()));
        }

        let headers = ctx.request.headers();
        if !has_token(headers, &CONNECTION, "upgrade") {
            return Err(UpgradeError::BadHandshake("missing 'Connection: upgrade'"));
        }
        if !has_token(headers, &UPGRADE, "websocket") {
            return Err(UpgradeError::BadHandshake("missing 'Upgrade: websocket'"));
        }
        if headers
            .get(SEC_WEBSOCKET_VERSION)
            .is_none_or(|version| version != "13")
        {
            return Err(UpgradeError::BadHandshake("unsupported Sec-WebSocket-Version"));
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .ok_or(UpgradeError::BadHandshake("missing Sec-WebSocket-Key"))?;

        let origin_ok = self
            .check_origin
            .as_ref()
            .map_or_else(|| same_origin(ctx), |check| check(ctx));
        if !origin_ok {
            return Err(UpgradeError::OriginRejected);
        }

        let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
            .map_err(|_| UpgradeError::BadHandshake("invalid Sec-WebSocket-Key"))?;
        let protocol = self.select_subprotocol(headers, backend_protocol);

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let response_headers = response.headers_mut();
        response_headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        response_headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        response_headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
        if let Some(protocol) = protocol {
            response_headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        }

        let on_upgrade = hyper::upgrade::on(&mut ctx.request);
        ctx.response = response;

        Ok(PendingUpgrade {
            on_upgrade,
            config: WebSocketConfig::default()
                .read_buffer_size(self.read_buffer_size)
                .write_buffer_size(self.write_buffer_size),
        })
    }

    fn select_subprotocol(
        &self,
        headers: &HeaderMap,
        backend_protocol: Option<&HeaderValue>,
    ) -> Option<HeaderValue> {
        if self.subprotocols.is_empty() {
            return backend_protocol.cloned();
        }
        tokens(headers, &SEC_WEBSOCKET_PROTOCOL)
            .find(|offered| self.subprotocols.iter().any(|p| p == offered))
            .and_then(|chosen| HeaderValue::from_str(chosen).ok())
    }
}

/// A validated upgrade waiting for hyper to hand over the connection.
#[derive(Debug)]
pub struct PendingUpgrade {
    on_upgrade: OnUpgrade,
    config: WebSocketConfig,
}

impl PendingUpgrade {
    pub async fn accept(self) -> Result<ClientConn, UpgradeError> {
        let upgraded = self.on_upgrade.await?;
        Ok(WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            Role::Server,
            Some(self.config),
        )
        .await)
    }
}

fn tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

fn same_origin(ctx: &RequestContext) -> bool {
    let Some(origin) = ctx.request.headers().get(ORIGIN) else {
        return true;
    };
    let origin_host = origin
        .to_str()
        .ok()
        .and_then(|origin| origin.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().map(|a| a.as_str().to_owned()));
    match (origin_host, ctx.host()) {
        (Some(origin_host), Some(host)) => origin_host.eq_ignore_ascii_case(host),
        _ => false,
    }
}

/// Settings for [`crate::WsReverseProxy`].
#[derive(Clone)]
pub struct Options {
    pub director: Option<WsDirector>,
    pub dialer: Arc<dyn Dialer>,
    pub upgrader: Upgrader,
    /// Dial `target + request path` instead of `target`.
    pub dynamic_route: bool,
    /// How long to wait for the second relay direction once the first has
    /// finished. `None` waits indefinitely.
    pub close_grace: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            director: None,
            dialer: Arc::new(TungsteniteDialer::default()),
            upgrader: Upgrader::default(),
            dynamic_route: false,
            close_grace: Some(DEFAULT_CLOSE_GRACE),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("director", &self.director.is_some())
            .field("upgrader", &self.upgrader)
            .field("dynamic_route", &self.dynamic_route)
            .field("close_grace", &self.close_grace)
            .finish_non_exhaustive()
    }
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_director(mut self, director: WsDirector) -> Self {
        self.director = Some(director);
        self
    }

    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    #[must_use]
    pub fn with_upgrader(mut self, upgrader: Upgrader) -> Self {
        self.upgrader = upgrader;
        self
    }

    #[must_use]
    pub const fn with_dynamic_route(mut self) -> Self {
        self.dynamic_route = true;
        self
    }

    #[must_use]
    pub const fn with_close_grace(mut self, close_grace: Option<Duration>) -> Self {
        self.close_grace = close_grace;
        self
    }
}
