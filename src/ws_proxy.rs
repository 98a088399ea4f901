//! WebSocket reverse proxy: second handshake to the backend, then relay.

use http::{
    HeaderMap, HeaderValue, Response, StatusCode,
    header::{self, COOKIE, HOST, ORIGIN, SEC_WEBSOCKET_PROTOCOL},
};
use tracing::{Instrument, debug, error};

use crate::context::{RequestContext, empty_body, full_body};
use crate::error::{DialError, InvalidTarget};
use crate::forwarded::apply_forwarded_headers;
use crate::options::Options;
use crate::relay::relay;

/// Headers copied from the caller's handshake when present.
const FORWARDED_HANDSHAKE_HEADERS: [header::HeaderName; 3] = [ORIGIN, SEC_WEBSOCKET_PROTOCOL, COOKIE];

/// Bridges a caller's WebSocket upgrade to a backend WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsReverseProxy {
    target: String,
    options: Options,
}

impl WsReverseProxy {
    /// `target` is the backend URL (`ws://…` or `wss://…`).
    pub fn new(target: impl Into<String>, options: Options) -> Result<Self, InvalidTarget> {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(InvalidTarget(target));
        }
        Ok(Self { target, options })
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Handles one upgrade request. On success `ctx.response` holds the `101`
    /// and the relay runs on its own task once the server hands over the
    /// connection.
    #[tracing::instrument(skip_all, fields(target = %self.target, client_addr = %ctx.remote_addr()))]
    pub async fn serve(&self, ctx: &mut RequestContext) {
        let forward = self.forward_headers(ctx);
        let url = self.backend_url(ctx);

        let (backend, handshake) = match self.options.dialer.dial(&url, forward).await {
            Ok(dialed) => dialed,
            Err(err) => {
                error!(backend = %url, error = %err, "Cannot dial backend");
                respond_dial_failure(ctx, &err);
                return;
            }
        };
        debug!(backend = %url, "Backend handshake complete");

        let backend_protocol = handshake.headers().get(SEC_WEBSOCKET_PROTOCOL);
        let pending = match self.options.upgrader.upgrade(ctx, backend_protocol) {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "Cannot upgrade client connection");
                let mut response = Response::new(empty_body());
                *response.status_mut() = err.status();
                ctx.response = response;
                return;
            }
        };

        let close_grace = self.options.close_grace;
        tokio::spawn(
            async move {
                match pending.accept().await {
                    Ok(client) => relay(client, backend, close_grace).await,
                    Err(err) => error!(error = %err, "Client upgrade did not complete"),
                }
            }
            .in_current_span(),
        );
    }

    fn backend_url(&self, ctx: &RequestContext) -> String {
        if self.options.dynamic_route {
            format!("{}{}", self.target, ctx.request.uri().path())
        } else {
            self.target.clone()
        }
    }

    fn forward_headers(&self, ctx: &RequestContext) -> HeaderMap {
        let inbound = ctx.request.headers();
        let mut forward = HeaderMap::new();

        for name in &FORWARDED_HANDSHAKE_HEADERS {
            for value in inbound.get_all(name) {
                forward.append(name.clone(), value.clone());
            }
        }
        if let Some(host) = ctx.host().and_then(|host| HeaderValue::from_str(host).ok()) {
            forward.insert(HOST, host);
        }
        apply_forwarded_headers(inbound, &mut forward, ctx.remote_addr().ip(), ctx.scheme());

        if let Some(director) = &self.options.director {
            director(ctx, &mut forward);
        }
        forward
    }
}

/// Relays the backend's refusal if it sent one, otherwise answers 503.
fn respond_dial_failure(ctx: &mut RequestContext, err: &DialError) {
    let Some(rejected) = err.response() else {
        let mut response = Response::new(full_body(err.to_string()));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        ctx.response = response;
        return;
    };

    let mut response = Response::new(full_body(rejected.body));
    *response.status_mut() = rejected.status;
    for (name, value) in &rejected.headers {
        // Framing is recomputed from the copied body.
        if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    ctx.response = response;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Dialer, Upgrader, WsDirector};
    use crate::server::{Router, spawn_test_server};
    use anyhow::{Context, Result};
    use futures_util::{SinkExt, StreamExt, future::BoxFuture};
    use http_body_util::BodyExt;
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            handshake::{
                client::Response as ClientResponse,
                server::{Request as HandshakeRequest, Response as HandshakeReply},
            },
        },
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
    type SeenHeaders = Arc<Mutex<Vec<(String, HeaderMap)>>>;

    /// Echo backend that records the path and headers of every handshake and
    /// accepts `test-protocol` when offered.
    async fn start_echo_backend() -> Result<(u16, SeenHeaders)> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind echo backend")?;
        let port = listener.local_addr()?.port();
        let seen = SeenHeaders::default();
        let record = seen.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let record = record.clone();
                tokio::spawn(async move {
                    let callback = move |req: &HandshakeRequest, mut reply: HandshakeReply| {
                        record
                            .lock()
                            .unwrap()
                            .push((req.uri().path().to_string(), req.headers().clone()));
                        let offered = req
                            .headers()
                            .get(SEC_WEBSOCKET_PROTOCOL)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        if offered.split(',').any(|p| p.trim() == "test-protocol") {
                            reply.headers_mut().insert(
                                SEC_WEBSOCKET_PROTOCOL,
                                HeaderValue::from_static("test-protocol"),
                            );
                        }
                        Ok(reply)
                    };
                    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        if message.is_close() || ws.send(message).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Ok((port, seen))
    }

    async fn start_proxy(router: Router) -> Result<u16> {
        Ok(spawn_test_server(Arc::new(router)).await?)
    }

    async fn start_ws_proxy(path: &str, target: String, options: Options) -> Result<u16> {
        let proxy = WsReverseProxy::new(target, options)?;
        start_proxy(Router::new().route(path, Arc::new(proxy))).await
    }

    async fn connect(url: &str, protocols: Option<&'static str>) -> Result<(ClientWs, ClientResponse)> {
        let mut request = url.into_client_request()?;
        if let Some(protocols) = protocols {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocols));
        }
        timeout(TEST_TIMEOUT, connect_async(request))
            .await
            .context("Timeout connecting through proxy")?
            .context("Failed to connect through proxy")
    }

    async fn echo_text(ws: &mut ClientWs, text: &str) -> Result<Message> {
        ws.send(Message::Text(text.into())).await?;
        timeout(TEST_TIMEOUT, ws.next())
            .await
            .context("Timeout waiting for echo")?
            .context("Stream ended")?
            .context("WebSocket error")
    }

    mod relaying {
        use super::*;

        #[tokio::test]
        async fn text_round_trip_with_subprotocol() {
            let (backend_port, seen) = start_echo_backend().await.unwrap();
            let upgrader = Upgrader::default()
                .with_buffer_sizes(4096, 4096)
                .with_check_origin(|_| true)
                .with_subprotocols(["test-protocol"]);
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}"),
                Options::new().with_upgrader(upgrader),
            )
            .await
            .unwrap();

            let (mut ws, response) = connect(
                &format!("ws://127.0.0.1:{proxy_port}/proxy"),
                Some("test-protocol, test-notsupported"),
            )
            .await
            .unwrap();

            let protocols: Vec<_> = response
                .headers()
                .get_all(SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .collect();
            assert_eq!(protocols, ["test-protocol"]);

            assert_eq!(
                echo_text(&mut ws, "hello world").await.unwrap(),
                Message::Text("hello world".into())
            );

            let seen = seen.lock().unwrap();
            let (_, headers) = &seen[0];
            assert_eq!(headers[HOST], format!("127.0.0.1:{proxy_port}").as_str());
            assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
            assert_eq!(headers["x-forwarded-proto"], "http");
        }

        #[tokio::test]
        async fn binary_round_trip_with_defaults() {
            let (backend_port, _) = start_echo_backend().await.unwrap();
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}/echo"),
                Options::new(),
            )
            .await
            .unwrap();

            let (mut ws, _) = connect(&format!("ws://127.0.0.1:{proxy_port}/proxy"), None)
                .await
                .unwrap();
            let payload = vec![0x5A; 4000];
            ws.send(Message::Binary(payload.clone().into())).await.unwrap();
            let echoed = timeout(TEST_TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(echoed, Message::Binary(payload.into()));
        }

        #[tokio::test]
        async fn dynamic_route_keeps_sessions_apart() {
            let (backend_port, seen) = start_echo_backend().await.unwrap();
            let proxy = Arc::new(
                WsReverseProxy::new(
                    format!("ws://127.0.0.1:{backend_port}/api"),
                    Options::new().with_dynamic_route(),
                )
                .unwrap(),
            );
            let proxy_port = start_proxy(
                Router::new()
                    .route("/test", proxy.clone())
                    .route("/test2", proxy),
            )
            .await
            .unwrap();

            let (mut first, _) = connect(&format!("ws://127.0.0.1:{proxy_port}/test"), None)
                .await
                .unwrap();
            let (mut second, _) = connect(&format!("ws://127.0.0.1:{proxy_port}/test2"), None)
                .await
                .unwrap();

            let (a, b) = tokio::join!(
                echo_text(&mut first, "hello world"),
                echo_text(&mut second, "hello world2")
            );
            assert_eq!(a.unwrap(), Message::Text("hello world".into()));
            assert_eq!(b.unwrap(), Message::Text("hello world2".into()));

            let mut paths: Vec<_> = seen.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
            paths.sort();
            assert_eq!(paths, ["/api/test", "/api/test2"]);
        }

        #[tokio::test]
        async fn director_overrides_forward_headers() {
            let (backend_port, seen) = start_echo_backend().await.unwrap();
            let director: WsDirector = Arc::new(|_, headers| {
                headers.insert("x-test-head", HeaderValue::from_static("content"));
                headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
            });
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}"),
                Options::new().with_director(director),
            )
            .await
            .unwrap();

            let (mut ws, _) = connect(&format!("ws://127.0.0.1:{proxy_port}/proxy"), None)
                .await
                .unwrap();
            echo_text(&mut ws, "ping").await.unwrap();

            let seen = seen.lock().unwrap();
            let (_, headers) = &seen[0];
            assert_eq!(headers["x-test-head"], "content");
            assert_eq!(headers["x-forwarded-proto"], "https");
        }

        #[tokio::test]
        async fn unsupported_protocol_offer_still_relays() {
            let (backend_port, seen) = start_echo_backend().await.unwrap();
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}"),
                Options::new(),
            )
            .await
            .unwrap();

            let request = http::Request::builder()
                .uri(format!("http://127.0.0.1:{proxy_port}/proxy"))
                .header("connection", "Upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .header("sec-websocket-protocol", "chat")
                .body(empty_body())
                .unwrap();
            let response = timeout(TEST_TIMEOUT, crate::client::default_client().request(request))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
            assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());

            let upgraded = hyper::upgrade::on(response).await.unwrap();
            let mut ws = WebSocketStream::from_raw_socket(
                hyper_util::rt::TokioIo::new(upgraded),
                tokio_tungstenite::tungstenite::protocol::Role::Client,
                None,
            )
            .await;
            ws.send(Message::Text("still here".into())).await.unwrap();
            let echoed = timeout(TEST_TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(echoed, Message::Text("still here".into()));

            let seen = seen.lock().unwrap();
            let (_, last_handshake) = seen.last().unwrap();
            assert!(last_handshake.get(SEC_WEBSOCKET_PROTOCOL).is_none());
        }
    }

    mod failures {
        use super::*;

        async fn raw_get(port: u16, path: &str) -> Result<Response<bytes::Bytes>> {
            let client = crate::client::default_client();
            let request = http::Request::builder()
                .uri(format!("http://127.0.0.1:{port}{path}"))
                .header("connection", "Upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(empty_body())?;
            let response = timeout(TEST_TIMEOUT, client.request(request)).await??;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(Response::from_parts(parts, body))
        }

        /// Answers every connection with a fixed HTTP refusal.
        async fn start_refusing_backend() -> Result<u16> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 401 Unauthorized\r\n\
                              x-reason: token expired\r\n\
                              content-length: 6\r\n\r\n\
                              denied",
                        )
                        .await;
                }
            });
            Ok(port)
        }

        #[tokio::test]
        async fn unreachable_backend_is_503() {
            let closed_port = {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                listener.local_addr().unwrap().port()
            };
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{closed_port}"),
                Options::new(),
            )
            .await
            .unwrap();

            let response = raw_get(proxy_port, "/proxy").await.unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            let body = String::from_utf8_lossy(response.body());
            assert!(body.contains(&format!("ws://127.0.0.1:{closed_port}")), "{body}");
        }

        #[tokio::test]
        async fn backend_refusal_copied_verbatim() {
            let backend_port = start_refusing_backend().await.unwrap();
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}"),
                Options::new(),
            )
            .await
            .unwrap();

            let response = raw_get(proxy_port, "/proxy").await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()["x-reason"], "token expired");
            assert_eq!(response.body().as_ref(), b"denied");
        }

        #[tokio::test]
        async fn rejected_upgrade_uses_upgrader_status() {
            let (backend_port, _) = start_echo_backend().await.unwrap();
            let proxy_port = start_ws_proxy(
                "/proxy",
                format!("ws://127.0.0.1:{backend_port}"),
                Options::new().with_upgrader(Upgrader::default().with_check_origin(|_| false)),
            )
            .await
            .unwrap();

            let err = connect(&format!("ws://127.0.0.1:{proxy_port}/proxy"), None)
                .await
                .unwrap_err();
            assert!(format!("{err:#}").contains("403"), "{err:#}");
        }

        #[test]
        fn empty_target_rejected() {
            assert!(WsReverseProxy::new("", Options::new()).is_err());
            assert!(WsReverseProxy::new("  ", Options::new()).is_err());
        }
    }

    mod dialer_seam {
        use super::*;

        type Dialed = Arc<Mutex<Vec<(String, HeaderMap)>>>;

        /// Records the dial and fails it without a response.
        struct RecordingDialer(Dialed);

        impl Dialer for RecordingDialer {
            fn dial<'a>(
                &'a self,
                url: &'a str,
                headers: HeaderMap,
            ) -> BoxFuture<'a, Result<(crate::options::BackendConn, ClientResponse), DialError>>
            {
                self.0.lock().unwrap().push((url.to_string(), headers));
                let err = DialError::new(url, tokio_tungstenite::tungstenite::Error::ConnectionClosed);
                Box::pin(std::future::ready(Err::<(crate::options::BackendConn, ClientResponse), _>(err)))
            }
        }

        fn handshake_ctx(path: &str) -> RequestContext {
            let request = http::Request::builder()
                .uri(path)
                .header("host", "proxy.local")
                .header("origin", "http://proxy.local")
                .header("cookie", "a=1")
                .header("cookie", "b=2")
                .header("x-forwarded-for", "203.0.113.5")
                .header("authorization", "Bearer secret")
                .body(empty_body())
                .unwrap();
            let addr: SocketAddr = "10.1.2.3:999".parse().unwrap();
            RequestContext::new(request, addr)
        }

        #[tokio::test]
        async fn forwards_selected_headers_to_dynamic_url() {
            let dialed = Dialed::default();
            let proxy = WsReverseProxy::new(
                "ws://backend:9000/api",
                Options::new()
                    .with_dialer(Arc::new(RecordingDialer(dialed.clone())))
                    .with_dynamic_route(),
            )
            .unwrap();

            let mut ctx = handshake_ctx("/chat?room=1");
            proxy.serve(&mut ctx).await;
            assert_eq!(ctx.response.status(), StatusCode::SERVICE_UNAVAILABLE);

            let dialed = dialed.lock().unwrap();
            let (url, headers) = &dialed[0];
            assert_eq!(url, "ws://backend:9000/api/chat");
            assert_eq!(headers[HOST], "proxy.local");
            assert_eq!(headers[ORIGIN], "http://proxy.local");
            assert_eq!(headers.get_all(COOKIE).iter().count(), 2);
            assert_eq!(headers["x-forwarded-for"], "203.0.113.5, 10.1.2.3");
            assert!(headers.get("authorization").is_none());
        }

        #[tokio::test]
        async fn blank_forwarded_for_restarts_chain() {
            let dialed = Dialed::default();
            let proxy = WsReverseProxy::new(
                "ws://backend:9000/api",
                Options::new().with_dialer(Arc::new(RecordingDialer(dialed.clone()))),
            )
            .unwrap();

            let request = http::Request::builder()
                .uri("/chat")
                .header("host", "proxy.local")
                .header("x-forwarded-for", "")
                .body(empty_body())
                .unwrap();
            let mut ctx = RequestContext::new(request, "10.1.2.3:999".parse().unwrap());
            proxy.serve(&mut ctx).await;

            let dialed = dialed.lock().unwrap();
            assert_eq!(dialed[0].1["x-forwarded-for"], "10.1.2.3");
        }
    }
}
