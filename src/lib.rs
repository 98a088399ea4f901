//! HTTP and WebSocket reverse proxy core.
//!
//! [`ReverseProxy`] forwards plain HTTP requests to a single backend, stripping
//! hop-by-hop headers and extending `X-Forwarded-For`. [`WsReverseProxy`] dials
//! a backend WebSocket, upgrades the caller and relays frames both ways until
//! either side closes. The [`server`] module ties both to a listener.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod forwarded;
pub mod headers;
pub mod options;
pub mod path;
pub mod pool;
pub mod relay;
pub mod reverse_proxy;
pub mod security;
pub mod server;
pub mod stream;
pub mod tls;
pub mod ws_proxy;

pub use client::{ClientBehavior, HttpClient, default_client};
pub use config::{Config, ListenConfig, RouteConfig, RouteKind, TlsConfig, load_config_from};
pub use context::{ProxyBody, RequestContext};
pub use error::{BackendError, DialError, InvalidTarget, ProxyError, RelayError, UpgradeError};
pub use headers::{HeaderSanitizer, HopHeaders};
pub use options::{Dialer, Options, TungsteniteDialer, Upgrader};
pub use path::join_url_path;
pub use relay::relay;
pub use reverse_proxy::{Director, ErrorHandler, ModifyResponse, ReverseProxy};
pub use security::PeerAllowlist;
pub use server::{Handler, Router};
pub use stream::StreamType;
pub use tls::load_tls_acceptor;
pub use ws_proxy::WsReverseProxy;
