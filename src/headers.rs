//! Hop-by-hop header stripping (RFC 7230, section 6.1).

use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{CONNECTION, TE, TRAILER},
};

/// Headers removed from every forwarded request and response. These are the
/// RFC 2616 (section 13.5.1) hop-by-hop headers plus `Proxy-Connection`,
/// which is non-standard but still sent by some clients.
const DEFAULT_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Ordered set of header names that are only meaningful for one transport leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopHeaders {
    names: Vec<HeaderName>,
}

impl Default for HopHeaders {
    fn default() -> Self {
        Self {
            names: DEFAULT_HOP_HEADERS
                .into_iter()
                .map(HeaderName::from_static)
                .collect(),
        }
    }
}

impl HopHeaders {
    #[must_use]
    pub fn with(mut self, name: HeaderName) -> Self {
        self.push(name);
        self
    }

    pub fn push(&mut self, name: HeaderName) {
        if !self.contains(&name) {
            self.names.push(name);
        }
    }

    #[must_use]
    pub fn contains(&self, name: &HeaderName) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderName> {
        self.names.iter()
    }
}

/// Strips hop-by-hop headers from one leg of a proxied exchange.
#[derive(Debug, Clone, Default)]
pub struct HeaderSanitizer {
    hop_headers: HopHeaders,
}

impl HeaderSanitizer {
    #[must_use]
    pub const fn new(hop_headers: HopHeaders) -> Self {
        Self { hop_headers }
    }

    #[must_use]
    pub const fn hop_headers(&self) -> &HopHeaders {
        &self.hop_headers
    }

    /// Sanitizes an outbound request header set.
    ///
    /// Returns `true` when trailer forwarding applies to this exchange, i.e.
    /// `transfer_trailer` is set and the caller declared `Te: trailers`. In
    /// that case a single `Te: trailers` is put back and `Trailer` survives.
    pub fn sanitize_request(&self, headers: &mut HeaderMap, transfer_trailer: bool) -> bool {
        // Must be checked first: stripping removes the evidence.
        let keep_trailer = transfer_trailer && has_te_trailers(headers);

        remove_connection_headers(headers);
        self.remove_hop_headers(headers, keep_trailer);

        if keep_trailer {
            headers.insert(TE, HeaderValue::from_static("trailers"));
        }
        keep_trailer
    }

    /// Sanitizes an inbound response header set.
    pub fn sanitize_response(&self, headers: &mut HeaderMap, keep_trailer: bool) {
        remove_connection_headers(headers);
        self.remove_hop_headers(headers, keep_trailer);
    }

    fn remove_hop_headers(&self, headers: &mut HeaderMap, keep_trailer: bool) {
        for name in self.hop_headers.iter() {
            if keep_trailer && *name == TRAILER {
                continue;
            }
            headers.remove(name);
        }
    }
}

/// Removes every header named as a token in any `Connection` header.
pub fn remove_connection_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
}

/// Whether any `Te` header occurrence mentions `trailers`.
#[must_use]
pub fn has_te_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .any(|value| value.as_bytes().to_ascii_lowercase().windows(8).any(|w| w == b"trailers"))
}
