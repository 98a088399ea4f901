//! `X-Forwarded-For` / `X-Forwarded-Proto` composition.

use http::{HeaderMap, HeaderName, HeaderValue, uri::Scheme};
use std::net::IpAddr;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Builds the next `X-Forwarded-For` value from the prior chain.
///
/// Repeated headers are joined with `", "`. Returns `None` when a prior value
/// exists but is empty: an explicitly blanked chain is left alone.
#[must_use]
pub fn compose_forwarded_for(prior: &HeaderMap, client_ip: IpAddr) -> Option<String> {
    let values: Vec<&str> = prior
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    if values.is_empty() && prior.contains_key(X_FORWARDED_FOR) {
        // Present but not valid UTF-8; keep the chain untouched.
        return None;
    }

    let chain = values.join(", ");
    match (values.is_empty(), chain.is_empty()) {
        (true, _) => Some(client_ip.to_string()),
        (false, true) => None,
        (false, false) => Some(format!("{chain}, {client_ip}")),
    }
}

#[must_use]
pub fn forwarded_proto(scheme: &Scheme) -> &'static str {
    if *scheme == Scheme::HTTPS {
        "https"
    } else {
        "http"
    }
}

/// Writes `X-Forwarded-For` and `X-Forwarded-Proto` into a fresh `dst`,
/// chaining from the `X-Forwarded-For` found in `prior`. A blank prior chain
/// restarts at `client_ip`.
pub fn apply_forwarded_headers(
    prior: &HeaderMap,
    dst: &mut HeaderMap,
    client_ip: IpAddr,
    scheme: &Scheme,
) {
    let chain = compose_forwarded_for(prior, client_ip).unwrap_or_else(|| client_ip.to_string());
    write_forwarded(dst, Some(chain), scheme);
}

/// Extends the `X-Forwarded-For` already in `headers`. A value left blank
/// (e.g. by a director) stays blank.
pub fn append_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, scheme: &Scheme) {
    let chain = compose_forwarded_for(headers, client_ip);
    write_forwarded(headers, chain, scheme);
}

fn write_forwarded(dst: &mut HeaderMap, chain: Option<String>, scheme: &Scheme) {
    if let Some(value) = chain.and_then(|chain| HeaderValue::from_str(&chain).ok()) {
        dst.insert(X_FORWARDED_FOR, value);
    }
    dst.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(forwarded_proto(scheme)),
    );
}

/// Leftmost address of an `X-Forwarded-For` chain, i.e. the originating client.
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}
