//! Per-backend policy gates, applied in order before forwarding:
//! source whitelist, SSL redirect, CORS preflight. Each gate either passes
//! or answers the request itself.

use std::net::SocketAddr;

use hyper::header::{HeaderValue, LOCATION, ORIGIN, VARY};
use hyper::{Method, Request, Response, StatusCode};

use crate::config::{Backend, BackendOptions};

use super::{empty_body, full_body, ProxyBody};

pub enum GateOutcome {
    Pass,
    Reject {
        reason: &'static str,
        response: Response<ProxyBody>,
    },
}

impl GateOutcome {
    fn reject(reason: &'static str, response: Response<ProxyBody>) -> Self {
        Self::Reject { reason, response }
    }
}

/// Run the gates for one request. `raw_host` is the Host header as received
/// (port included), used verbatim in the redirect location.
pub fn apply<B>(
    backend: &Backend,
    proto: &str,
    remote: &SocketAddr,
    raw_host: &str,
    req: &Request<B>,
) -> GateOutcome {
    let options = &backend.options;

    if let Some(response) = whitelist(options, remote) {
        return GateOutcome::reject("whitelist", response);
    }

    if let Some(response) = ssl_redirect(options, proto, raw_host, req) {
        return GateOutcome::reject("ssl-redirect", response);
    }

    if let Some(response) = cors_preflight(options, req) {
        return GateOutcome::reject("cors", response);
    }

    GateOutcome::Pass
}

/// Deny sources outside the configured ranges. Only fires when the range
/// list is non-empty.
fn whitelist(options: &BackendOptions, remote: &SocketAddr) -> Option<Response<ProxyBody>> {
    if options.whitelist_source_range.is_empty() {
        return None;
    }

    let ip = remote.ip();
    if options
        .whitelist_source_range
        .iter()
        .any(|net| net.contains(&ip))
    {
        return None;
    }

    Some(status(StatusCode::FORBIDDEN, "Forbidden\n"))
}

/// Redirect to HTTPS when the backend asks for it and the accepting listener
/// is not the HTTPS one.
fn ssl_redirect<B>(
    options: &BackendOptions,
    proto: &str,
    raw_host: &str,
    req: &Request<B>,
) -> Option<Response<ProxyBody>> {
    if !options.ssl_redirect || proto == "https" {
        return None;
    }

    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{raw_host}{uri}");

    let response = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(empty_body())
        .ok()?;

    Some(response)
}

/// Answer CORS preflights without forwarding them. Only `OPTIONS` requests
/// carrying `Access-Control-Request-Method` are diverted; everything else
/// passes through untouched.
fn cors_preflight<B>(options: &BackendOptions, req: &Request<B>) -> Option<Response<ProxyBody>> {
    if options.cors_allowed_origins.is_empty()
        || req.method() != Method::OPTIONS
        || !req.headers().contains_key("access-control-request-method")
    {
        return None;
    }

    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !origin_allowed(&options.cors_allowed_origins, origin) {
        return Some(status(StatusCode::FORBIDDEN, "origin not allowed\n"));
    }

    let echoed = HeaderValue::from_str(origin).ok()?;
    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", echoed)
        .header("Access-Control-Allow-Credentials", "true")
        .header("Access-Control-Allow-Headers", "*")
        .header(VARY, "Access-Control-Request-Method")
        .header(VARY, "Access-Control-Request-Headers")
        .body(empty_body())
        .ok()?;

    Some(response)
}

/// Match an `Origin` header value against the configured patterns.
pub fn origin_allowed(patterns: &[String], origin: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.as_str() {
        "*" => true,
        p if p.starts_with('*') => origin_hostname(origin).ends_with(&p[1..]),
        p => p == origin,
    })
}

/// The hostname of an origin: scheme and port stripped.
fn origin_hostname(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let rest = rest.split('/').next().unwrap_or(rest);

    match rest.rfind(':') {
        Some(i) if rest[i + 1..].bytes().all(|b| b.is_ascii_digit()) => &rest[..i],
        _ => rest,
    }
}

fn status(code: StatusCode, message: &'static str) -> Response<ProxyBody> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(code)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap()
}
