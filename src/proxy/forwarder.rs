//! Upstream forwarding: the shared HTTP client, forwarding-header rewrite,
//! streaming pass-through and WebSocket upgrades.
//!
//! Upstream TLS never verifies certificates: upstreams are trusted
//! cluster-internal endpoints reached by resolved endpoint address, not by
//! name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, error};

use super::{status_response, ProxyBody};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Everything the forwarder needs to know about one request besides the
/// request itself.
pub struct ForwardContext {
    pub request_id: String,
    /// Selected endpoint, `host:port`.
    pub target: String,
    /// `http`, or `https` when the backend asks for secure upstreams.
    pub scheme: &'static str,
    /// Host header as received, passed through and echoed in the forwarding
    /// headers.
    pub host: String,
    pub remote: SocketAddr,
    /// Protocol of the accepting listener.
    pub proto: &'static str,
}

pub struct Forwarder {
    /// HTTP/1.1 to upstreams, for the generic path and upgrades.
    client: UpstreamClient,
    /// HTTP/2 (prior knowledge or ALPN) to upstreams, for the gRPC bridge.
    h2_client: UpstreamClient,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: build_client(false),
            h2_client: build_client(true),
        }
    }

    pub(crate) fn h2_client(&self) -> &UpstreamClient {
        &self.h2_client
    }

    /// Generic forwarding: stream the request up and the response back.
    /// Requests asking for a protocol upgrade get both raw connections
    /// joined once the upstream answers 101.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        ctx: ForwardContext,
    ) -> Response<ProxyBody> {
        let upgrading = wants_upgrade(req.headers());
        let client_upgrade = upgrading.then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();
        let upstream_req = match build_upstream_request(&parts, body.boxed(), &ctx, upgrading) {
            Ok(r) => r,
            Err(e) => {
                error!(req = %ctx.request_id, error = %e, "failed to build upstream request");
                return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
            }
        };

        let mut response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                error!(req = %ctx.request_id, backend = %ctx.target, error = %e, "upstream request failed");
                return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(join_upgraded(
                    client_upgrade,
                    upstream_upgrade,
                    ctx.request_id.clone(),
                ));
            }
            // hand the 101 back untouched; the connection is taken over
            return response.map(|body| body.boxed());
        }

        let mut response = response.map(|body| body.boxed());
        strip_hop_by_hop(response.headers_mut());
        response
    }
}

fn build_client(h2: bool) -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(DIAL_TIMEOUT));
    http.set_keepalive(Some(TCP_KEEPALIVE));

    let tls = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureUpstreamVerifier))
        .with_no_client_auth();

    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http();
    let connector = if h2 {
        builder.enable_http2().wrap_connector(http)
    } else {
        builder.enable_http1().wrap_connector(http)
    };

    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);
    if h2 {
        builder.http2_only(true);
    }
    builder.build(connector)
}

/// Build the request sent upstream: same method and URI path, rewritten
/// authority, forwarding headers appended.
pub(crate) fn build_upstream_request(
    parts: &http::request::Parts,
    body: ProxyBody,
    ctx: &ForwardContext,
    keep_upgrade: bool,
) -> Result<Request<ProxyBody>, http::Error> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}://{}{}", ctx.scheme, ctx.target, path_and_query).parse()?;

    let mut req = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)?;
    *req.headers_mut() = rewrite_headers(&parts.headers, ctx, keep_upgrade)?;

    Ok(req)
}

/// Copy the client's headers for the upstream request.
///
/// Hop-by-hop headers stay on this hop (kept for upgrades, which need
/// `Connection` and `Upgrade` to cross). Any incoming `Forwarded` and
/// `X-Forwarded-*` are dropped and exactly one copy of each is appended,
/// RFC 7239 style. The Host header passes through untouched.
pub(crate) fn rewrite_headers(
    headers: &HeaderMap,
    ctx: &ForwardContext,
    keep_upgrade: bool,
) -> Result<HeaderMap, http::Error> {
    let mut out = HeaderMap::with_capacity(headers.len() + 4);

    for (name, value) in headers {
        let n = name.as_str();
        if n == "forwarded" || n.starts_with("x-forwarded-") {
            continue;
        }
        if is_hop_by_hop(n) && !(keep_upgrade && (n == "connection" || n == "upgrade")) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if !out.contains_key(HOST) && !ctx.host.is_empty() {
        out.insert(HOST, HeaderValue::from_str(&ctx.host)?);
    }

    let remote = ctx.remote.to_string();
    out.append(
        HeaderName::from_static("x-forwarded-for"),
        HeaderValue::from_str(&remote)?,
    );
    out.append(
        HeaderName::from_static("x-forwarded-host"),
        HeaderValue::from_str(&ctx.host)?,
    );
    out.append(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_str(ctx.proto)?,
    );
    out.append(
        HeaderName::from_static("forwarded"),
        HeaderValue::from_str(&format!(
            "for={remote}, host={}, proto={}",
            ctx.host, ctx.proto
        ))?,
    );

    Ok(out)
}

/// Hop-by-hop headers per RFC 2616 section 13.5.1.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();

    for name in doomed {
        headers.remove(name);
    }
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    if !headers.contains_key(UPGRADE) {
        return false;
    }

    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

/// Join the two hijacked connections of an upgraded request and stream both
/// ways until either side closes.
async fn join_upgraded(client: OnUpgrade, upstream: OnUpgrade, request_id: String) {
    match tokio::try_join!(client, upstream) {
        Ok((client, upstream)) => {
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                debug!(req = %request_id, error = %e, "upgraded stream closed with error");
            }
        }
        Err(e) => debug!(req = %request_id, error = %e, "upgrade failed"),
    }
}

/// Accept any upstream certificate (the `InsecureSkipVerify` of the TLS
/// client config).
#[derive(Debug)]
struct InsecureUpstreamVerifier;

impl ServerCertVerifier for InsecureUpstreamVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
