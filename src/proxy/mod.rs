//! The request path: listeners, dispatcher, policy gates, forwarders and
//! TLS termination.

pub mod tls;

mod access_log;
mod forwarder;
mod gates;
mod grpc;
mod handler;
mod server;

pub use access_log::AccessLog;
pub use forwarder::{ForwardContext, Forwarder};
pub use handler::Dispatcher;
pub use server::{serve_http, serve_https, serve_ssl_redirect};

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Body type flowing through the proxy: streamed upstream bodies and small
/// generated responses, boxed to one type.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

/// A plain-text status response.
pub(crate) fn status_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap()
}
