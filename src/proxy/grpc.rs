//! gRPC and gRPC-Web bridging.
//!
//! gRPC is proxied at the HTTP/2 layer: DATA frames are the raw messages,
//! so streaming a request and response body end-to-end over the dedicated
//! HTTP/2 client is an opaque bidirectional message copy, with headers and
//! trailers passing through and cancellation propagating when either body
//! is dropped.
//!
//! gRPC-Web arrives as an HTTP/1.1 POST with identical message framing;
//! only the content type and the trailer transport differ. Requests are
//! re-labelled `application/grpc` upstream, and response trailers are
//! re-encoded as the trailer frame (flag `0x80`) appended to the body.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use http_body::{Body, Frame};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TE};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error};

use super::forwarder::{build_upstream_request, ForwardContext, Forwarder};
use super::{empty_body, status_response, ProxyBody};

const GRPC_WEB_PREFIX: &str = "application/grpc-web";

impl Forwarder {
    /// Forward a gRPC request over the HTTP/2 client.
    pub async fn forward_grpc(
        &self,
        req: Request<Incoming>,
        ctx: ForwardContext,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let mut upstream_req = match build_upstream_request(&parts, body.boxed(), &ctx, false) {
            Ok(r) => r,
            Err(e) => {
                error!(req = %ctx.request_id, error = %e, "failed to build grpc request");
                return grpc_unavailable(None);
            }
        };
        upstream_req
            .headers_mut()
            .insert(TE, HeaderValue::from_static("trailers"));

        match self.h2_client().request(upstream_req).await {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                error!(req = %ctx.request_id, backend = %ctx.target, error = %e, "grpc backend unavailable");
                grpc_unavailable(None)
            }
        }
    }

    /// Forward a gRPC-Web request: translate the content type upstream and
    /// fold the response trailers into the body on the way back.
    pub async fn forward_grpc_web(
        &self,
        req: Request<Incoming>,
        ctx: ForwardContext,
    ) -> Response<ProxyBody> {
        let web_content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(GRPC_WEB_PREFIX)
            .to_string();

        // The text variant wraps every frame in base64; nothing speaks it
        // against this proxy.
        if web_content_type.starts_with("application/grpc-web-text") {
            return status_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "grpc-web-text is not supported\n",
            );
        }

        let grpc_content_type =
            format!("application/grpc{}", &web_content_type[GRPC_WEB_PREFIX.len()..]);

        let (parts, body) = req.into_parts();
        let mut upstream_req = match build_upstream_request(&parts, body.boxed(), &ctx, false) {
            Ok(r) => r,
            Err(e) => {
                error!(req = %ctx.request_id, error = %e, "failed to build grpc-web request");
                return grpc_unavailable(Some(&web_content_type));
            }
        };

        let headers = upstream_req.headers_mut();
        headers.insert(TE, HeaderValue::from_static("trailers"));
        match HeaderValue::from_str(&grpc_content_type) {
            Ok(v) => {
                headers.insert(CONTENT_TYPE, v);
            }
            Err(_) => {
                return status_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "bad content type\n")
            }
        }

        let response = match self.h2_client().request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                error!(req = %ctx.request_id, backend = %ctx.target, error = %e, "grpc-web backend unavailable");
                return grpc_unavailable(Some(&web_content_type));
            }
        };

        let (mut parts, body) = response.into_parts();

        // the trailer frame changes the length
        parts.headers.remove(CONTENT_LENGTH);
        let response_content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| ct.strip_prefix("application/grpc"))
            .map(|suffix| format!("{GRPC_WEB_PREFIX}{suffix}"))
            .unwrap_or(web_content_type);
        if let Ok(v) = HeaderValue::from_str(&response_content_type) {
            parts.headers.insert(CONTENT_TYPE, v);
        }

        debug!(req = %ctx.request_id, "grpc-web response translated");

        Response::from_parts(parts, GrpcWebBody::new(body).boxed())
    }
}

/// The backend could not be reached: a trailers-only gRPC response with
/// status 14 (unavailable), which both gRPC and gRPC-Web clients decode.
fn grpc_unavailable(web_content_type: Option<&str>) -> Response<ProxyBody> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            web_content_type.unwrap_or("application/grpc"),
        )
        .header("grpc-status", "14")
        .header("grpc-message", "backend unavailable")
        .body(empty_body())
        .unwrap()
}

/// Response body adapter turning HTTP/2 trailers into the gRPC-Web trailer
/// frame at the end of the stream.
struct GrpcWebBody {
    inner: Incoming,
    finished: bool,
}

impl GrpcWebBody {
    fn new(inner: Incoming) -> Self {
        Self {
            inner,
            finished: false,
        }
    }
}

impl Body for GrpcWebBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut self.inner).poll_frame(cx)) {
                None => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => return Poll::Ready(Some(Ok(Frame::data(data)))),
                    Err(frame) => match frame.into_trailers() {
                        Ok(trailers) => {
                            self.finished = true;
                            return Poll::Ready(Some(Ok(Frame::data(encode_trailer_frame(
                                &trailers,
                            )))));
                        }
                        Err(_) => continue, // unknown frame kind
                    },
                },
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }
}

/// Encode trailers as the gRPC-Web trailer frame: flag byte `0x80`, 32-bit
/// big-endian length, then `name: value\r\n` pairs.
fn encode_trailer_frame(trailers: &HeaderMap) -> Bytes {
    let mut payload = Vec::new();
    for (name, value) in trailers {
        payload.extend_from_slice(name.as_str().as_bytes());
        payload.extend_from_slice(b": ");
        payload.extend_from_slice(value.as_bytes());
        payload.extend_from_slice(b"\r\n");
    }

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(0x80);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    Bytes::from(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderName;

    #[test]
    fn trailer_frame_encoding() {
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static("grpc-status"),
            HeaderValue::from_static("0"),
        );

        let frame = encode_trailer_frame(&trailers);
        assert_eq!(frame[0], 0x80);

        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - 5);
        assert_eq!(&frame[5..], b"grpc-status: 0\r\n");
    }

    #[test]
    fn trailer_frame_holds_every_trailer() {
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static("grpc-status"),
            HeaderValue::from_static("3"),
        );
        trailers.insert(
            HeaderName::from_static("grpc-message"),
            HeaderValue::from_static("invalid argument"),
        );

        let frame = encode_trailer_frame(&trailers);
        let payload = std::str::from_utf8(&frame[5..]).unwrap();
        assert!(payload.contains("grpc-status: 3\r\n"));
        assert!(payload.contains("grpc-message: invalid argument\r\n"));
    }

    #[test]
    fn content_type_translation() {
        for (web, grpc) in [
            ("application/grpc-web", "application/grpc"),
            ("application/grpc-web+proto", "application/grpc+proto"),
        ] {
            let translated = format!("application/grpc{}", &web[GRPC_WEB_PREFIX.len()..]);
            assert_eq!(translated, grpc);
        }
    }

    #[test]
    fn unavailable_response_is_trailers_only() {
        let response = grpc_unavailable(None);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("grpc-status").unwrap(), "14");
    }
}
