//! Request dispatch: resolve the snapshot to a backend, run the policy
//! gates, pick the forwarding variant, and log the request around it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Version};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::Core;

use super::access_log::{AccessLog, Record};
use super::forwarder::{ForwardContext, Forwarder};
use super::gates::{self, GateOutcome};
use super::{empty_body, status_response, ProxyBody};

pub struct Dispatcher {
    core: Arc<Core>,
    forwarder: Arc<Forwarder>,
    log: AccessLog,
    /// Protocol of the accepting listener: `http` or `https`.
    proto: &'static str,
}

impl Dispatcher {
    pub fn new(
        core: Arc<Core>,
        forwarder: Arc<Forwarder>,
        log: AccessLog,
        proto: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            forwarder,
            log,
            proto,
        })
    }

    pub async fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote: SocketAddr,
    ) -> Response<ProxyBody> {
        // not a forward proxy
        if req.method() == Method::CONNECT {
            warn!(proto = self.proto, remote = %remote, "CONNECT attempted");
            #[allow(clippy::unwrap_used)]
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(empty_body())
                .unwrap();
        }

        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let raw_host = raw_host(&req);
        let host = host_without_port(&raw_host).to_string();
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let snapshot = self.core.snapshot();

        let Some(backend) = snapshot.backend_for(&host, &request_uri) else {
            debug!(host = %host, uri = %request_uri, "no backend");
            return status_response(StatusCode::NOT_FOUND, "Not Found\n");
        };

        let Some(target) = backend.target().map(str::to_string) else {
            debug!(host = %host, uri = %request_uri, ingress = %backend.ingress_ref, "backend has no endpoints");
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
        };

        let gate = gates::apply(backend, self.proto, &remote, &raw_host, &req);
        let reject = match &gate {
            GateOutcome::Pass => None,
            GateOutcome::Reject { reason, .. } => Some(*reason),
        };

        self.log
            .send(Record::Start {
                id: request_id.clone(),
                remote,
                proto: self.proto,
                host: raw_host.clone(),
                method: req.method().to_string(),
                uri: request_uri.clone(),
                ingress: backend.ingress_ref.clone(),
                target: target.clone(),
                reject,
            })
            .await;

        if let GateOutcome::Reject { response, .. } = gate {
            return response;
        }

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let is_grpc_web = backend.options.grpc_web
            && req.method() == Method::POST
            && content_type.starts_with("application/grpc-web");
        let is_grpc = backend.options.grpc
            && req.version() == Version::HTTP_2
            && content_type.starts_with("application/grpc");

        let ctx = ForwardContext {
            request_id: request_id.clone(),
            target,
            scheme: if backend.options.secure_backends {
                "https"
            } else {
                "http"
            },
            host: raw_host,
            remote,
            proto: self.proto,
        };

        let response = if is_grpc_web {
            self.forwarder.forward_grpc_web(req, ctx).await
        } else if is_grpc {
            self.forwarder.forward_grpc(req, ctx).await
        } else {
            self.forwarder.forward(req, ctx).await
        };

        self.log
            .send(Record::End {
                id: request_id,
                elapsed: start.elapsed(),
            })
            .await;

        response
    }
}

/// The Host of a request: the Host header for HTTP/1, the URI authority for
/// HTTP/2. Port included, as received.
fn raw_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}
