//! Listener accept loops: plain HTTP, TLS-terminated HTTPS, and the
//! standalone HTTP-to-HTTPS redirector.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hyper::body::Incoming;
use hyper::header::LOCATION;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::handler::Dispatcher;
use super::{empty_body, status_response, ProxyBody};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop of the plain HTTP listener.
pub async fn serve_http(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "http: accept failed");
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(serve_connection(stream, remote, dispatcher));
    }
}

/// Accept loop of the HTTPS listener: TLS handshake (with the snapshot-backed
/// certificate selection) then the same dispatch path. Handshake errors are
/// per-connection and never fatal.
pub async fn serve_https(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
) {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "https: accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => serve_connection(tls_stream, remote, dispatcher).await,
                Ok(Err(e)) => debug!(remote = %remote, error = %e, "https: handshake failed"),
                Err(_) => debug!(remote = %remote, "https: handshake timed out"),
            }
        });
    }
}

async fn serve_connection<I>(stream: I, remote: SocketAddr, dispatcher: Arc<Dispatcher>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatch_contained(dispatcher, req, remote).await) }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(remote = %remote, error = %e, "connection closed with error");
    }
}

/// Run the dispatcher with panic containment: a panicking handler logs and
/// answers 500 instead of poisoning the connection task silently.
async fn dispatch_contained(
    dispatcher: Arc<Dispatcher>,
    req: Request<Incoming>,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    match std::panic::AssertUnwindSafe(dispatcher.dispatch(req, remote))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(remote = %remote, panic = %message, "panic serving request");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

/// The standalone redirector: every request answers 301 with the scheme
/// rewritten to https, same host and URI.
pub async fn serve_ssl_redirect(listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "ssl-redirect: accept failed");
                continue;
            }
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(|req: Request<Incoming>| async move {
                Ok::<_, Infallible>(redirect_to_https(&req))
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(remote = %remote, error = %e, "ssl-redirect: connection error");
            }
        });
    }
}

fn redirect_to_https<B>(req: &Request<B>) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, format!("https://{host}{uri}"))
        .body(empty_body())
    {
        Ok(response) => response,
        Err(_) => status_response(StatusCode::BAD_REQUEST, "Bad Request\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::state::{EndpointSpec, IngressRule, PortRef, ServicePort};
    use crate::config::BackendOptions;
    use crate::core::Core;
    use crate::proxy::{AccessLog, Forwarder};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::Method;

    async fn spawn_backend(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| async move {
                        let xff = req
                            .headers()
                            .get("x-forwarded-for")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("x-echo-forwarded-for", xff)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    /// Core with one host ("a") routing /api to the given target and / to a
    /// second, empty-targets backend under /none.
    async fn core_with_backend(target: SocketAddr, options: BackendOptions) -> Arc<Core> {
        let core = Core::new(Duration::from_millis(10), Vec::new());

        core.update(move |state| {
            state.ingress_rules.insert(
                "default/i1".to_string(),
                vec![
                    IngressRule {
                        host: "a".to_string(),
                        path: "/api".to_string(),
                        service: "default/s1".to_string(),
                        port: PortRef::Number(80),
                        options,
                    },
                    IngressRule {
                        host: "a".to_string(),
                        path: "/none".to_string(),
                        service: "default/s2".to_string(),
                        port: PortRef::Number(80),
                        options: BackendOptions::default(),
                    },
                ],
            );
            for svc in ["default/s1", "default/s2"] {
                state.services.insert(
                    svc.to_string(),
                    vec![ServicePort {
                        name: String::new(),
                        port: 80,
                        target_port: PortRef::Number(target.port() as i32),
                    }],
                );
            }
            state.endpoints.insert(
                "default/s1".to_string(),
                vec![EndpointSpec {
                    name: String::new(),
                    port: target.port() as i32,
                    target: target.to_string(),
                }],
            );
            // s2 has no endpoints: its backend stays routable with no targets
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        core
    }

    async fn spawn_proxy(core: Arc<Core>, proto: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatcher = Dispatcher::new(
            core,
            Arc::new(Forwarder::new()),
            AccessLog::spawn(),
            proto,
        );
        tokio::spawn(serve_http(listener, dispatcher));
        tokio::time::sleep(Duration::from_millis(20)).await;
        addr
    }

    fn client() -> hyper_util::client::legacy::Client<
        hyper_util::client::legacy::connect::HttpConnector,
        Full<Bytes>,
    > {
        hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build_http::<Full<Bytes>>()
    }

    fn get(proxy: SocketAddr, host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://{proxy}{path}"))
            .header("Host", host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn install_crypto_provider() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    #[tokio::test]
    async fn routes_by_host_and_prefix() {
        install_crypto_provider();
        let backend = spawn_backend("hello from s1").await;
        let core = core_with_backend(backend, BackendOptions::default()).await;
        let proxy = spawn_proxy(core, "http").await;

        let response = client().request(get(proxy, "a", "/api/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("hello from s1"));
    }

    #[tokio::test]
    async fn unknown_host_is_404_and_empty_targets_503() {
        install_crypto_provider();
        let backend = spawn_backend("hello").await;
        let core = core_with_backend(backend, BackendOptions::default()).await;
        let proxy = spawn_proxy(core, "http").await;

        let response = client().request(get(proxy, "unknown", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client().request(get(proxy, "a", "/other")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client().request(get(proxy, "a", "/none")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn appends_exactly_one_forwarded_for() {
        install_crypto_provider();
        let backend = spawn_backend("ok").await;
        let core = core_with_backend(backend, BackendOptions::default()).await;
        let proxy = spawn_proxy(core, "http").await;

        let mut req = get(proxy, "a", "/api/x");
        req.headers_mut()
            .insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        let response = client().request(req).await.unwrap();

        let echoed = response
            .headers()
            .get("x-echo-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(echoed.starts_with("127.0.0.1:"), "got {echoed:?}");
        assert!(!echoed.contains("1.2.3.4"));
    }

    #[tokio::test]
    async fn ssl_redirect_applies_on_the_http_listener_only() {
        install_crypto_provider();
        let backend = spawn_backend("ok").await;

        let mut options = BackendOptions::default();
        options.set("ssl-redirect", "true").unwrap();

        let core = core_with_backend(backend, options).await;
        let http_proxy = spawn_proxy(core.clone(), "http").await;
        let https_proxy = spawn_proxy(core, "https").await;

        let response = client()
            .request(get(http_proxy, "a", "/api/x?y=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://a/api/x?y=1"
        );

        // "https" listener proto: forwarded normally
        let response = client()
            .request(get(https_proxy, "a", "/api/x?y=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn whitelist_rejects_unlisted_sources() {
        install_crypto_provider();
        let backend = spawn_backend("ok").await;

        let mut options = BackendOptions::default();
        // 127.0.0.1 is outside this range
        options.set("whitelist-source-range", "10.0.0.0/8").unwrap();

        let core = core_with_backend(backend, options).await;
        let proxy = spawn_proxy(core, "http").await;

        let response = client().request(get(proxy, "a", "/api/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cors_preflight_is_answered_without_forwarding() {
        install_crypto_provider();
        let backend = spawn_backend("should not be reached").await;

        let mut options = BackendOptions::default();
        options
            .set("cors-allowed-origins", "https://app.example.com,*.trusted.dev")
            .unwrap();

        let core = core_with_backend(backend, options).await;
        let proxy = spawn_proxy(core, "http").await;

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri(format!("http://{proxy}/api/x"))
            .header("Host", "a")
            .header("Origin", "https://api.trusted.dev")
            .header("Access-Control-Request-Method", "GET")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client().request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://api.trusted.dev"
        );

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri(format!("http://{proxy}/api/x"))
            .header("Host", "a")
            .header("Origin", "https://evil.example.net")
            .header("Access-Control-Request-Method", "GET")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client().request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("origin not allowed\n"));
    }

    #[tokio::test]
    async fn connect_is_answered_405() {
        install_crypto_provider();
        let backend = spawn_backend("ok").await;
        let core = core_with_backend(backend, BackendOptions::default()).await;
        let proxy = spawn_proxy(core, "http").await;

        // CONNECT via a raw socket: hyper clients refuse to send it plainly
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(b"CONNECT a:443 HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]);
        assert!(head.starts_with("HTTP/1.1 405"), "got {head:?}");
    }

    #[tokio::test]
    async fn redirector_rewrites_the_scheme() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_ssl_redirect(listener));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{addr}/x?y=1"))
            .header("Host", "a.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client().request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://a.example.com/x?y=1"
        );
    }
}
