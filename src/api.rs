//! Introspection endpoint: the effective routing table as JSON under
//! `/config`, and a human-readable status page under `/`.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::config::Snapshot;
use crate::core::Core;
use crate::proxy::tls::Certificate;

pub async fn serve(listener: TcpListener, core: Arc<Core>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "api: accept failed");
                continue;
            }
        };

        let core = core.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let core = core.clone();
                async move { Ok::<_, Infallible>(handle(&req, &core)) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %e, "api: connection error");
            }
        });
    }
}

fn handle<B>(req: &Request<B>, core: &Core) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return not_found();
    }

    match req.uri().path() {
        "/" => html_response(status_page(&core.snapshot(), core.reconcile_count())),
        "/config" => json_response(config_json(&core.snapshot())),
        _ => not_found(),
    }
}

fn not_found() -> Response<Full<Bytes>> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(b"404 page not found\n")))
        .unwrap()
}

fn json_response(value: Value) -> Response<Full<Bytes>> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn html_response(body: String) -> Response<Full<Bytes>> {
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn config_json(snapshot: &Snapshot) -> Value {
    let mut backends = serde_json::Map::new();
    for (host, list) in sorted(&snapshot.backends) {
        let entries: Vec<Value> = list
            .iter()
            .map(|b| {
                json!({
                    "ingress": b.ingress_ref,
                    "prefix": b.prefix,
                    "targets": b.targets,
                    "options": b.options.get(),
                })
            })
            .collect();
        backends.insert(host.clone(), Value::Array(entries));
    }

    let mut certificates = serde_json::Map::new();
    for (host, cert) in sorted(&snapshot.certs) {
        certificates.insert(host.clone(), cert_info(Some(cert)));
    }

    json!({
        "backends": backends,
        "default-certificate": cert_info(snapshot.default_cert.as_deref()),
        "certificates": certificates,
    })
}

fn cert_info(cert: Option<&Certificate>) -> Value {
    match cert {
        None => json!({ "Defined": false }),
        Some(cert) => json!({
            "Defined": true,
            "NotAfter": cert.not_after,
            "NotBefore": cert.not_before,
            "Issuer": cert.issuer,
            "DNSNames": cert.dns_names,
        }),
    }
}

fn sorted<V>(map: &std::collections::HashMap<String, V>) -> Vec<(&String, &V)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(host, _)| host.as_str());
    entries
}

fn cert_color(cert: &Certificate) -> &'static str {
    const WEEK: i64 = 7 * 24 * 3600;

    let expires_in = cert.expires_in_secs();
    if expires_in < 0 {
        "danger"
    } else if expires_in < WEEK {
        "warning"
    } else {
        "success"
    }
}

fn status_page(snapshot: &Snapshot, reconciles: u64) -> String {
    let mut page = String::with_capacity(4096);

    page.push_str(concat!(
        "<!doctype html>\n<html><head><title>kingress status</title>\n",
        "<link rel=\"stylesheet\" href=\"https://cdn.jsdelivr.net/npm/bootstrap@4.5.3/dist/css/bootstrap.min.css\" crossorigin=\"anonymous\">\n",
        "</head><body>\n"
    ));

    let _ = write!(page, "<p>reconciles: {reconciles}</p>\n");

    if !snapshot.warnings.is_empty() {
        page.push_str("<h2>Warnings</h2>\n<ul>\n");
        for warning in &snapshot.warnings {
            let _ = write!(page, "<li>{}</li>\n", escape(warning));
        }
        page.push_str("</ul>\n");
    }

    page.push_str(concat!(
        "<h2>Certificates</h2>\n<table class=\"table\">\n<thead><tr>",
        "<th>Host</th><th>Not after</th><th>Not before</th><th>Issuer</th><th>DNS names</th>",
        "</tr></thead>\n<tbody>\n"
    ));

    if let Some(cert) = &snapshot.default_cert {
        cert_row(&mut page, "<strong>default</strong>", cert);
    }
    for (host, cert) in sorted(&snapshot.certs) {
        cert_row(&mut page, &escape(host), cert);
    }
    page.push_str("</tbody></table>\n");

    page.push_str(concat!(
        "<h2>Backends</h2>\n<table class=\"table\">\n<thead><tr>",
        "<th>Host</th><th>Path prefix</th><th>Ingress</th><th>Options</th><th>Targets</th>",
        "</tr></thead>\n<tbody>\n"
    ));

    for (host, list) in sorted(&snapshot.backends) {
        for backend in list.iter() {
            let mut options = String::new();
            for (name, value) in backend.options.get() {
                match value {
                    Value::Bool(true) => {
                        let _ = write!(options, "<span class=\"badge badge-info\">{name}</span> ");
                    }
                    Value::Array(items) if !items.is_empty() => {
                        let _ = write!(
                            options,
                            "<span class=\"badge badge-info\">{name}:{}</span> ",
                            escape(&Value::Array(items).to_string())
                        );
                    }
                    _ => {}
                }
            }

            let mut targets = String::new();
            for target in &backend.targets {
                let _ = write!(
                    targets,
                    "<span class=\"badge badge-info\">{}</span> ",
                    escape(target)
                );
            }

            let _ = write!(
                page,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{options}</td><td>{targets}</td></tr>\n",
                escape(host),
                escape(&backend.prefix),
                escape(&backend.ingress_ref),
            );
        }
    }
    page.push_str("</tbody></table>\n</body></html>\n");

    page
}

fn cert_row(page: &mut String, host_cell: &str, cert: &Certificate) {
    let mut issuer = String::new();
    for part in &cert.issuer {
        let _ = write!(
            issuer,
            "<span class=\"badge badge-info\">{}</span> ",
            escape(part)
        );
    }
    let mut names = String::new();
    for name in &cert.dns_names {
        let _ = write!(
            names,
            "<span class=\"badge badge-info\">{}</span> ",
            escape(name)
        );
    }

    let _ = write!(
        page,
        "<tr><td>{host_cell}</td><td class=\"bg-{}\">{}</td><td>{}</td><td>{issuer}</td><td>{names}</td></tr>\n",
        cert_color(cert),
        escape(&cert.not_after),
        escape(&cert.not_before),
    );
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
