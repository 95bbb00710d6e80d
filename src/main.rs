use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use kingress::proxy::{self, AccessLog, Dispatcher, Forwarder};
use kingress::{api, apis, cli, core};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // install ring as the process-wide TLS provider before any rustls config
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = cli::Options::parse();
    debug!(options = ?opts, "parsed command line");

    info!("starting");

    let custom = core::parse_custom_backends(&opts.custom)?;
    let core = core::Core::new(opts.change_apply_delay, custom);
    let log = AccessLog::spawn();
    let forwarder = Arc::new(Forwarder::new());

    // cluster client
    let mut kube_config = kube::Config::infer()
        .await
        .context("cannot build the cluster client configuration")?;
    if !opts.master.is_empty() {
        kube_config.cluster_url = opts
            .master
            .parse()
            .context("bad --master specification")?;
    }
    info!(cluster = %kube_config.cluster_url, "kubernetes: connecting");
    let client = kube::Client::try_from(kube_config).context("cannot build the cluster client")?;

    tokio::spawn(apis::run(
        client,
        core.clone(),
        apis::WatchOptions {
            namespace: opts.namespace.clone(),
            selector: opts.selector(),
            default_secret: opts.tls_secret.clone(),
            lb_hosts: opts.lb_hosts(),
            resync_period: opts.resync_period,
        },
    ));

    if !opts.http.is_empty() {
        let addr = cli::parse_bind(&opts.http)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("http: cannot listen on {addr}"))?;
        info!(%addr, "http: listening");

        let dispatcher = Dispatcher::new(core.clone(), forwarder.clone(), log.clone(), "http");
        tokio::spawn(proxy::serve_http(listener, dispatcher));
    }

    if !opts.https.is_empty() {
        let addr = cli::parse_bind(&opts.https)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("https: cannot listen on {addr}"))?;
        info!(%addr, "https: listening");

        let tls_config = proxy::tls::server_config(core.subscribe());
        let dispatcher = Dispatcher::new(core.clone(), forwarder.clone(), log.clone(), "https");
        tokio::spawn(proxy::serve_https(listener, tls_config, dispatcher));
    }

    if !opts.ssl_redirect.is_empty() {
        let addr = cli::parse_bind(&opts.ssl_redirect)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("ssl-redirect: cannot listen on {addr}"))?;
        info!(%addr, "ssl-redirect: listening");

        tokio::spawn(proxy::serve_ssl_redirect(listener));
    }

    if !opts.api.is_empty() {
        let addr = cli::parse_bind(&opts.api)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("api: cannot listen on {addr}"))?;
        info!(%addr, "api: listening");

        tokio::spawn(api::serve(listener, core.clone()));
    }

    signal::ctrl_c().await?;
    info!("got interrupt, exiting");

    Ok(())
}
