//! Command-line options.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::Error;

#[derive(Debug, Parser)]
#[command(name = "kingress", version, about = "Kubernetes ingress reverse proxy")]
pub struct Options {
    /// HTTP bind specification (empty to disable)
    #[arg(long, default_value = ":80")]
    pub http: String,

    /// HTTPS bind specification (empty to disable)
    #[arg(long, default_value = ":443")]
    pub https: String,

    /// HTTP to HTTPS redirector bind specification (empty to disable)
    #[arg(long, default_value = "")]
    pub ssl_redirect: String,

    /// Introspection API bind specification (empty to disable)
    #[arg(long, default_value = "127.0.0.1:2287")]
    pub api: String,

    /// Namespace to watch (defaults to all)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Ingress label selector
    #[arg(long, default_value = "")]
    pub selector: String,

    /// Default TLS secret (format: namespace/name)
    #[arg(long, default_value = "default/kingress-default")]
    pub tls_secret: String,

    /// Delay before applying changes in the Kubernetes configuration
    #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
    pub change_apply_delay: Duration,

    /// Period between full reconciles with Kubernetes
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,

    /// Custom backend definitions (format: "<host>[/<path>]:<target IP>:<target port>,...")
    #[arg(long, default_value = "")]
    pub custom: String,

    /// Address of the Kubernetes API server (overrides the inferred config)
    #[arg(long, default_value = "")]
    pub master: String,

    /// Forward flush interval, accepted for compatibility: responses stream
    /// with a flush per write
    #[arg(long, default_value = "10ms", value_parser = humantime::parse_duration)]
    pub flush_interval: Duration,

    /// Hosts published in the Ingress load-balancer statuses (comma separated)
    #[arg(long, default_value = "")]
    pub lb_hosts: String,
}

impl Options {
    pub fn lb_hosts(&self) -> Vec<String> {
        split_list(&self.lb_hosts)
    }

    pub fn selector(&self) -> Option<String> {
        if self.selector.is_empty() {
            None
        } else {
            Some(self.selector.clone())
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a bind specification; a bare `:port` binds every interface.
pub fn parse_bind(bind: &str) -> Result<SocketAddr, Error> {
    let spec = if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    };

    spec.parse().map_err(|_| Error::BadBind(bind.to_string()))
}
