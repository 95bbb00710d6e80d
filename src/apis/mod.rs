//! Cluster-facing side: watchers for the four object kinds, the observed
//! indexes, and the reconciler that turns them into routing snapshots.

pub mod reconcile;
pub mod state;

mod endpoints;
mod ingress;
mod secret;
mod service;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::core::Core;

pub use ingress::IngressHandler;

/// What the watchers observe and how.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Restrict all watches to one namespace (`None` = all).
    pub namespace: Option<String>,
    /// Label selector applied to Ingresses only.
    pub selector: Option<String>,
    /// `namespace/name` of the default TLS secret.
    pub default_secret: String,
    /// Hosts published in Ingress load-balancer statuses.
    pub lb_hosts: Vec<String>,
    /// Interval of the forced full reconcile.
    pub resync_period: Duration,
}

/// `namespace/name` of an object.
pub(crate) fn object_ref(obj: &impl ResourceExt) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Translated add/update/delete callbacks for one object kind. The watcher
/// delivers at most one event per kind at a time.
#[async_trait::async_trait]
pub(crate) trait EventHandler<K>: Send + Sync {
    async fn apply(&self, obj: K);
    async fn delete(&self, obj: K);
}

/// Run all four watchers plus the resync tick until one of them ends
/// (they do not, short of the process shutting down).
pub async fn run(client: Client, core: Arc<Core>, opts: WatchOptions) {
    let ns = opts.namespace.clone();

    let mut ingress_cfg = watcher::Config::default();
    if let Some(selector) = opts.selector.as_deref().filter(|s| !s.is_empty()) {
        ingress_cfg = ingress_cfg.labels(selector);
    }
    // only TLS secrets are of interest; let the server filter them
    let secret_cfg = watcher::Config::default().fields("type=kubernetes.io/tls");

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(watch_resource(
        api_for::<Ingress>(&client, ns.as_deref()),
        ingress_cfg,
        "ingresses",
        IngressHandler::new(core.clone(), client.clone(), opts.lb_hosts.clone()),
    ));
    tasks.spawn(watch_resource(
        api_for::<Service>(&client, ns.as_deref()),
        watcher::Config::default(),
        "services",
        service::ServiceHandler::new(core.clone()),
    ));
    tasks.spawn(watch_resource(
        api_for::<Endpoints>(&client, ns.as_deref()),
        watcher::Config::default(),
        "endpoints",
        endpoints::EndpointsHandler::new(core.clone()),
    ));
    tasks.spawn(watch_resource(
        api_for::<Secret>(&client, ns.as_deref()),
        secret_cfg,
        "secrets",
        secret::SecretHandler::new(core.clone(), opts.default_secret.clone()),
    ));
    tasks.spawn(resync_tick(core, opts.resync_period));

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "watcher task failed");
        }
    }
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn watch_resource<K>(
    api: Api<K>,
    config: watcher::Config,
    resource: &'static str,
    handler: impl EventHandler<K>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, config);
    futures::pin_mut!(stream);

    info!(resource, "kubernetes: watching");

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => handler.apply(obj).await,
            Ok(Event::Delete(obj)) => handler.delete(obj).await,
            Ok(Event::Init) => debug!(resource, "watch (re)started"),
            Ok(Event::InitDone) => info!(resource, "initial sync complete"),
            Err(e) => warn!(resource, error = %e, "watch error"),
        }
    }

    warn!(resource, "kubernetes: stopped watching");
}

/// Force a full reconcile every resync period, so the published snapshot
/// never drifts from the indexes for long even without events.
async fn resync_tick(core: Arc<Core>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // the first tick fires immediately

    loop {
        interval.tick().await;
        debug!("resync: forcing reconcile");
        core.notify_changed();
    }
}
