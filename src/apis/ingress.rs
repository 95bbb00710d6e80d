//! Ingress event handler: annotation parsing, rule and TLS collection, and
//! the best-effort load-balancer status patch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

use crate::config::BackendOptions;
use crate::core::Core;

use super::state::{IngressRule, IngressTls, PortRef};
use super::{object_ref, EventHandler};

const STATUS_PATCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IngressHandler {
    core: Arc<Core>,
    client: Client,
    lb_hosts: Vec<String>,
}

impl IngressHandler {
    pub fn new(core: Arc<Core>, client: Client, lb_hosts: Vec<String>) -> Self {
        Self {
            core,
            client,
            lb_hosts,
        }
    }

    /// Check the published load-balancer status and patch it when it does
    /// not match the configured hosts. Best effort: failures are logged and
    /// the next update retries.
    async fn update_status(&self, ing: &Ingress) {
        let desired: Vec<IngressLoadBalancerIngress> = self
            .lb_hosts
            .iter()
            .map(|host| {
                if host.parse::<std::net::IpAddr>().is_ok() {
                    IngressLoadBalancerIngress {
                        ip: Some(host.clone()),
                        ..Default::default()
                    }
                } else {
                    IngressLoadBalancerIngress {
                        hostname: Some(host.clone()),
                        ..Default::default()
                    }
                }
            })
            .collect();

        let current = ing
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.clone())
            .unwrap_or_default();

        if current == desired {
            return;
        }

        let namespace = ing.metadata.namespace.clone().unwrap_or_default();
        let name = ing.metadata.name.clone().unwrap_or_default();
        info!(ingress = %format!("{namespace}/{name}"), "updating ingress status");

        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": { "loadBalancer": { "ingress": desired } }
        });

        let patched = tokio::time::timeout(
            STATUS_PATCH_TIMEOUT,
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await;

        match patched {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(ingress = %format!("{namespace}/{name}"), error = %e, "failed to update ingress status")
            }
            Err(_) => {
                warn!(ingress = %format!("{namespace}/{name}"), "ingress status update timed out")
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler<Ingress> for IngressHandler {
    async fn apply(&self, ing: Ingress) {
        let ingress_ref = object_ref(&ing);
        let namespace = ing.metadata.namespace.clone().unwrap_or_default();

        let options = parse_options(&ingress_ref, ing.metadata.annotations.as_ref());

        let mut rules = Vec::new();
        let mut tls_entries = Vec::new();

        if let Some(spec) = &ing.spec {
            for rule in spec.rules.iter().flatten() {
                let host = rule.host.clone().unwrap_or_default();
                let Some(http) = &rule.http else { continue };

                for path in &http.paths {
                    let Some(service) = &path.backend.service else {
                        continue; // resource backends are not supported
                    };

                    let port = match &service.port {
                        Some(p) => match p.number {
                            Some(number) => PortRef::Number(number),
                            None => PortRef::Name(p.name.clone().unwrap_or_default()),
                        },
                        None => PortRef::Name(String::new()),
                    };

                    rules.push(IngressRule {
                        host: host.clone(),
                        path: path.path.clone().unwrap_or_default(),
                        service: format!("{namespace}/{}", service.name),
                        port,
                        options: options.clone(),
                    });
                }
            }

            for tls in spec.tls.iter().flatten() {
                let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty())
                else {
                    continue;
                };
                let secret = format!("{namespace}/{secret_name}");

                for host in tls.hosts.iter().flatten() {
                    tls_entries.push(IngressTls {
                        host: host.clone(),
                        secret: secret.clone(),
                    });
                }
            }
        }

        self.core.update(|state| {
            state.ingress_rules.insert(ingress_ref.clone(), rules);
            state.ingress_tls.insert(ingress_ref.clone(), tls_entries);
        });

        self.update_status(&ing).await;
    }

    async fn delete(&self, ing: Ingress) {
        let ingress_ref = object_ref(&ing);

        self.core.update(|state| {
            state.ingress_rules.remove(&ingress_ref);
            state.ingress_tls.remove(&ingress_ref);
        });
    }
}

/// Build the backend options from an Ingress' annotations.
///
/// Keys are `prefix/name`. The `kubernetes.io` prefix is reserved: known
/// names apply, unknown ones are ignored without a warning. The two ingress
/// prefixes are expected to be known, so unknown names warn. Any other
/// prefix is ignored entirely.
fn parse_options(
    ingress_ref: &str,
    annotations: Option<&BTreeMap<String, String>>,
) -> BackendOptions {
    let mut options = BackendOptions::default();

    for (key, value) in annotations.into_iter().flatten() {
        let Some((prefix, name)) = key.split_once('/') else {
            continue;
        };

        let should_be_known = match prefix {
            "kubernetes.io" => false,
            "ingress.kubernetes.io" | "nginx.ingress.kubernetes.io" => true,
            _ => continue,
        };

        match options.set(name, value) {
            Err(e) => {
                warn!(ingress = ingress_ref, annotation = %key, error = %e, "error parsing annotation")
            }
            Ok(false) if should_be_known => {
                warn!(ingress = ingress_ref, annotation = %key, "unknown annotation")
            }
            Ok(_) => {}
        }
    }

    options
}
