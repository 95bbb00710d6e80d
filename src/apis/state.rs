//! Per-kind indexes of observed cluster objects.
//!
//! Event handlers mutate these maps under the config lock; the reconciler
//! reads them to build a fresh snapshot. They are never exposed outside the
//! configuration engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BackendOptions;
use crate::proxy::tls::Certificate;

/// A service port reference, numeric or named (the `IntOrString` of the
/// Ingress and Service specs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// One routing rule collected from an Ingress.
#[derive(Debug, Clone)]
pub struct IngressRule {
    pub host: String,
    pub path: String,
    /// `namespace/name` of the target service.
    pub service: String,
    pub port: PortRef,
    pub options: BackendOptions,
}

/// One `host -> secret` association collected from an Ingress TLS entry.
#[derive(Debug, Clone)]
pub struct IngressTls {
    pub host: String,
    /// `namespace/name` of the TLS secret.
    pub secret: String,
}

/// One port mapping collected from a Service.
#[derive(Debug, Clone)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub target_port: PortRef,
}

/// One resolved address collected from an Endpoints subset.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub port: i32,
    /// `ip:port`.
    pub target: String,
}

/// All observed objects, keyed by `namespace/name`. `BTreeMap` keeps the
/// reconcile iteration order deterministic.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub ingress_rules: BTreeMap<String, Vec<IngressRule>>,
    pub ingress_tls: BTreeMap<String, Vec<IngressTls>>,
    pub services: BTreeMap<String, Vec<ServicePort>>,
    pub endpoints: BTreeMap<String, Vec<EndpointSpec>>,
    pub secrets: BTreeMap<String, Arc<Certificate>>,
    pub default_cert: Option<Arc<Certificate>>,
}

impl ClusterState {
    /// Resolve an Ingress port reference to the service's target port.
    pub fn find_target_port(&self, service: &str, port: &PortRef) -> Option<PortRef> {
        let ports = self.services.get(service)?;

        match port {
            PortRef::Number(n) => ports
                .iter()
                .find(|p| p.port == *n)
                .map(|p| p.target_port.clone()),
            PortRef::Name(name) => ports
                .iter()
                .find(|p| p.name == *name)
                .map(|p| p.target_port.clone()),
        }
    }

    /// Endpoint targets of a service matching the resolved target port.
    pub fn find_endpoints(&self, service: &str, port: &PortRef) -> Vec<String> {
        let Some(specs) = self.endpoints.get(service) else {
            return Vec::new();
        };

        specs
            .iter()
            .filter(|ep| match port {
                PortRef::Number(n) => ep.port == *n,
                PortRef::Name(name) => ep.name == *name,
            })
            .map(|ep| ep.target.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_service() -> ClusterState {
        let mut state = ClusterState::default();
        state.services.insert(
            "default/s1".to_string(),
            vec![ServicePort {
                name: "web".to_string(),
                port: 80,
                target_port: PortRef::Number(8080),
            }],
        );
        state.endpoints.insert(
            "default/s1".to_string(),
            vec![
                EndpointSpec {
                    name: "web".to_string(),
                    port: 8080,
                    target: "10.0.0.1:8080".to_string(),
                },
                EndpointSpec {
                    name: "metrics".to_string(),
                    port: 9090,
                    target: "10.0.0.1:9090".to_string(),
                },
            ],
        );
        state
    }

    #[test]
    fn target_port_resolves_by_number_and_name() {
        let state = state_with_service();

        assert_eq!(
            state.find_target_port("default/s1", &PortRef::Number(80)),
            Some(PortRef::Number(8080))
        );
        assert_eq!(
            state.find_target_port("default/s1", &PortRef::Name("web".to_string())),
            Some(PortRef::Number(8080))
        );
        assert_eq!(state.find_target_port("default/s1", &PortRef::Number(81)), None);
        assert_eq!(state.find_target_port("default/missing", &PortRef::Number(80)), None);
    }

    #[test]
    fn endpoints_filter_on_the_resolved_port() {
        let state = state_with_service();

        assert_eq!(
            state.find_endpoints("default/s1", &PortRef::Number(8080)),
            vec!["10.0.0.1:8080".to_string()]
        );
        assert_eq!(
            state.find_endpoints("default/s1", &PortRef::Name("metrics".to_string())),
            vec!["10.0.0.1:9090".to_string()]
        );
        assert!(state.find_endpoints("default/s1", &PortRef::Number(1)).is_empty());
    }
}
