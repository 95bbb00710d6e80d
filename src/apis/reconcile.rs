//! Snapshot reconciliation: a pure function of the per-kind indexes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Backend, Snapshot};
use crate::core::CustomBackend;

use super::state::ClusterState;

/// Build a fresh routing snapshot from the observed objects.
///
/// Deterministic: ingresses are visited in key order, duplicate
/// `(host, prefix)` pairs keep the first definition, each host's backends
/// are sorted longest prefix first, warnings are sorted.
pub fn build_snapshot(state: &ClusterState, custom: &[CustomBackend]) -> Snapshot {
    let mut warnings = Vec::new();
    let mut backends: HashMap<String, Vec<Arc<Backend>>> = HashMap::new();

    for (ingress_ref, rules) in &state.ingress_rules {
        'rules: for rule in rules {
            let host_backends = backends.entry(rule.host.clone()).or_default();

            for existing in host_backends.iter() {
                if existing.prefix == rule.path {
                    warnings.push(format!(
                        "duplicate definition for host {}, path {:?}: ignoring ingress {} rule to {}:{}",
                        rule.host, rule.path, ingress_ref, rule.service, rule.port
                    ));
                    continue 'rules;
                }
            }

            // Unresolved service/port pairs are skipped silently; the
            // endpoints view makes the problem visible.
            let Some(target_port) = state.find_target_port(&rule.service, &rule.port) else {
                continue;
            };

            let mut backend = Backend::new(
                ingress_ref.clone(),
                rule.path.clone(),
                state.find_endpoints(&rule.service, &target_port),
            );
            backend.options = rule.options.clone();

            host_backends.push(Arc::new(backend));
        }
    }

    for list in backends.values_mut() {
        // stable sort: ties keep ingress iteration order
        list.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    let mut certs = HashMap::new();
    for (ingress_ref, tls_entries) in &state.ingress_tls {
        for tls in tls_entries {
            let Some(cert) = state.secrets.get(&tls.secret) else {
                warnings.push(format!(
                    "no TLS secret {} for host {} (ingress: {})",
                    tls.secret, tls.host, ingress_ref
                ));
                continue;
            };

            certs.insert(tls.host.clone(), cert.clone());
        }
    }

    for (idx, cb) in custom.iter().enumerate() {
        backends.insert(
            cb.host.clone(),
            vec![Arc::new(Backend::new(
                format!("custom[{idx}]"),
                cb.path.clone(),
                vec![cb.target.clone()],
            ))],
        );
    }

    warnings.sort();

    Snapshot {
        warnings,
        backends,
        certs,
        default_cert: state.default_cert.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::state::{EndpointSpec, IngressRule, IngressTls, PortRef, ServicePort};
    use crate::config::BackendOptions;

    fn rule(host: &str, path: &str, service: &str, port: i32) -> IngressRule {
        IngressRule {
            host: host.to_string(),
            path: path.to_string(),
            service: service.to_string(),
            port: PortRef::Number(port),
            options: BackendOptions::default(),
        }
    }

    fn service(state: &mut ClusterState, svc_ref: &str, port: i32, target_port: i32) {
        state.services.insert(
            svc_ref.to_string(),
            vec![ServicePort {
                name: String::new(),
                port,
                target_port: PortRef::Number(target_port),
            }],
        );
    }

    fn endpoints(state: &mut ClusterState, svc_ref: &str, port: i32, targets: &[&str]) {
        state.endpoints.insert(
            svc_ref.to_string(),
            targets
                .iter()
                .map(|t| EndpointSpec {
                    name: String::new(),
                    port,
                    target: t.to_string(),
                })
                .collect(),
        );
    }

    /// Two ingresses on one host: `/api` through s1 (80 -> 8080) and `/`
    /// through s2 (80 -> 80).
    fn two_service_state() -> ClusterState {
        let mut state = ClusterState::default();
        state
            .ingress_rules
            .insert("default/i1".to_string(), vec![rule("a", "/api", "default/s1", 80)]);
        state
            .ingress_rules
            .insert("default/i2".to_string(), vec![rule("a", "/", "default/s2", 80)]);
        service(&mut state, "default/s1", 80, 8080);
        service(&mut state, "default/s2", 80, 80);
        endpoints(&mut state, "default/s1", 8080, &["10.0.0.1:8080"]);
        endpoints(&mut state, "default/s2", 80, &["10.0.0.2:80"]);
        state
    }

    #[test]
    fn resolves_ports_through_the_service_index() {
        let snapshot = build_snapshot(&two_service_state(), &[]);

        let api = snapshot.backend_for("a", "/api/x").unwrap();
        assert_eq!(api.targets, vec!["10.0.0.1:8080".to_string()]);

        let root = snapshot.backend_for("a", "/foo").unwrap();
        assert_eq!(root.targets, vec!["10.0.0.2:80".to_string()]);
    }

    #[test]
    fn backends_are_sorted_longest_prefix_first() {
        let snapshot = build_snapshot(&two_service_state(), &[]);

        let list = &snapshot.backends["a"];
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].prefix, "/api");
        assert_eq!(list[1].prefix, "/");
    }

    #[test]
    fn empty_endpoints_keep_the_backend_routable() {
        let mut state = two_service_state();
        state.endpoints.remove("default/s1");

        let snapshot = build_snapshot(&state, &[]);
        let api = snapshot.backend_for("a", "/api/x").unwrap();
        assert!(api.targets.is_empty());
        assert_eq!(api.target(), None);
    }

    #[test]
    fn duplicate_host_path_keeps_the_first_and_warns() {
        let mut state = two_service_state();
        state
            .ingress_rules
            .insert("default/i3".to_string(), vec![rule("a", "/api", "default/s2", 80)]);

        let snapshot = build_snapshot(&state, &[]);
        let api = snapshot.backend_for("a", "/api/x").unwrap();
        assert_eq!(api.ingress_ref, "default/i1");
        assert!(snapshot.warnings.iter().any(|w| w.contains("duplicate definition")));
    }

    #[test]
    fn unresolved_service_port_is_skipped_silently() {
        let mut state = two_service_state();
        state.services.remove("default/s1");

        let snapshot = build_snapshot(&state, &[]);
        assert!(snapshot.backend_for("a", "/api/x").is_some()); // falls through to "/"
        assert_eq!(snapshot.backends["a"].len(), 1);
        assert!(snapshot.warnings.is_empty());
    }

    #[test]
    fn missing_tls_secret_adds_a_warning() {
        let mut state = two_service_state();
        state.ingress_tls.insert(
            "default/i1".to_string(),
            vec![IngressTls {
                host: "a".to_string(),
                secret: "default/absent".to_string(),
            }],
        );

        let snapshot = build_snapshot(&state, &[]);
        assert!(snapshot.certs.is_empty());
        assert!(snapshot
            .warnings
            .iter()
            .any(|w| w.contains("no TLS secret default/absent")));
    }

    #[test]
    fn custom_backends_replace_the_host_entry() {
        let state = two_service_state();
        let custom = vec![CustomBackend {
            host: "a".to_string(),
            path: "/only".to_string(),
            target: "192.168.0.1:8080".to_string(),
        }];

        let snapshot = build_snapshot(&state, &custom);
        let list = &snapshot.backends["a"];
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ingress_ref, "custom[0]");
        assert_eq!(list[0].prefix, "/only");
        assert_eq!(list[0].targets, vec!["192.168.0.1:8080".to_string()]);
    }

    #[test]
    fn warnings_are_sorted() {
        let mut state = two_service_state();
        state.ingress_tls.insert(
            "default/i2".to_string(),
            vec![
                IngressTls {
                    host: "b".to_string(),
                    secret: "default/zz".to_string(),
                },
                IngressTls {
                    host: "a".to_string(),
                    secret: "default/aa".to_string(),
                },
            ],
        );

        let snapshot = build_snapshot(&state, &[]);
        let mut sorted = snapshot.warnings.clone();
        sorted.sort();
        assert_eq!(snapshot.warnings, sorted);
    }
}
