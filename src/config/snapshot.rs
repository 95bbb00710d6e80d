use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Backend;
use crate::proxy::tls::Certificate;

/// The immutable routing table.
///
/// Built by the reconciler, published whole through the snapshot slot, and
/// read lock-free by the dispatcher and the TLS terminator. Readers always
/// observe one snapshot in its entirety.
#[derive(Default)]
pub struct Snapshot {
    /// Reconcile warnings (duplicate rules, missing TLS secrets), sorted.
    pub warnings: Vec<String>,
    /// Host to ordered backend list, longest prefix first.
    pub backends: HashMap<String, Vec<Arc<Backend>>>,
    /// Host to TLS certificate, for SNI selection.
    pub certs: HashMap<String, Arc<Certificate>>,
    /// Certificate served when no host matches the SNI name.
    pub default_cert: Option<Arc<Certificate>>,
}

impl Snapshot {
    /// Resolve a request to a backend: exact host first, then the `*.suffix`
    /// wildcard entry, then the first backend whose prefix matches the
    /// request URI.
    pub fn backend_for(&self, host: &str, request_uri: &str) -> Option<&Arc<Backend>> {
        let backends = match self.backends.get(host) {
            Some(list) if !list.is_empty() => list,
            _ => {
                let dot = host.find('.')?;
                self.backends.get(&format!("*{}", &host[dot..]))?
            }
        };

        backends.iter().find(|b| b.handles_path(request_uri))
    }
}
