use rand::seq::SliceRandom;

use crate::config::BackendOptions;

/// A routed destination under one host: a path prefix, the resolved endpoint
/// targets, and the policy options of the producing Ingress.
///
/// Immutable once installed in a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backend {
    /// `namespace/name` of the producing Ingress (or `custom[N]`).
    pub ingress_ref: String,
    /// Path prefix; empty matches every path.
    pub prefix: String,
    /// `host:port` endpoint addresses, in the order the endpoints were seen.
    pub targets: Vec<String>,
    pub options: BackendOptions,
}

impl Backend {
    pub fn new(
        ingress_ref: impl Into<String>,
        prefix: impl Into<String>,
        targets: Vec<String>,
    ) -> Self {
        Self {
            ingress_ref: ingress_ref.into(),
            prefix: prefix.into(),
            targets,
            options: BackendOptions::default(),
        }
    }

    /// Whether this backend handles the given request URI (prefix match,
    /// query string included).
    pub fn handles_path(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// A target chosen uniformly at random, or `None` when the backend has
    /// no endpoints (callers answer 503).
    pub fn target(&self) -> Option<&str> {
        self.targets
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
    }
}
