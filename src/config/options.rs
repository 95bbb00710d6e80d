//! Per-backend options parsed from Ingress annotations.
//!
//! The annotation set is compatible with the ingress-nginx names; values are
//! set one key at a time through [`BackendOptions::set`] so unknown keys can
//! be reported by the caller depending on the annotation prefix.

use ipnet::IpNet;
use serde_json::{json, Value};

use crate::error::Error;

/// Policy options attached to a [`crate::config::Backend`].
///
/// Value semantics: options are copied into each backend at reconcile time
/// and never shared mutably.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOptions {
    /// Redirect plain-HTTP requests to HTTPS.
    pub ssl_redirect: bool,
    /// Connect to upstreams with TLS instead of plain TCP.
    pub secure_backends: bool,
    /// Source ranges allowed to use the backend. Empty means no restriction
    /// unless an invalid range was configured, in which case the list is
    /// emptied and requests are denied (fail safe).
    pub whitelist_source_range: Vec<IpNet>,
    /// CORS origin patterns; `*` allows any origin, a leading `*` matches a
    /// hostname suffix, anything else is an exact match.
    pub cors_allowed_origins: Vec<String>,
    /// Handle gRPC requests through the HTTP/2 bridge.
    pub grpc: bool,
    /// Handle gRPC-Web requests through the framing translator.
    pub grpc_web: bool,
}

struct Annotation {
    name: &'static str,
    apply: fn(&mut BackendOptions, &str) -> Result<(), Error>,
    get: fn(&BackendOptions) -> Value,
}

// Sorted by name: `set` does a binary search.
static ANNOTATIONS: &[Annotation] = &[
    Annotation {
        name: "cors-allowed-origins",
        apply: |o, v| {
            o.cors_allowed_origins = split_trimmed(v);
            Ok(())
        },
        get: |o| json!(o.cors_allowed_origins),
    },
    Annotation {
        name: "grpc",
        apply: |o, v| {
            o.grpc = bool_opt(v);
            Ok(())
        },
        get: |o| json!(o.grpc),
    },
    Annotation {
        name: "grpc-web",
        apply: |o, v| {
            o.grpc_web = bool_opt(v);
            Ok(())
        },
        get: |o| json!(o.grpc_web),
    },
    Annotation {
        name: "secure-backends",
        apply: |o, v| {
            o.secure_backends = bool_opt(v);
            Ok(())
        },
        get: |o| json!(o.secure_backends),
    },
    Annotation {
        name: "ssl-redirect",
        apply: |o, v| {
            o.ssl_redirect = bool_opt(v);
            Ok(())
        },
        get: |o| json!(o.ssl_redirect),
    },
    Annotation {
        name: "whitelist-source-range",
        apply: |o, v| match ip_net_list(v) {
            Ok(nets) => {
                o.whitelist_source_range = nets;
                Ok(())
            }
            Err(e) => {
                // fail safe: an unparseable list denies everything
                o.whitelist_source_range = Vec::new();
                Err(e)
            }
        },
        get: |o| {
            json!(o
                .whitelist_source_range
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>())
        },
    },
];

impl BackendOptions {
    /// Set a single option by its canonical short name.
    ///
    /// Returns `Ok(false)` when the name is not a recognized annotation; the
    /// caller decides whether that deserves a warning.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool, Error> {
        match ANNOTATIONS.binary_search_by(|a| a.name.cmp(key)) {
            Ok(i) => (ANNOTATIONS[i].apply)(self, value).map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// All recognized option names mapped to their effective values, for the
    /// introspection endpoint.
    pub fn get(&self) -> serde_json::Map<String, Value> {
        ANNOTATIONS
            .iter()
            .map(|a| (a.name.to_string(), (a.get)(self)))
            .collect()
    }
}

/// Names of all recognized annotations.
pub fn annotation_names() -> impl Iterator<Item = &'static str> {
    ANNOTATIONS.iter().map(|a| a.name)
}

fn bool_opt(value: &str) -> bool {
    value == "true"
}

fn split_trimmed(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

fn ip_net_list(value: &str) -> Result<Vec<IpNet>, Error> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    value
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<IpNet>()
                .map_err(|e| Error::InvalidAnnotation(format!("{v:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_sorted() {
        for pair in ANNOTATIONS.windows(2) {
            assert!(pair[0].name < pair[1].name, "{} >= {}", pair[0].name, pair[1].name);
        }
    }

    #[test]
    fn unknown_key_is_reported_without_error() {
        let mut opts = BackendOptions::default();
        assert_eq!(opts.set("rewrite-target", "/").unwrap(), false);
        assert_eq!(opts, BackendOptions::default());
    }

    #[test]
    fn booleans_require_the_literal_true() {
        let mut opts = BackendOptions::default();
        for (value, expected) in [("true", true), ("True", false), ("1", false), ("", false)] {
            assert!(opts.set("ssl-redirect", value).unwrap());
            assert_eq!(opts.ssl_redirect, expected, "value {value:?}");
        }

        assert!(opts.set("secure-backends", "true").unwrap());
        assert!(opts.secure_backends);
        assert!(opts.set("grpc", "true").unwrap());
        assert!(opts.grpc);
        assert!(opts.set("grpc-web", "true").unwrap());
        assert!(opts.grpc_web);
    }

    #[test]
    fn whitelist_parses_trimmed_cidr_list() {
        let mut opts = BackendOptions::default();
        assert!(opts.set("whitelist-source-range", " 10.0.0.0/8 ,192.168.0.0/16").unwrap());
        assert_eq!(opts.whitelist_source_range.len(), 2);
        assert!(opts.whitelist_source_range[0].contains(&"10.1.2.3".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn whitelist_parse_error_empties_the_list() {
        let mut opts = BackendOptions::default();
        opts.set("whitelist-source-range", "10.0.0.0/8").unwrap();

        let err = opts.set("whitelist-source-range", "10.0.0.0/8,not-a-cidr");
        assert!(err.is_err());
        assert!(opts.whitelist_source_range.is_empty());
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let mut opts = BackendOptions::default();
        assert!(opts
            .set("cors-allowed-origins", "https://app.example.com, *.trusted.dev")
            .unwrap());
        assert_eq!(
            opts.cors_allowed_origins,
            vec!["https://app.example.com".to_string(), "*.trusted.dev".to_string()]
        );
    }

    #[test]
    fn get_round_trips_every_annotation() {
        let mut opts = BackendOptions::default();
        opts.set("ssl-redirect", "true").unwrap();
        opts.set("whitelist-source-range", "10.0.0.0/8").unwrap();
        opts.set("cors-allowed-origins", "*").unwrap();

        let values = opts.get();
        assert_eq!(values.len(), annotation_names().count());
        assert_eq!(values["ssl-redirect"], json!(true));
        assert_eq!(values["secure-backends"], json!(false));
        assert_eq!(values["whitelist-source-range"], json!(["10.0.0.0/8"]));
        assert_eq!(values["cors-allowed-origins"], json!(["*"]));
    }
}
