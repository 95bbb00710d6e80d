//! Secret event handler: parses `kubernetes.io/tls` secrets into
//! certificates and tracks the configured default certificate.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use tracing::error;

use crate::core::Core;
use crate::proxy::tls::Certificate;

use super::{object_ref, EventHandler};

pub struct SecretHandler {
    core: Arc<Core>,
    /// `namespace/name` of the secret holding the default certificate.
    default_ref: String,
}

impl SecretHandler {
    pub fn new(core: Arc<Core>, default_ref: String) -> Self {
        Self { core, default_ref }
    }

    fn remove(&self, secret_ref: String) {
        let default_ref = self.default_ref.clone();
        self.core.update(move |state| {
            state.secrets.remove(&secret_ref);
            if secret_ref == default_ref {
                state.default_cert = None;
            }
        });
    }
}

#[async_trait::async_trait]
impl EventHandler<Secret> for SecretHandler {
    async fn apply(&self, secret: Secret) {
        let secret_ref = object_ref(&secret);

        // A secret changing type away from kubernetes.io/tls is a removal.
        if secret.type_.as_deref() != Some("kubernetes.io/tls") {
            self.remove(secret_ref);
            return;
        }

        let crt = secret
            .data
            .as_ref()
            .and_then(|data| data.get("tls.crt"))
            .map(|b| b.0.as_slice())
            .unwrap_or_default();
        let key = secret
            .data
            .as_ref()
            .and_then(|data| data.get("tls.key"))
            .map(|b| b.0.as_slice())
            .unwrap_or_default();

        let cert = match Certificate::from_pem(crt, key) {
            Ok(cert) => Arc::new(cert),
            Err(e) => {
                error!(secret = %secret_ref, error = %e, "tls secret is invalid");
                self.remove(secret_ref);
                return;
            }
        };

        let default_ref = self.default_ref.clone();
        self.core.update(move |state| {
            if secret_ref == default_ref {
                state.default_cert = Some(cert.clone());
            }
            state.secrets.insert(secret_ref, cert);
        });
    }

    async fn delete(&self, secret: Secret) {
        self.remove(object_ref(&secret));
    }
}
