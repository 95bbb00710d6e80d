//! Service event handler: records each service's port mappings.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::core::Core;

use super::state::{PortRef, ServicePort};
use super::{object_ref, EventHandler};

pub struct ServiceHandler {
    core: Arc<Core>,
}

impl ServiceHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}

#[async_trait::async_trait]
impl EventHandler<Service> for ServiceHandler {
    async fn apply(&self, svc: Service) {
        let service_ref = object_ref(&svc);

        let ports: Vec<ServicePort> = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
            .map(|port| ServicePort {
                name: port.name.clone().unwrap_or_default(),
                port: port.port,
                target_port: match &port.target_port {
                    Some(IntOrString::Int(n)) => PortRef::Number(*n),
                    Some(IntOrString::String(name)) => PortRef::Name(name.clone()),
                    // the apiserver defaults targetPort before we see it
                    None => PortRef::Number(0),
                },
            })
            .collect();

        self.core.update(|state| {
            state.services.insert(service_ref.clone(), ports);
        });
    }

    async fn delete(&self, svc: Service) {
        let service_ref = object_ref(&svc);

        self.core.update(|state| {
            state.services.remove(&service_ref);
        });
    }
}
