//! Endpoints event handler: records the resolved address of every
//! address x port pair of each subset.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;

use crate::core::Core;

use super::state::EndpointSpec;
use super::{object_ref, EventHandler};

pub struct EndpointsHandler {
    core: Arc<Core>,
}

impl EndpointsHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}

#[async_trait::async_trait]
impl EventHandler<Endpoints> for EndpointsHandler {
    async fn apply(&self, ep: Endpoints) {
        let endpoints_ref = object_ref(&ep);

        let mut specs = Vec::new();
        for subset in ep.subsets.iter().flatten() {
            for addr in subset.addresses.iter().flatten() {
                for port in subset.ports.iter().flatten() {
                    specs.push(EndpointSpec {
                        name: port.name.clone().unwrap_or_default(),
                        port: port.port,
                        target: format!("{}:{}", addr.ip, port.port),
                    });
                }
            }
        }

        self.core.update(|state| {
            state.endpoints.insert(endpoints_ref.clone(), specs);
        });
    }

    async fn delete(&self, ep: Endpoints) {
        let endpoints_ref = object_ref(&ep);

        self.core.update(|state| {
            state.endpoints.remove(&endpoints_ref);
        });
    }
}
