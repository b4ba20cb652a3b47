use std::sync::Arc;

use crate::config::Configuration;
use crate::events::{EndpointKind, EventBus};
use crate::proxy::{EngineOptions, ProxyEngine};
use crate::relay::{RelayClient, RelayServer};

use super::{EndpointHandle, ShutdownSignal, StartError, TransportPlan};

/// A constructed but not yet started endpoint.
pub enum Endpoint {
    DirectProxy {
        engine: ProxyEngine,
        host: String,
        port: u16,
    },
    RelayClient(RelayClient),
    RelayServer(Arc<RelayServer>),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::DirectProxy { .. } => EndpointKind::DirectProxy,
            Endpoint::RelayClient(_) => EndpointKind::RelayClient,
            Endpoint::RelayServer(_) => EndpointKind::RelayServer,
        }
    }

    pub async fn start(
        &self,
        bus: Arc<EventBus>,
        shutdown: ShutdownSignal,
    ) -> Result<EndpointHandle, StartError> {
        match self {
            Endpoint::DirectProxy { engine, host, port } => {
                engine.start(host, *port, bus, shutdown).await
            }
            Endpoint::RelayClient(client) => client.start(bus, shutdown).await,
            Endpoint::RelayServer(server) => server.start(shutdown).await,
        }
    }
}

/// Endpoints built from a [`TransportPlan`].
pub struct PlannedEndpoints {
    pub primary: Endpoint,
    /// Additive relay server, only alongside a direct proxy
    pub relay_server: Option<Arc<RelayServer>>,
}

impl PlannedEndpoints {
    pub fn build(plan: &TransportPlan, config: &Configuration) -> Self {
        match plan {
            TransportPlan::RelayClient { target } => PlannedEndpoints {
                primary: Endpoint::RelayClient(RelayClient::new(target.clone())),
                relay_server: None,
            },
            TransportPlan::DirectProxy {
                host,
                port,
                relay_server,
            } => {
                let engine = ProxyEngine::new(EngineOptions {
                    certs_dir: config.certs_dir.clone(),
                    server_key_length: config.server_key_length,
                    ca_common_name: config.ca_common_name.clone(),
                });
                PlannedEndpoints {
                    primary: Endpoint::DirectProxy {
                        engine,
                        host: host.clone(),
                        port: *port,
                    },
                    relay_server: relay_server
                        .as_ref()
                        .map(|binding| Arc::new(RelayServer::new(&binding.host, binding.port))),
                }
            }
        }
    }

    pub fn relay_server_endpoint(&self) -> Option<Endpoint> {
        self.relay_server.clone().map(Endpoint::RelayServer)
    }
}
