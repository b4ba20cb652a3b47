//! Transport mode selection
//!
//! Decides, once per session, which endpoints exist: a listening proxy (with
//! an optional relay server mirroring it) or an outward relay client.

mod endpoint;
mod shutdown;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use http::Uri;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{Configuration, TransportIntent};
use crate::events::EndpointKind;

pub use endpoint::{Endpoint, PlannedEndpoints};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};

/// Top-level topology. The relay server is additive and never a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    DirectProxy,
    WsRelayClient,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::DirectProxy => f.write_str("direct proxy"),
            TransportMode::WsRelayClient => f.write_str("relay client"),
        }
    }
}

/// Where the additive relay server binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerBinding {
    pub host: String,
    pub port: u16,
}

/// Outcome of transport selection; no I/O happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPlan {
    DirectProxy {
        host: String,
        port: u16,
        relay_server: Option<RelayServerBinding>,
    },
    RelayClient {
        target: Uri,
    },
}

impl TransportPlan {
    pub fn select(config: &Configuration) -> Self {
        match &config.transport {
            TransportIntent::RelayClient { target } => TransportPlan::RelayClient {
                target: target.clone(),
            },
            TransportIntent::Direct => TransportPlan::DirectProxy {
                host: config.host.clone(),
                port: config.port,
                relay_server: None,
            },
            TransportIntent::RelayServerAdditive { ws_host, ws_port } => {
                TransportPlan::DirectProxy {
                    host: config.host.clone(),
                    port: config.port,
                    relay_server: Some(RelayServerBinding {
                        host: ws_host.clone(),
                        port: *ws_port,
                    }),
                }
            }
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            TransportPlan::DirectProxy { .. } => TransportMode::DirectProxy,
            TransportPlan::RelayClient { .. } => TransportMode::WsRelayClient,
        }
    }

    pub fn relay_server(&self) -> Option<&RelayServerBinding> {
        match self {
            TransportPlan::DirectProxy { relay_server, .. } => relay_server.as_ref(),
            TransportPlan::RelayClient { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("address {addr} is already in use")]
    AddressInUse { addr: String },
    #[error("permission denied binding {addr}")]
    PermissionDenied { addr: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("certificate error: {reason}")]
    CertificateError { reason: String },
    #[error("cannot connect to relay {target}: {reason}")]
    RelayConnectFailed { target: String, reason: String },
}

impl StartError {
    /// Classify a bind failure for `addr`.
    pub fn from_bind(addr: &str, err: io::Error) -> Self {
        let addr = addr.to_string();
        match err.kind() {
            io::ErrorKind::AddrInUse => StartError::AddressInUse { addr },
            io::ErrorKind::PermissionDenied => StartError::PermissionDenied { addr },
            _ => StartError::Bind { addr, source: err },
        }
    }
}

/// A started endpoint. The task finishes once shutdown is signalled or the
/// endpoint ends on its own (relay peer gone).
#[derive(Debug)]
pub struct EndpointHandle {
    kind: EndpointKind,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl EndpointHandle {
    pub fn new(
        kind: EndpointKind,
        local_addr: Option<SocketAddr>,
        task: JoinHandle<anyhow::Result<()>>,
    ) -> Self {
        Self {
            kind,
            local_addr,
            task,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Actual bound address; `None` for the relay client.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> anyhow::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("{} task aborted: {}", self.kind, e)),
        }
    }

    /// Join without consuming; used when racing the task against shutdown.
    pub(crate) async fn finished(&mut self) -> anyhow::Result<()> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("{} task aborted: {}", self.kind, e)),
        }
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Lifecycle of the selected transport. Evaluated once; never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unresolved,
    Selected(TransportMode),
    Running(TransportMode),
    Terminated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transport transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TransportState,
    pub to: TransportState,
}

impl TransportState {
    pub fn select(self, mode: TransportMode) -> Result<Self, TransitionError> {
        self.transition(TransportState::Selected(mode))
    }

    pub fn run(self) -> Result<Self, TransitionError> {
        match self {
            TransportState::Selected(mode) => Ok(TransportState::Running(mode)),
            other => Err(TransitionError {
                from: other,
                to: TransportState::Running(other.mode().unwrap_or(TransportMode::DirectProxy)),
            }),
        }
    }

    pub fn terminate(self) -> Result<Self, TransitionError> {
        self.transition(TransportState::Terminated)
    }

    pub fn fail(self) -> Result<Self, TransitionError> {
        self.transition(TransportState::Failed)
    }

    pub fn mode(&self) -> Option<TransportMode> {
        match self {
            TransportState::Selected(mode) | TransportState::Running(mode) => Some(*mode),
            _ => None,
        }
    }

    fn transition(self, to: TransportState) -> Result<Self, TransitionError> {
        let allowed = matches!(
            (self, to),
            (TransportState::Unresolved, TransportState::Selected(_))
                | (TransportState::Selected(_), TransportState::Failed)
                | (TransportState::Running(_), TransportState::Terminated)
                | (TransportState::Running(_), TransportState::Failed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}
