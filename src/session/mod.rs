//! Session lifecycle
//!
//! One session per process: resolve the configuration, bootstrap the
//! certificate store, build the endpoints and subscribers, start, then wait
//! for a stop request or for the primary endpoint to end.
//!
//! ```text
//! RawOptions ─resolve─▶ Configuration ─prepare─▶ Session ─start─▶ RunningSession ─wait─▶ SessionOutcome
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, Configuration, RawOptions, WsApp};
use crate::events::{EndpointKind, EventBus, EventBusBuilder, Observer, SessionEvent, SessionInfo};
use crate::logging::{LoggerObserver, SessionLog};
use crate::relay::RelayForwarder;
use crate::storage::{self, StorageError};
use crate::transport::{
    Endpoint, EndpointHandle, PlannedEndpoints, StartError, TransitionError, TransportPlan,
    TransportState,
};
use crate::ui::{self, UiContext, UiError, UiRegistry};

pub use crate::transport::{ShutdownSignal, ShutdownTrigger};

/// How long endpoints get to wind down after a stop request.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Ui(#[from] UiError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Stopped,
    Failed { cause: String },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Stopped)
    }
}

/// A prepared session: endpoints built, subscribers frozen, nothing bound.
pub struct Session {
    config: Configuration,
    plan: TransportPlan,
    endpoints: PlannedEndpoints,
    bus: Arc<EventBus>,
    shutdown: ShutdownTrigger,
    state: TransportState,
}

impl Session {
    pub fn prepare(
        config: Configuration,
        logger: Arc<dyn SessionLog>,
        registry: &UiRegistry,
    ) -> Result<Self, SessionError> {
        Self::prepare_observed(config, logger, registry, Vec::new())
    }

    /// Like [`Session::prepare`], with extra observers subscribed after the
    /// built-in ones.
    pub fn prepare_observed(
        config: Configuration,
        logger: Arc<dyn SessionLog>,
        registry: &UiRegistry,
        extra_observers: Vec<Arc<dyn Observer>>,
    ) -> Result<Self, SessionError> {
        storage::ensure_dir(&config.certs_dir)?;

        let plan = TransportPlan::select(&config);
        let state = TransportState::Unresolved.select(plan.mode())?;
        let endpoints = PlannedEndpoints::build(&plan, &config);
        let shutdown = ShutdownTrigger::new();

        let mut builder = EventBusBuilder::new();
        builder.subscribe(Arc::new(LoggerObserver::new(logger, config.log_enabled)));

        let ui_ctx = UiContext {
            config: config.clone(),
            shutdown: shutdown.clone(),
        };
        if let Some(observer) = registry.attach(config.ui_mode, &ui_ctx)? {
            builder.subscribe(observer);
        }

        if let Some(server) = &endpoints.relay_server {
            builder.subscribe(Arc::new(RelayForwarder::new(server.clone())));
        }

        for observer in extra_observers {
            builder.subscribe(observer);
        }

        tracing::debug!("Session prepared: {} with {} subscribers", plan.mode(), builder.len());

        Ok(Self {
            config,
            plan,
            endpoints,
            bus: builder.build(),
            shutdown,
            state,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn plan(&self) -> &TransportPlan {
        &self.plan
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Start the primary endpoint, then the additive relay server.
    ///
    /// A primary failure is fatal and leaves nothing bound. A relay server
    /// failure is published as [`SessionEvent::EndpointFailed`] and the proxy
    /// keeps running.
    pub async fn start(self) -> Result<RunningSession, SessionError> {
        let signal = self.shutdown.subscribe();

        let primary = match self
            .endpoints
            .primary
            .start(self.bus.clone(), signal.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.state.fail()?;
                self.bus.publish(&SessionEvent::SessionFailed {
                    cause: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let relay = match self.endpoints.relay_server_endpoint() {
            Some(endpoint) => self.start_additive(endpoint, signal).await,
            None => None,
        };

        let state = self.state.run()?;

        let info = SessionInfo {
            mode: self.plan.mode(),
            proxy: match primary.kind() {
                EndpointKind::DirectProxy => primary.local_addr(),
                _ => None,
            },
            relay_server: relay.as_ref().and_then(EndpointHandle::local_addr),
            relay_target: self.config.ws_client_target().map(ToString::to_string),
        };
        self.bus.publish(&SessionEvent::SessionStarted(info.clone()));

        Ok(RunningSession {
            bus: self.bus,
            shutdown: self.shutdown,
            primary,
            relay,
            info,
            state,
        })
    }

    async fn start_additive(
        &self,
        endpoint: Endpoint,
        signal: ShutdownSignal,
    ) -> Option<EndpointHandle> {
        match endpoint.start(self.bus.clone(), signal).await {
            Ok(handle) => {
                if let (Some(addr), true) = (handle.local_addr(), self.config.ws_app != WsApp::None)
                {
                    ui::app::launch(self.config.ws_app, addr);
                }
                Some(handle)
            }
            Err(err) => {
                tracing::warn!("{} did not start: {}", endpoint.kind(), err);
                self.bus.publish(&SessionEvent::EndpointFailed {
                    endpoint: endpoint.kind(),
                    cause: err.to_string(),
                });
                None
            }
        }
    }
}

pub struct RunningSession {
    bus: Arc<EventBus>,
    shutdown: ShutdownTrigger,
    primary: EndpointHandle,
    relay: Option<EndpointHandle>,
    info: SessionInfo,
    state: TransportState,
}

impl RunningSession {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Run until `external` resolves, the session's [`ShutdownTrigger`]
    /// fires, or the primary endpoint ends. Every endpoint is stopped before
    /// this returns.
    pub async fn wait<F>(mut self, external: F) -> SessionOutcome
    where
        F: Future<Output = ()>,
    {
        let mut signal = self.shutdown.subscribe();
        tokio::pin!(external);

        let ended_early = tokio::select! {
            _ = &mut external => None,
            _ = signal.wait() => None,
            result = self.primary.finished() => Some(result),
        };
        self.shutdown.trigger();

        let primary_result = match ended_early {
            Some(result) => result,
            None => stop_endpoint(&mut self.primary).await,
        };
        if let Some(mut relay) = self.relay.take() {
            if let Err(err) = stop_endpoint(&mut relay).await {
                tracing::warn!("Relay server ended with error: {:#}", err);
            }
        }

        let outcome = match primary_result {
            Ok(()) => SessionOutcome::Stopped,
            Err(err) => SessionOutcome::Failed {
                cause: format!("{err:#}"),
            },
        };

        let next = match outcome {
            SessionOutcome::Stopped => self.state.terminate(),
            SessionOutcome::Failed { .. } => self.state.fail(),
        };
        if let Ok(state) = next {
            self.state = state;
        }

        match &outcome {
            SessionOutcome::Stopped => self.bus.publish(&SessionEvent::SessionStopped),
            SessionOutcome::Failed { cause } => self.bus.publish(&SessionEvent::SessionFailed {
                cause: cause.clone(),
            }),
        };
        outcome
    }
}

async fn stop_endpoint(handle: &mut EndpointHandle) -> anyhow::Result<()> {
    match tokio::time::timeout(STOP_GRACE, handle.finished()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{} did not stop in time; aborting", handle.kind());
            handle.abort();
            Ok(())
        }
    }
}

/// Resolve, prepare, start and wait. Returns once the session has ended.
pub async fn run<F>(
    raw: &RawOptions,
    logger: Arc<dyn SessionLog>,
    registry: &UiRegistry,
    shutdown: F,
) -> Result<SessionOutcome, SessionError>
where
    F: Future<Output = ()>,
{
    let config = Configuration::resolve(raw, registry)?;
    let session = Session::prepare(config, logger, registry)?;
    let running = session.start().await?;
    Ok(running.wait(shutdown).await)
}
