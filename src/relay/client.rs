//! Relay client: replays a remote session's transactions onto the local bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use http::Uri;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::events::{EndpointKind, EventBus};
use crate::transport::{EndpointHandle, ShutdownSignal, StartError};

use super::RelayMessage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayClient {
    target: Uri,
}

impl RelayClient {
    pub fn new(target: Uri) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Connect once. There is no reconnect; losing the peer ends the endpoint.
    pub async fn start(
        &self,
        bus: Arc<EventBus>,
        shutdown: ShutdownSignal,
    ) -> Result<EndpointHandle, StartError> {
        let target = self.target.to_string();
        let connect_failed = |reason: String| StartError::RelayConnectFailed {
            target: target.clone(),
            reason,
        };

        let (ws, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(target.as_str()),
        )
        .await
        .map_err(|_| connect_failed("timed out".to_string()))?
        .map_err(|e| connect_failed(e.to_string()))?;

        tracing::info!("Relay client connected to {}", target);

        let task = tokio::spawn(read_loop(ws, bus, shutdown));
        Ok(EndpointHandle::new(EndpointKind::RelayClient, None, task))
    }
}

async fn read_loop(
    mut ws: RelayStream,
    bus: Arc<EventBus>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            incoming = ws.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => {
                    tracing::info!("Relay peer closed the connection");
                    return Ok(());
                }
                Some(Ok(Message::Text(text))) => handle_frame(&text, &bus),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("relay connection lost"),
            },
        }
    }
}

fn handle_frame(text: &str, bus: &EventBus) {
    match RelayMessage::decode(text) {
        Ok(RelayMessage::Transaction { transaction }) => {
            bus.publish_transaction(transaction);
        }
        Ok(RelayMessage::Hello { version }) => {
            tracing::debug!("Relay peer speaks version {}", version);
        }
        Err(err) => tracing::warn!("Skipping malformed relay frame: {:#}", err),
    }
}
