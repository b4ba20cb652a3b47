//! Relay server: mirrors local transactions to websocket peers.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;

use crate::events::{EndpointKind, Observer, SessionEvent};
use crate::models::Transaction;
use crate::transport::{EndpointHandle, ShutdownSignal, StartError};

use super::RelayMessage;

/// Frames buffered per peer before a slow peer starts skipping.
const PEER_BUFFER: usize = 1024;

pub struct RelayServer {
    host: String,
    port: u16,
    frames: broadcast::Sender<String>,
}

impl RelayServer {
    pub fn new(host: &str, port: u16) -> Self {
        let (frames, _) = broadcast::channel(PEER_BUFFER);
        Self {
            host: host.to_string(),
            port,
            frames,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue `tx` for every connected peer. Returns how many peers it was
    /// queued for; zero when nobody is connected.
    pub fn forward(&self, tx: &Transaction) -> anyhow::Result<usize> {
        let frame = RelayMessage::Transaction {
            transaction: tx.clone(),
        }
        .encode()?;
        Ok(self.frames.send(frame).unwrap_or(0))
    }

    pub fn peer_count(&self) -> usize {
        self.frames.receiver_count()
    }

    pub async fn start(&self, shutdown: ShutdownSignal) -> Result<EndpointHandle, StartError> {
        let requested = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| StartError::from_bind(&requested, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StartError::from_bind(&requested, e))?;

        tracing::info!("Relay server listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(listener, self.frames.clone(), shutdown));
        Ok(EndpointHandle::new(
            EndpointKind::RelayServer,
            Some(local_addr),
            task,
        ))
    }
}

async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<String>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let peer_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let rx = frames.subscribe();
                    let shutdown = peer_shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_peer(stream, peer_addr, rx, shutdown).await {
                            tracing::debug!(%peer_addr, %err, "relay peer closed with error");
                        }
                    });
                }
                Err(e) => tracing::error!("Relay accept error: {}", e),
            }
        }
    }

    tracing::info!("Relay server stopped");
    Ok(())
}

async fn serve_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut frames: broadcast::Receiver<String>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    tracing::info!(%peer_addr, "relay peer connected");

    ws.send(Message::Text(RelayMessage::hello().encode()?)).await?;

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = frames.recv() => match frame {
                Ok(text) => ws.send(Message::Text(text)).await?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%peer_addr, skipped, "relay peer lagging; transactions dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(%peer_addr, "relay peer disconnected");
    Ok(())
}

/// Bus subscriber feeding a [`RelayServer`].
pub struct RelayForwarder {
    server: Arc<RelayServer>,
}

impl RelayForwarder {
    pub fn new(server: Arc<RelayServer>) -> Self {
        Self { server }
    }
}

impl Observer for RelayForwarder {
    fn name(&self) -> &str {
        "relay-forwarder"
    }

    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        if let SessionEvent::TransactionObserved(tx) = event {
            self.server.forward(tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, HttpMethod};
    use crate::transport::ShutdownTrigger;
    use std::time::Duration;

    fn transaction(path: &str) -> Transaction {
        Exchange::new(HttpMethod::Get, "http", "relay.test", 80, path, vec![]).finish(200, "OK")
    }

    async fn next_frame<S>(ws: &mut S) -> RelayMessage
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame before timeout")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = msg {
                return RelayMessage::decode(&text).unwrap();
            }
        }
    }

    #[test]
    fn forward_without_peers_is_not_an_error() {
        let server = RelayServer::new("127.0.0.1", 0);
        assert_eq!(server.forward(&transaction("/")).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peers_get_hello_then_transactions() {
        let server = Arc::new(RelayServer::new("127.0.0.1", 0));
        let trigger = ShutdownTrigger::new();
        let handle = server.start(trigger.subscribe()).await.unwrap();
        let addr = handle.local_addr().unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut ws).await, RelayMessage::Hello { .. }));

        for _ in 0..100 {
            if server.peer_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let forwarder = RelayForwarder::new(server.clone());
        let tx = transaction("/mirrored");
        forwarder
            .on_event(&SessionEvent::TransactionObserved(Arc::new(tx.clone())))
            .unwrap();

        match next_frame(&mut ws).await {
            RelayMessage::Transaction { transaction } => assert_eq!(transaction, tx),
            other => panic!("unexpected frame {other:?}"),
        }

        trigger.trigger();
        handle.join().await.unwrap();
    }
}
