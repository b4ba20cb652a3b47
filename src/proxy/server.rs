//! Proxy engine
//!
//! Accepts proxy clients, forwards their requests upstream, terminates TLS for
//! `CONNECT` tunnels with certificates from the local CA, and publishes a
//! [`Transaction`](crate::models::Transaction) for every completed exchange.

use crate::events::{EndpointKind, EventBus};
use crate::models::{Exchange, HttpMethod};
use crate::proxy::cert_manager::{CertManager, CertOptions};
use crate::proxy::http1::{
    forward_chunked_body, forward_fixed_length_body, read_http_request, read_response_head,
    respond_with_status, write_request_head, BodyCapture, ParsedRequest, RequestBodyKind,
    RequestBodyTooLarge, RequestScheme, ResponseHead, MAX_BODY_CAPTURE_BYTES,
    MAX_REQUEST_BODY_BYTES,
};
use crate::transport::{EndpointHandle, ShutdownSignal, StartError};
use anyhow::{anyhow, Context};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use webpki_roots::TLS_SERVER_ROOTS;

/// Keep-alive idle timeout in seconds
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;

fn build_tls_client_config() -> ClientConfig {
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Everything a connection task needs.
struct EngineContext {
    cert_manager: Arc<CertManager>,
    tls_client_config: Arc<ClientConfig>,
    bus: Arc<EventBus>,
}

impl EngineContext {
    fn publish(&self, exchange: Exchange, code: u16, message: &str) {
        self.bus.publish_transaction(exchange.finish(code, message));
    }
}

/// The intercepting proxy. Construction is cheap; CA material is loaded on
/// [`ProxyEngine::start`], before any socket is bound.
pub struct ProxyEngine {
    options: CertOptions,
}

impl ProxyEngine {
    pub fn new(options: CertOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CertOptions {
        &self.options
    }

    pub async fn start(
        &self,
        host: &str,
        port: u16,
        bus: Arc<EventBus>,
        shutdown: ShutdownSignal,
    ) -> Result<EndpointHandle, StartError> {
        // Usually installed by the binary already; the first install wins.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let cert_manager = CertManager::load_or_create(&self.options).map_err(|e| {
            StartError::CertificateError {
                reason: format!("{e:#}"),
            }
        })?;

        let requested = format!("{host}:{port}");
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| StartError::from_bind(&requested, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StartError::from_bind(&requested, e))?;

        tracing::info!("Proxy server listening on {}", local_addr);

        let ctx = Arc::new(EngineContext {
            cert_manager: Arc::new(cert_manager),
            tls_client_config: Arc::new(build_tls_client_config()),
            bus,
        });
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown));

        Ok(EndpointHandle::new(
            EndpointKind::DirectProxy,
            Some(local_addr),
            task,
        ))
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<EngineContext>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, ctx).await {
                            log_connection_error(&e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }

    tracing::info!("Proxy server stopped");
    Ok(())
}

/// Client-side disconnects are routine; only log the rest as errors.
fn log_connection_error(e: &anyhow::Error) {
    let err_str = e.to_string().to_lowercase();
    if err_str.contains("eof")
        || err_str.contains("broken pipe")
        || err_str.contains("connection reset")
        || err_str.contains("connection closed")
    {
        tracing::debug!("Connection closed by client: {}", e);
    } else {
        tracing::error!("Error handling connection: {}", e);
    }
}

async fn handle_connection(mut socket: TcpStream, ctx: Arc<EngineContext>) -> anyhow::Result<()> {
    let mut request_number: u32 = 0;

    loop {
        request_number += 1;

        let parsed_request = match tokio::time::timeout(
            tokio::time::Duration::from_secs(KEEP_ALIVE_TIMEOUT_SECS),
            read_http_request(&mut socket, RequestScheme::Http),
        )
        .await
        {
            Ok(Ok(req)) => req,
            Ok(Err(err)) => {
                // Later failures on a kept-alive connection are just the client closing.
                if request_number == 1 {
                    tracing::warn!("Failed to parse request: {err}");
                    let (code, label) = rejection_for(&err);
                    let _ = respond_with_status(&mut socket, code, label, "Unable to parse HTTP request")
                        .await;
                }
                break;
            }
            Err(_) => {
                tracing::debug!("Keep-alive timeout after {} requests", request_number - 1);
                break;
            }
        };

        if parsed_request.method == HttpMethod::Connect {
            return intercept_tls_stream(socket, parsed_request, ctx).await;
        }

        let keep_alive = process_request(&mut socket, parsed_request, &ctx).await?;
        if !keep_alive {
            break;
        }
    }

    Ok(())
}

fn rejection_for(err: &anyhow::Error) -> (u16, &'static str) {
    if err.downcast_ref::<RequestBodyTooLarge>().is_some() {
        (413, "Payload Too Large")
    } else {
        (400, "Bad Request")
    }
}

async fn intercept_tls_stream<S>(
    mut client: S,
    connect: ParsedRequest,
    ctx: Arc<EngineContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_config = match ctx.cert_manager.server_config_for_host(&connect.host) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Cannot intercept {}: {err:#}", connect.host);
            respond_with_status(&mut client, 502, "Bad Gateway", "Certificate unavailable").await?;
            let exchange = Exchange::new(
                HttpMethod::Connect,
                "https",
                &connect.host,
                connect.port,
                "/",
                connect.headers,
            );
            ctx.publish(exchange, 502, "Bad Gateway");
            return Ok(());
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let acceptor = TlsAcceptor::from(server_config);
    let mut tls_stream = acceptor.accept(client).await?;

    let mut request_count: u32 = 0;
    loop {
        request_count += 1;
        let mut parsed_request =
            match read_http_request(&mut tls_stream, RequestScheme::Https).await {
                Ok(req) => req,
                Err(err) => {
                    if request_count == 1 {
                        tracing::warn!("Failed to parse HTTPS request: {err}");
                        let (code, label) = rejection_for(&err);
                        let _ = respond_with_status(
                            &mut tls_stream,
                            code,
                            label,
                            "Unable to parse HTTPS request",
                        )
                        .await;
                    } else {
                        tracing::debug!(
                            "HTTPS keep-alive connection closed after {} requests: {err}",
                            request_count - 1
                        );
                    }
                    break;
                }
            };

        // Origin-form requests inside the tunnel target the CONNECT authority.
        if parsed_request.port == 443 && connect.port != 443 && parsed_request.host == connect.host {
            parsed_request.port = connect.port;
        }

        if !process_request(&mut tls_stream, parsed_request, &ctx).await? {
            break;
        }
    }

    Ok(())
}

/// Forward one request and relay its response. Returns whether the client
/// connection may be reused.
async fn process_request<S>(
    client: &mut S,
    mut parsed_request: ParsedRequest,
    ctx: &EngineContext,
) -> anyhow::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let req_start = Instant::now();
    let mut exchange = Exchange::new(
        parsed_request.method.clone(),
        parsed_request.scheme.as_str(),
        &parsed_request.host,
        parsed_request.port,
        &parsed_request.path,
        parsed_request.headers.clone(),
    );
    exchange.detail.http_version = parsed_request.version.clone();

    let (mut upstream, connect_ms) = match connect_upstream(&parsed_request, ctx).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(
                "Failed to connect to upstream {}:{} - {:#}",
                parsed_request.host,
                parsed_request.port,
                err
            );
            respond_with_status(client, 502, "Bad Gateway", "Unable to reach upstream server")
                .await?;
            exchange.detail.notes = Some("Upstream connection failed".to_string());
            exchange.detail.timing.total_ms = Some(elapsed_ms(req_start));
            ctx.publish(exchange, 502, "Bad Gateway");
            return Ok(false);
        }
    };
    exchange.detail.timing.connect_ms = Some(connect_ms);

    let mut request_capture = BodyCapture::new(MAX_BODY_CAPTURE_BYTES);
    let forward_result =
        forward_request_to_upstream(client, &mut upstream, &mut parsed_request, &mut request_capture)
            .await;
    exchange.detail.request_body = request_capture.into_option();

    if let Err(err) = forward_result {
        tracing::warn!("Failed to forward request upstream: {err}");
        let (code, label) = rejection_for(&err);
        respond_with_status(client, code, label, "Failed to forward request body").await?;
        exchange.detail.timing.total_ms = Some(elapsed_ms(req_start));
        ctx.publish(exchange, code, label);
        return Ok(false);
    }
    upstream.flush().await?;

    let waiting_start = Instant::now();
    let mut response_head = match read_response_head(&mut upstream).await {
        Ok(head) => head,
        Err(err) => {
            tracing::error!("Failed to read response head: {err}");
            respond_with_status(client, 502, "Bad Gateway", "Failed to read response").await?;
            exchange.detail.notes = Some("No response from upstream".to_string());
            exchange.detail.timing.total_ms = Some(elapsed_ms(req_start));
            ctx.publish(exchange, 502, "Bad Gateway");
            return Ok(false);
        }
    };
    exchange.detail.timing.waiting_ms = Some(elapsed_ms(waiting_start));
    exchange.detail.response_headers = response_head.headers.clone();

    if parsed_request.is_websocket_upgrade() && response_head.status_code == 101 {
        client.write_all(&response_head.raw_head).await?;
        client.write_all(&response_head.body_prefix).await?;
        client.flush().await?;

        exchange.detail.notes = Some("WebSocket upgrade".to_string());
        exchange.detail.timing.total_ms = Some(elapsed_ms(req_start));
        ctx.publish(exchange, 101, &response_head.reason);

        if let Err(e) = tokio::io::copy_bidirectional(client, &mut upstream).await {
            tracing::debug!("WebSocket tunnel closed: {}", e);
        }
        return Ok(false);
    }

    client.write_all(&response_head.raw_head).await?;
    let mut response_capture = BodyCapture::new(MAX_BODY_CAPTURE_BYTES);
    let (size, reusable) = relay_response_body(
        &parsed_request,
        &mut response_head,
        &mut upstream,
        client,
        &mut response_capture,
    )
    .await?;
    client.flush().await?;

    exchange.detail.response_body = response_capture.into_option();
    exchange.detail.response_size = Some(size);
    exchange.detail.timing.total_ms = Some(elapsed_ms(req_start));
    ctx.publish(exchange, response_head.status_code, &response_head.reason);

    Ok(reusable && parsed_request.keep_alive())
}

async fn forward_request_to_upstream<S, U>(
    client: &mut S,
    upstream: &mut U,
    parsed_request: &mut ParsedRequest,
    capture: &mut BodyCapture,
) -> anyhow::Result<()>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    write_request_head(upstream, parsed_request).await?;

    match parsed_request.body_kind {
        RequestBodyKind::None => {}
        RequestBodyKind::ContentLength { length } => {
            forward_fixed_length_body(
                client,
                upstream,
                &mut parsed_request.buffered_body,
                length,
                capture,
            )
            .await?;
        }
        RequestBodyKind::Chunked => {
            let initial = std::mem::take(&mut parsed_request.buffered_body);
            forward_chunked_body(
                initial,
                client,
                upstream,
                capture,
                Some(MAX_REQUEST_BODY_BYTES),
            )
            .await?;
        }
    }
    Ok(())
}

/// Relay the response body using whatever framing the head declares. Returns
/// the body size and whether the client connection stays usable.
async fn relay_response_body<S, U>(
    request: &ParsedRequest,
    head: &mut ResponseHead,
    upstream: &mut U,
    client: &mut S,
    capture: &mut BodyCapture,
) -> anyhow::Result<(u64, bool)>
where
    S: AsyncWrite + Unpin,
    U: AsyncRead + Unpin,
{
    let bodiless = request.method == HttpMethod::Head
        || head.status_code == 204
        || head.status_code == 304
        || (100..200).contains(&head.status_code);
    if bodiless {
        return Ok((0, true));
    }

    if head.is_chunked() {
        let prefix = std::mem::take(&mut head.body_prefix);
        let size = forward_chunked_body(prefix, upstream, client, capture, None).await?;
        return Ok((size, true));
    }

    if let Some(length) = head.content_length() {
        let size =
            forward_fixed_length_body(upstream, client, &mut head.body_prefix, length, capture)
                .await
                .context("reading response body")?;
        return Ok((size, true));
    }

    // Delimited by connection close
    let mut size = head.body_prefix.len() as u64;
    client.write_all(&head.body_prefix).await?;
    capture.push(&head.body_prefix);
    let mut buf = vec![0u8; 8192];
    loop {
        let n = upstream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n]).await?;
        capture.push(&buf[..n]);
        size += n as u64;
    }
    Ok((size, false))
}

async fn connect_upstream(
    parsed_request: &ParsedRequest,
    ctx: &EngineContext,
) -> anyhow::Result<(UpstreamStream, u32)> {
    let connect_start = Instant::now();
    let stream = TcpStream::connect((parsed_request.host.as_str(), parsed_request.port))
        .await
        .with_context(|| {
            format!(
                "connecting to upstream {}:{}",
                parsed_request.host, parsed_request.port
            )
        })?;

    if parsed_request.scheme == RequestScheme::Https {
        let server_name = ServerName::try_from(parsed_request.host.clone())
            .map_err(|_| anyhow!("invalid server name {}", parsed_request.host))?;
        let connector = TlsConnector::from(ctx.tls_client_config.clone());
        let tls = connector.connect(server_name, stream).await?;
        Ok((UpstreamStream::Tls(Box::new(tls)), elapsed_ms(connect_start)))
    } else {
        Ok((UpstreamStream::Plain(stream), elapsed_ms(connect_start)))
    }
}

fn elapsed_ms(since: Instant) -> u32 {
    u32::try_from(since.elapsed().as_millis()).unwrap_or(u32::MAX)
}

enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
