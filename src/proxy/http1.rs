//! HTTP/1.x framing helpers
//!
//! Just enough message parsing to forward a request upstream, relay the
//! response back, and capture a bounded copy of both bodies on the way.

use anyhow::{anyhow, Context};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::HttpMethod;

pub(crate) const MAX_HEADER_BYTES: usize = 64 * 1024;
pub(crate) const MAX_HEADER_COUNT: usize = 128;
pub(crate) const MAX_BODY_CAPTURE_BYTES: usize = 512 * 1024;
pub(crate) const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

pub(crate) type Headers = Vec<(String, String)>;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub(crate) struct RequestBodyTooLarge {
    limit: usize,
}

impl RequestBodyTooLarge {
    pub(crate) fn new(limit: usize) -> Self {
        Self { limit }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RequestScheme::Http => "http",
            RequestScheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            RequestScheme::Http => 80,
            RequestScheme::Https => 443,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RequestBodyKind {
    None,
    ContentLength { length: usize },
    Chunked,
}

/// Parsed request with what forwarding and capture need.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: HttpMethod,
    pub scheme: RequestScheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body_kind: RequestBodyKind,
    /// Bytes read past the header block
    pub buffered_body: Vec<u8>,
}

impl ParsedRequest {
    pub(crate) fn keep_alive(&self) -> bool {
        match header_value(&self.headers, "connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.ends_with("1.1"),
        }
    }

    pub(crate) fn is_websocket_upgrade(&self) -> bool {
        self.method == HttpMethod::Get
            && header_value(&self.headers, "upgrade")
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }
}

pub(crate) struct ResponseHead {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub raw_head: Vec<u8>,
    pub body_prefix: Vec<u8>,
}

impl ResponseHead {
    pub(crate) fn content_length(&self) -> Option<usize> {
        header_value(&self.headers, "content-length").and_then(|v| v.trim().parse().ok())
    }

    pub(crate) fn is_chunked(&self) -> bool {
        is_chunked(&self.headers)
    }
}

/// Keeps the first `limit` bytes of everything pushed into it.
pub(crate) struct BodyCapture {
    buf: Vec<u8>,
    limit: usize,
}

impl BodyCapture {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let to_take = remaining.min(data.len());
        if to_take > 0 {
            self.buf.extend_from_slice(&data[..to_take]);
        }
    }

    pub(crate) fn into_option(self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf)
        }
    }
}

pub(crate) async fn read_http_request<S>(
    stream: &mut S,
    default_scheme: RequestScheme,
) -> anyhow::Result<ParsedRequest>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered_body) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    if req.parse(&raw_head)?.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method = HttpMethod::parse(req.method.unwrap_or("GET"));
    let target = req.path.unwrap_or("/").to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = headers_from_httparse(req.headers);

    if method == HttpMethod::Connect {
        let (host, port) = split_host_and_port(&target, 443);
        return Ok(ParsedRequest {
            method,
            scheme: RequestScheme::Https,
            host,
            port,
            path: "/".to_string(),
            version,
            headers,
            body_kind: RequestBodyKind::None,
            buffered_body,
        });
    }

    let content_length = header_value(&headers, "content-length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid content-length: {v}"))
        })
        .transpose()?;
    if content_length.is_some_and(|len| len > MAX_REQUEST_BODY_BYTES) {
        return Err(RequestBodyTooLarge::new(MAX_REQUEST_BODY_BYTES).into());
    }

    let body_kind = if is_chunked(&headers) {
        RequestBodyKind::Chunked
    } else if let Some(length) = content_length {
        RequestBodyKind::ContentLength { length }
    } else {
        RequestBodyKind::None
    };

    let (scheme, host, port, path) = resolve_target(&target, &headers, default_scheme)?;

    Ok(ParsedRequest {
        method,
        scheme,
        host,
        port,
        path,
        version,
        headers,
        body_kind,
        buffered_body,
    })
}

pub(crate) async fn read_response_head<S>(stream: &mut S) -> anyhow::Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, body_prefix) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut res = httparse::Response::new(&mut header_storage);
    if res.parse(&raw_head)?.is_partial() {
        return Err(anyhow!("partial HTTP response"));
    }

    Ok(ResponseHead {
        status_code: res.code.unwrap_or(500),
        reason: res.reason.unwrap_or("").to_string(),
        headers: headers_from_httparse(res.headers),
        raw_head,
        body_prefix,
    })
}

/// Read up to and including the blank line; returns (head, leftover bytes).
async fn read_message_head<S>(stream: &mut S) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }
    }

    Err(anyhow!("connection closed before headers completed"))
}

/// Copy exactly `expected_len` body bytes from `reader` (after draining
/// `buffered`) into `writer`.
pub(crate) async fn forward_fixed_length_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffered: &mut Vec<u8>,
    expected_len: usize,
    capture: &mut BodyCapture,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = expected_len;

    if !buffered.is_empty() {
        let to_take = remaining.min(buffered.len());
        writer.write_all(&buffered[..to_take]).await?;
        capture.push(&buffered[..to_take]);
        remaining -= to_take;
        buffered.drain(..to_take);
    }

    let mut buf = vec![0u8; 8192];
    while remaining > 0 {
        let read_len = buf.len().min(remaining);
        let n = reader.read(&mut buf[..read_len]).await?;
        if n == 0 {
            return Err(anyhow!("connection closed while reading body"));
        }
        writer.write_all(&buf[..n]).await?;
        capture.push(&buf[..n]);
        remaining -= n;
    }
    Ok(expected_len as u64)
}

/// Relay a chunked body verbatim, capturing the decoded payload. `limit`
/// bounds the decoded size.
pub(crate) async fn forward_chunked_body<R, W>(
    initial: Vec<u8>,
    reader: &mut R,
    writer: &mut W,
    capture: &mut BodyCapture,
    limit: Option<usize>,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer: VecDeque<u8> = initial.into();
    let mut total: usize = 0;

    loop {
        let line = read_crlf_line(&mut buffer, reader).await?;
        writer.write_all(&line).await?;

        let size_token = std::str::from_utf8(&line[..line.len() - 2])
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let chunk_size = usize::from_str_radix(&size_token, 16)
            .map_err(|_| anyhow!("invalid chunk size: {size_token}"))?;

        if chunk_size == 0 {
            // Trailers end with a blank line
            loop {
                let trailer_line = read_crlf_line(&mut buffer, reader).await?;
                writer.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" {
                    break;
                }
            }
            break;
        }

        total = total
            .checked_add(chunk_size)
            .ok_or_else(|| anyhow!("chunked body size overflow"))?;
        if let Some(limit) = limit {
            if total > limit {
                return Err(RequestBodyTooLarge::new(limit).into());
            }
        }

        let chunk_data = read_exact_from_buffer(&mut buffer, reader, chunk_size).await?;
        writer.write_all(&chunk_data).await?;
        capture.push(&chunk_data);

        let crlf = read_exact_from_buffer(&mut buffer, reader, 2).await?;
        if crlf != b"\r\n" {
            return Err(anyhow!("invalid chunk terminator"));
        }
        writer.write_all(&crlf).await?;
    }

    Ok(total as u64)
}

async fn read_crlf_line<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf_in_deque(buffer) {
            return Ok(buffer.drain(..pos + 2).collect());
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("chunk header line too long"));
        }
        fill_buffer(buffer, stream).await?;
    }
}

async fn read_exact_from_buffer<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    len: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < len {
        fill_buffer(buffer, stream).await?;
    }
    Ok(buffer.drain(..len).collect())
}

async fn fill_buffer<R>(buffer: &mut VecDeque<u8>, stream: &mut R) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let read = stream.read(&mut temp).await?;
    if read == 0 {
        return Err(anyhow!("connection closed while reading chunked body"));
    }
    buffer.extend(&temp[..read]);
    Ok(())
}

fn find_crlf_in_deque(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Headers {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn resolve_target(
    raw_path: &str,
    headers: &[(String, String)],
    default_scheme: RequestScheme,
) -> anyhow::Result<(RequestScheme, String, u16, String)> {
    if let Some(rest) = raw_path.strip_prefix("http://") {
        return Ok(parse_absolute_target(rest, RequestScheme::Http));
    }
    if let Some(rest) = raw_path.strip_prefix("https://") {
        return Ok(parse_absolute_target(rest, RequestScheme::Https));
    }

    let host_header = header_value(headers, "host")
        .context("Missing Host header in origin-form request")?;
    let (host, port) = split_host_and_port(host_header, default_scheme.default_port());
    Ok((default_scheme, host, port, raw_path.to_string()))
}

fn parse_absolute_target(rest: &str, scheme: RequestScheme) -> (RequestScheme, String, u16, String) {
    let (host_port, path) = match rest.find(['/', '?']) {
        Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_host_and_port(host_port, scheme.default_port());
    (scheme, host, port, path)
}

fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some(stripped) = input.strip_prefix('[') {
        // [v6]:port
        if let Some((host, rest)) = stripped.split_once(']') {
            let port = rest
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), parsed);
        }
    }
    (input.to_string(), default_port)
}

/// Write the request line and headers for the upstream hop. Hop-by-hop proxy
/// headers are dropped and the upstream connection is always single-use.
pub(crate) async fn write_request_head<W>(
    writer: &mut W,
    request: &ParsedRequest,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("{} {} {}\r\n", request.method, request.path, request.version);
    let upgrade = request.is_websocket_upgrade();

    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Proxy-Connection")
            || name.eq_ignore_ascii_case("Proxy-Authorization")
            || name.eq_ignore_ascii_case("Keep-Alive")
            || name.eq_ignore_ascii_case("Connection")
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if upgrade {
        head.push_str("Connection: Upgrade\r\n");
    } else {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_absolute_form_request() {
        let raw = b"POST http://example.com:8081/submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = &raw[..];
        let req = read_http_request(&mut reader, RequestScheme::Http)
            .await
            .unwrap();

        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.scheme, RequestScheme::Http);
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8081);
        assert_eq!(req.path, "/submit?x=1");
        assert_eq!(req.body_kind, RequestBodyKind::ContentLength { length: 4 });
        assert_eq!(req.buffered_body, b"body");
        assert!(req.keep_alive());
    }

    #[tokio::test]
    async fn origin_form_uses_host_header_and_default_scheme() {
        let raw = b"GET /a HTTP/1.0\r\nHost: secure.test\r\n\r\n";
        let mut reader = &raw[..];
        let req = read_http_request(&mut reader, RequestScheme::Https)
            .await
            .unwrap();

        assert_eq!(req.scheme, RequestScheme::Https);
        assert_eq!(req.host, "secure.test");
        assert_eq!(req.port, 443);
        assert!(!req.keep_alive());
    }

    #[tokio::test]
    async fn connect_request_carries_authority() {
        let raw = b"CONNECT api.test:8443 HTTP/1.1\r\nHost: api.test:8443\r\n\r\n";
        let mut reader = &raw[..];
        let req = read_http_request(&mut reader, RequestScheme::Http)
            .await
            .unwrap();

        assert_eq!(req.method, HttpMethod::Connect);
        assert_eq!(req.host, "api.test");
        assert_eq!(req.port, 8443);
    }

    #[tokio::test]
    async fn oversized_request_body_is_rejected() {
        let raw = format!(
            "POST http://a.test/ HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_BODY_BYTES + 1
        );
        let mut reader = raw.as_bytes();
        let err = read_http_request(&mut reader, RequestScheme::Http)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RequestBodyTooLarge>().is_some());
    }

    #[tokio::test]
    async fn chunked_body_is_relayed_verbatim_and_captured_decoded() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let mut reader = &wire[..];
        let mut out = Vec::new();
        let mut capture = BodyCapture::new(MAX_BODY_CAPTURE_BYTES);

        let total = forward_chunked_body(Vec::new(), &mut reader, &mut out, &mut capture, None)
            .await
            .unwrap();

        assert_eq!(total, 9);
        assert_eq!(out, wire);
        assert_eq!(capture.into_option().unwrap(), b"Wikipedia");
    }

    #[tokio::test]
    async fn chunked_limit_is_enforced() {
        let wire = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut reader = &wire[..];
        let mut out = Vec::new();
        let mut capture = BodyCapture::new(16);

        let err = forward_chunked_body(Vec::new(), &mut reader, &mut out, &mut capture, Some(4))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RequestBodyTooLarge>().is_some());
    }

    #[tokio::test]
    async fn fixed_length_body_drains_buffer_first() {
        let mut reader = &b"lo world"[..];
        let mut buffered = b"hel".to_vec();
        let mut out = Vec::new();
        let mut capture = BodyCapture::new(4);

        forward_fixed_length_body(&mut reader, &mut out, &mut buffered, 5, &mut capture)
            .await
            .unwrap();

        assert_eq!(out, b"hello");
        assert!(buffered.is_empty());
        assert_eq!(capture.into_option().unwrap(), b"hell");
    }

    #[tokio::test]
    async fn request_head_drops_proxy_headers() {
        let raw = b"GET http://a.test/x HTTP/1.1\r\nHost: a.test\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\nAccept: */*\r\n\r\n";
        let mut reader = &raw[..];
        let req = read_http_request(&mut reader, RequestScheme::Http)
            .await
            .unwrap();

        let mut out = Vec::new();
        write_request_head(&mut out, &req).await.unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "GET /x HTTP/1.1\r\nHost: a.test\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn splits_bracketed_ipv6() {
        assert_eq!(split_host_and_port("[::1]:8080", 80), ("::1".into(), 8080));
        assert_eq!(split_host_and_port("[::1]", 443), ("::1".into(), 443));
        assert_eq!(split_host_and_port("host", 80), ("host".into(), 80));
    }
}
