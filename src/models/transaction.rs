//! HTTP Transaction model
//!
//! Represents a single HTTP request/response pair observed by the proxy engine
//! (or surfaced over a relay connection). A [`Transaction`] is immutable once
//! built; in-flight exchanges are tracked with [`Exchange`] and sealed with
//! [`Exchange::finish`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP methods
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
    /// Any other token, kept verbatim (upper-cased)
    Extension(String),
}

impl HttpMethod {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            other => HttpMethod::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Extension(token) => token,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for HttpMethod {
    fn from(value: String) -> Self {
        HttpMethod::parse(&value)
    }
}

impl From<HttpMethod> for String {
    fn from(value: HttpMethod) -> Self {
        value.as_str().to_string()
    }
}

/// Timing information for an HTTP transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTiming {
    /// When the request started (milliseconds since epoch)
    pub start_time: i64,
    /// Upstream connect duration in ms (TCP + TLS)
    pub connect_ms: Option<u32>,
    /// Time to first byte (waiting) in ms
    pub waiting_ms: Option<u32>,
    /// Total duration in ms
    pub total_ms: Option<u32>,
}

impl Default for TransactionTiming {
    fn default() -> Self {
        Self {
            start_time: Utc::now().timestamp_millis(),
            connect_ms: None,
            waiting_ms: None,
            total_ms: None,
        }
    }
}

/// Full request/response detail. Consumed by UI collaborators; the session
/// itself only looks at the summary fields of [`Transaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetail {
    /// Request scheme (http or https)
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Request path (including query string)
    pub path: String,
    /// HTTP version (e.g., "HTTP/1.1")
    pub http_version: String,
    pub request_headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub request_body: Option<Vec<u8>>,
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub response_body: Option<Vec<u8>>,
    /// Response size in bytes, as seen on the wire
    pub response_size: Option<u64>,
    pub timing: TransactionTiming,
    /// Free-form annotation (e.g. "Upstream connection failed")
    pub notes: Option<String>,
}

/// A completed request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier for this transaction
    pub id: String,
    pub method: HttpMethod,
    pub uri: String,
    pub response_code: u16,
    pub response_message: String,
    pub detail: TransactionDetail,
}

impl Transaction {
    /// The single-line summary used by the session logger.
    pub fn summary_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.method, self.uri, self.response_code, self.response_message
        )
    }

    /// Get duration as formatted string
    pub fn duration_str(&self) -> String {
        match self.detail.timing.total_ms {
            Some(ms) if ms < 1000 => format!("{}ms", ms),
            Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
            None => "-".to_string(),
        }
    }

    /// Get size as formatted string
    pub fn size_str(&self) -> String {
        match self.detail.response_size {
            Some(size) if size < 1024 => format!("{}B", size),
            Some(size) if size < 1024 * 1024 => format!("{:.1}KB", size as f64 / 1024.0),
            Some(size) => format!("{:.1}MB", size as f64 / (1024.0 * 1024.0)),
            None => "-".to_string(),
        }
    }
}

/// An exchange in progress. The engine fills in the detail as the request is
/// forwarded and the response read back, then seals it into a [`Transaction`].
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pub method: HttpMethod,
    pub detail: TransactionDetail,
}

impl Exchange {
    pub fn new(
        method: HttpMethod,
        scheme: &str,
        host: &str,
        port: u16,
        path: &str,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            detail: TransactionDetail {
                scheme: scheme.to_string(),
                host: host.to_string(),
                port,
                path: path.to_string(),
                http_version: "HTTP/1.1".to_string(),
                request_headers: headers,
                request_body: None,
                response_headers: Vec::new(),
                response_body: None,
                response_size: None,
                timing: TransactionTiming::default(),
                notes: None,
            },
        }
    }

    /// Get the full URL
    pub fn full_url(&self) -> String {
        let d = &self.detail;
        let port_str = if (d.scheme == "https" && d.port == 443) || (d.scheme == "http" && d.port == 80)
        {
            String::new()
        } else {
            format!(":{}", d.port)
        };
        if d.host.contains(':') {
            format!("{}://[{}]{}{}", d.scheme, d.host, port_str, d.path)
        } else {
            format!("{}://{}{}{}", d.scheme, d.host, port_str, d.path)
        }
    }

    pub fn finish(self, response_code: u16, response_message: impl Into<String>) -> Transaction {
        let uri = self.full_url();
        Transaction {
            id: self.id,
            method: self.method,
            uri,
            response_code,
            response_message: response_message.into(),
            detail: self.detail,
        }
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Exchange {
        Exchange::new(
            HttpMethod::Get,
            "http",
            "example.com",
            80,
            "/index.html?q=1",
            vec![("Host".into(), "example.com".into())],
        )
    }

    #[test]
    fn full_url_omits_default_ports() {
        assert_eq!(sample().full_url(), "http://example.com/index.html?q=1");

        let mut exchange = sample();
        exchange.detail.scheme = "https".into();
        exchange.detail.port = 8443;
        assert_eq!(exchange.full_url(), "https://example.com:8443/index.html?q=1");
    }

    #[test]
    fn summary_line_matches_logger_format() {
        let tx = sample().finish(404, "Not Found");
        assert_eq!(
            tx.summary_line(),
            "GET http://example.com/index.html?q=1 404 Not Found"
        );
    }

    #[test]
    fn unknown_methods_are_preserved() {
        let method = HttpMethod::parse("propfind");
        assert_eq!(method, HttpMethod::Extension("PROPFIND".into()));
        assert_eq!(method.to_string(), "PROPFIND");
    }

    #[test]
    fn bodies_travel_as_base64_in_json() {
        let mut exchange = sample();
        exchange.detail.response_body = Some(b"hello".to_vec());
        let tx = exchange.finish(200, "OK");

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["detail"]["response_body"], "aGVsbG8=");
        assert!(json["detail"]["request_body"].is_null());

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
