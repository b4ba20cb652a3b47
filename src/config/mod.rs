//! Configuration resolution
//!
//! Turns the flat [`RawOptions`] produced by the CLI into a validated,
//! immutable [`Configuration`]. Resolution is a pure function of its inputs.

pub mod defaults;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use http::Uri;
use thiserror::Error;

use crate::ui::UiRegistry;

/// Unvalidated option values, one field per CLI flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOptions {
    pub log: bool,
    pub host: String,
    pub port: i64,
    pub ws_client: Option<String>,
    pub ws_server: bool,
    pub ws_host: String,
    pub ws_port: i64,
    pub ws_app: Option<String>,
    pub certs_dir: PathBuf,
    pub server_key_length: i64,
    pub ca_common_name: String,
    pub ui: Option<String>,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            log: false,
            host: defaults::HOST.to_string(),
            port: i64::from(defaults::PORT),
            ws_client: None,
            ws_server: false,
            ws_host: defaults::WS_HOST.to_string(),
            ws_port: i64::from(defaults::WS_PORT),
            ws_app: None,
            certs_dir: defaults::certs_dir(),
            server_key_length: i64::from(defaults::SERVER_KEY_LENGTH),
            ca_common_name: defaults::CA_COMMON_NAME.to_string(),
            ui: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },
    #[error("ui mode '{mode}' is not available in this build")]
    UnsupportedUiMode { mode: UiMode },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfiguration {
        field,
        reason: reason.into(),
    }
}

/// The topology requested by the user, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportIntent {
    /// Listening proxy only
    Direct,
    /// Connect outward to a relay; no local proxy listener
    RelayClient { target: Uri },
    /// Listening proxy plus a websocket server mirroring its transactions
    RelayServerAdditive { ws_host: String, ws_port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WsApp {
    None,
    HttpView,
}

impl FromStr for WsApp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(WsApp::None),
            "httpview" => Ok(WsApp::HttpView),
            other => Err(invalid(
                "ws_app",
                format!("'{other}' is not one of: httpview"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiMode {
    None,
    Terminal,
    TextOnly,
}

impl fmt::Display for UiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UiMode::None => f.write_str("none"),
            UiMode::Terminal => f.write_str("terminal"),
            UiMode::TextOnly => f.write_str("text"),
        }
    }
}

impl FromStr for UiMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(UiMode::None),
            "terminal" | "tui" => Ok(UiMode::Terminal),
            "text" | "text-only" => Ok(UiMode::TextOnly),
            other => Err(invalid(
                "ui",
                format!("'{other}' is not one of: none, terminal, text"),
            )),
        }
    }
}

/// Validated session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub host: String,
    pub port: u16,
    pub log_enabled: bool,
    pub certs_dir: PathBuf,
    pub server_key_length: u32,
    pub ca_common_name: String,
    pub transport: TransportIntent,
    pub ws_app: WsApp,
    pub ui_mode: UiMode,
}

impl Configuration {
    pub fn resolve(raw: &RawOptions, capabilities: &UiRegistry) -> Result<Self, ConfigError> {
        let host = non_empty("host", &raw.host)?;
        let port = checked_port("port", raw.port)?;
        let ca_common_name = non_empty("ca_common_name", &raw.ca_common_name)?;
        let server_key_length = u32::try_from(raw.server_key_length)
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                invalid(
                    "server_key_length",
                    format!("{} is not a positive key length", raw.server_key_length),
                )
            })?;

        let ws_app = raw.ws_app.as_deref().unwrap_or("").parse::<WsApp>()?;
        let ui_mode = raw.ui.as_deref().unwrap_or("").trim().parse::<UiMode>()?;
        let ws_client = raw
            .ws_client
            .as_deref()
            .map(str::trim)
            .filter(|target| !target.is_empty());

        let transport = match (ws_client, raw.ws_server) {
            (Some(_), true) => {
                return Err(invalid(
                    "ws_client",
                    "relay client and relay server cannot be enabled together",
                ))
            }
            (Some(target), false) => TransportIntent::RelayClient {
                target: relay_target(target)?,
            },
            (None, true) => TransportIntent::RelayServerAdditive {
                ws_host: non_empty("ws_host", &raw.ws_host)?,
                ws_port: checked_port("ws_port", raw.ws_port)?,
            },
            (None, false) => TransportIntent::Direct,
        };

        if ws_app != WsApp::None && !matches!(transport, TransportIntent::RelayServerAdditive { .. }) {
            return Err(invalid("ws_app", "requires the relay server (--ws-server)"));
        }

        if ui_mode != UiMode::None && !capabilities.is_available(ui_mode) {
            return Err(ConfigError::UnsupportedUiMode { mode: ui_mode });
        }

        Ok(Self {
            host,
            port,
            log_enabled: raw.log,
            certs_dir: raw.certs_dir.clone(),
            server_key_length,
            ca_common_name,
            transport,
            ws_app,
            ui_mode,
        })
    }

    pub fn ws_client_target(&self) -> Option<&Uri> {
        match &self.transport {
            TransportIntent::RelayClient { target } => Some(target),
            _ => None,
        }
    }

    pub fn ws_server_enabled(&self) -> bool {
        matches!(self.transport, TransportIntent::RelayServerAdditive { .. })
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Port 0 is accepted and means "let the OS pick".
fn checked_port(field: &'static str, value: i64) -> Result<u16, ConfigError> {
    u16::try_from(value).map_err(|_| invalid(field, format!("{value} is outside 0-65535")))
}

fn relay_target(raw: &str) -> Result<Uri, ConfigError> {
    let uri = raw
        .parse::<Uri>()
        .map_err(|err| invalid("ws_client", format!("'{raw}' is not a valid URI: {err}")))?;
    match (uri.scheme_str(), uri.host()) {
        (Some("ws" | "wss"), Some(_)) => Ok(uri),
        _ => Err(invalid(
            "ws_client",
            format!("'{raw}' must be an absolute ws:// or wss:// URI"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> UiRegistry {
        UiRegistry::text_only()
    }

    fn resolve(raw: &RawOptions) -> Result<Configuration, ConfigError> {
        Configuration::resolve(raw, &registry())
    }

    #[test]
    fn defaults_resolve_to_direct_proxy() {
        let config = resolve(&RawOptions::default()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport, TransportIntent::Direct);
        assert_eq!(config.ws_app, WsApp::None);
        assert_eq!(config.ui_mode, UiMode::None);
        assert!(!config.log_enabled);
        assert!(config.ws_client_target().is_none());
        assert!(!config.ws_server_enabled());
    }

    #[test]
    fn client_and_server_together_are_rejected() {
        let raw = RawOptions {
            ws_client: Some("ws://example/relay".into()),
            ws_server: true,
            ..RawOptions::default()
        };
        assert!(matches!(
            resolve(&raw),
            Err(ConfigError::InvalidConfiguration { field: "ws_client", .. })
        ));
    }

    #[test]
    fn empty_client_target_means_unset() {
        let raw = RawOptions {
            ws_client: Some("  ".into()),
            ws_server: true,
            ..RawOptions::default()
        };
        let config = resolve(&raw).unwrap();
        assert!(config.ws_server_enabled());
    }

    #[test]
    fn relay_client_target_is_parsed() {
        let raw = RawOptions {
            ws_client: Some("ws://example/relay".into()),
            ..RawOptions::default()
        };
        let config = resolve(&raw).unwrap();
        let target = config.ws_client_target().unwrap();
        assert_eq!(target.host(), Some("example"));
        assert_eq!(target.path(), "/relay");
    }

    #[test]
    fn relay_client_target_requires_ws_scheme() {
        for bad in ["http://example/relay", "example/relay", "ws:///nohost"] {
            let raw = RawOptions {
                ws_client: Some(bad.into()),
                ..RawOptions::default()
            };
            assert!(
                matches!(resolve(&raw), Err(ConfigError::InvalidConfiguration { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn ports_outside_range_are_rejected() {
        for (port, ws_port) in [(65536, 9090), (-1, 9090), (8080, 70000)] {
            let raw = RawOptions {
                port,
                ws_port,
                ws_server: true,
                ..RawOptions::default()
            };
            assert!(matches!(
                resolve(&raw),
                Err(ConfigError::InvalidConfiguration { .. })
            ));
        }
    }

    #[test]
    fn port_zero_requests_os_assignment() {
        let raw = RawOptions {
            port: 0,
            ..RawOptions::default()
        };
        assert_eq!(resolve(&raw).unwrap().port, 0);
    }

    #[test]
    fn ws_app_outside_choices_is_rejected() {
        let raw = RawOptions {
            ws_server: true,
            ws_app: Some("browser".into()),
            ..RawOptions::default()
        };
        assert!(matches!(
            resolve(&raw),
            Err(ConfigError::InvalidConfiguration { field: "ws_app", .. })
        ));
    }

    #[test]
    fn ws_app_requires_relay_server() {
        let raw = RawOptions {
            ws_app: Some("httpview".into()),
            ..RawOptions::default()
        };
        assert!(resolve(&raw).is_err());

        let raw = RawOptions {
            ws_server: true,
            ..raw
        };
        assert_eq!(resolve(&raw).unwrap().ws_app, WsApp::HttpView);
    }

    #[test]
    fn unavailable_ui_mode_fails_at_resolution() {
        let raw = RawOptions {
            ui: Some("terminal".into()),
            ..RawOptions::default()
        };
        assert_eq!(
            resolve(&raw),
            Err(ConfigError::UnsupportedUiMode {
                mode: UiMode::Terminal
            })
        );

        let raw = RawOptions {
            ui: Some("text".into()),
            ..raw
        };
        assert_eq!(resolve(&raw).unwrap().ui_mode, UiMode::TextOnly);
    }

    #[test]
    fn unknown_ui_mode_is_invalid() {
        let raw = RawOptions {
            ui: Some("gtk".into()),
            ..RawOptions::default()
        };
        assert!(matches!(
            resolve(&raw),
            Err(ConfigError::InvalidConfiguration { field: "ui", .. })
        ));
    }

    #[test]
    fn key_length_must_be_positive() {
        for len in [0, -2048, i64::from(u32::MAX) + 1] {
            let raw = RawOptions {
                server_key_length: len,
                ..RawOptions::default()
            };
            assert!(resolve(&raw).is_err(), "{len} should be rejected");
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let raw = RawOptions {
            log: true,
            port: 3128,
            ws_server: true,
            ws_port: 9191,
            ws_app: Some("httpview".into()),
            ui: Some("text".into()),
            ..RawOptions::default()
        };
        assert_eq!(resolve(&raw).unwrap(), resolve(&raw).unwrap());
    }
}
