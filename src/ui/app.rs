//! External viewer apps fed by the relay server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::WsApp;
use crate::platform;

const HTTPVIEW_BASE: &str = "https://httpview.secapps.com/#feedURI=";

/// Websocket URL a local browser should use to reach the relay server.
pub fn relay_feed_url(bound: SocketAddr) -> String {
    let reachable = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), bound.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), bound.port()),
        _ => bound,
    };
    format!("ws://{reachable}")
}

pub fn app_url(app: WsApp, relay_addr: SocketAddr) -> Option<String> {
    match app {
        WsApp::None => None,
        WsApp::HttpView => Some(format!("{HTTPVIEW_BASE}{}", relay_feed_url(relay_addr))),
    }
}

/// Open `app` in the system browser. Failures are logged; the session goes on.
pub fn launch(app: WsApp, relay_addr: SocketAddr) {
    let Some(url) = app_url(app, relay_addr) else {
        return;
    };
    match platform::open_url(&url) {
        Ok(()) => tracing::info!("Opened {}", url),
        Err(e) => tracing::warn!("Could not open {}: {:#}", url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn httpview_points_at_reachable_relay() {
        assert_eq!(
            app_url(WsApp::HttpView, "0.0.0.0:9090".parse().unwrap()).as_deref(),
            Some("https://httpview.secapps.com/#feedURI=ws://127.0.0.1:9090")
        );
        assert_eq!(
            app_url(WsApp::HttpView, "[::]:9091".parse().unwrap()).as_deref(),
            Some("https://httpview.secapps.com/#feedURI=ws://[::1]:9091")
        );
        assert_eq!(app_url(WsApp::None, "10.0.0.2:9090".parse().unwrap()), None);
    }

    #[test]
    fn specific_bind_addresses_are_kept() {
        assert_eq!(
            relay_feed_url("192.168.1.5:9090".parse().unwrap()),
            "ws://192.168.1.5:9090"
        );
    }
}
