//! Default option values

use std::path::PathBuf;

pub const HOST: &str = "0.0.0.0";
pub const PORT: u16 = 8080;
pub const WS_HOST: &str = "0.0.0.0";
pub const WS_PORT: u16 = 9090;
pub const SERVER_KEY_LENGTH: u32 = 1024;
pub const CA_COMMON_NAME: &str = "Tapline Proxy CA";

/// `$HOME/.tapline/certs`, or a relative `.tapline/certs` without a home dir.
pub fn certs_dir() -> PathBuf {
    data_dir().join("certs")
}

/// Diagnostics go here while the terminal UI owns the tty.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tapline")
}
