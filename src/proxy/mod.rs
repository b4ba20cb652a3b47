//! HTTP/HTTPS intercepting proxy
//!
//! The engine that produces every locally observed transaction.

pub mod cert_manager;
pub(crate) mod http1;
pub mod server;

pub use cert_manager::{CertManager, CertOptions};
pub use server::ProxyEngine;

/// Construction options for [`ProxyEngine`]; identical to the CA inputs.
pub type EngineOptions = CertOptions;
