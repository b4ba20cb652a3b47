//! # Tapline
//!
//! An intercepting HTTP(S) proxy session. A session listens as a proxy (and
//! can mirror what it sees to websocket peers) or attaches to another
//! session's relay, and fans every observed transaction out to its logger,
//! an optional UI and the relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ ProxyEngine  │   │ RelayClient  │   producers (one per session)
//! └──────┬───────┘   └──────┬───────┘
//!        └────────┬─────────┘
//!            ┌────▼─────┐
//!            │ EventBus │  frozen subscriber list
//!            └────┬─────┘
//!     ┌───────────┼──────────────┐
//! ┌───▼────┐  ┌───▼───┐  ┌───────▼────────┐
//! │ Logger │  │  UI   │  │ RelayForwarder │──▶ RelayServer ──▶ ws peers
//! └────────┘  └───────┘  └────────────────┘
//! ```

pub mod cli;
pub mod config;
pub mod events;
pub mod logging;
pub mod models;
pub mod platform;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transport;
pub mod ui;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
