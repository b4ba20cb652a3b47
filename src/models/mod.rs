//! Data models shared by the engine, the relay and the UIs

pub mod transaction;

pub use transaction::*;
