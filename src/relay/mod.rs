//! Websocket transaction relay
//!
//! Transactions travel as JSON text frames. The server greets each peer with
//! a `hello` frame and then mirrors every transaction published on the local
//! bus; the client turns received `transaction` frames back into bus
//! publications.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::models::Transaction;

pub use client::RelayClient;
pub use server::{RelayForwarder, RelayServer};

/// One relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Hello { version: String },
    Transaction { transaction: Transaction },
}

impl RelayMessage {
    pub fn hello() -> Self {
        RelayMessage::Hello {
            version: crate::VERSION.to_string(),
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, HttpMethod};

    #[test]
    fn transaction_frames_are_tagged() {
        let mut exchange = Exchange::new(HttpMethod::Get, "https", "example.com", 443, "/", vec![]);
        exchange.detail.response_body = Some(b"hi".to_vec());
        let tx = exchange.finish(200, "OK");

        let text = RelayMessage::Transaction {
            transaction: tx.clone(),
        }
        .encode()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "transaction");
        assert_eq!(value["transaction"]["uri"], "https://example.com/");
        assert_eq!(value["transaction"]["detail"]["response_body"], "aGk=");

        match RelayMessage::decode(&text).unwrap() {
            RelayMessage::Transaction { transaction } => assert_eq!(transaction, tx),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn hello_carries_crate_version() {
        let text = RelayMessage::hello().encode().unwrap();
        assert_eq!(
            text,
            format!(r#"{{"type":"hello","version":"{}"}}"#, crate::VERSION)
        );
    }

    #[test]
    fn unknown_frames_fail_to_decode() {
        assert!(RelayMessage::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(RelayMessage::decode("not json").is_err());
    }
}
