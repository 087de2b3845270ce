//! # hprose-client
//!
//! Rust client for the hprose RPC protocol.
//!
//! The crate has three layers:
//!
//! - **Codec** ([`codec`]): the compact tagged serialization format, with
//!   reference tracking, class descriptors and a type registry
//! - **Engine** ([`Client`]): named calls with retry, endpoint fail-over,
//!   batching, one-way calls, topic subscriptions and middleware
//! - **Transports** ([`transport`]): HTTP, WebSocket and raw TCP/TLS sockets
//!   in half-duplex or full-duplex mode
//!
//! ## Example
//!
//! ```no_run
//! use hprose_client::{Client, Value};
//!
//! #[tokio::main]
//! async fn main() -> hprose_client::Result<()> {
//!     let client = Client::builder()
//!         .uri("tcp://127.0.0.1:4321")
//!         .full_duplex(true)
//!         .idempotent(true)
//!         .build()?;
//!
//!     let reply = client.invoke("hello", vec![Value::from("world")]).await?;
//!     println!("{reply:?}");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod client;
mod pending;
mod topic;
mod writer;

pub use client::{BatchResult, Client, ClientBuilder, FailswitchCallback, MAX_RETRY_INTERVAL};
pub use codec::{Formatter, HproseClass, Object, Value};
pub use config::Settings;
pub use error::{Error, Result};
pub use handler::{
    BatchOptions, Call, ErrorCallback, Filter, InvokeContext, InvokeOptions, Reply,
    SuccessCallback,
};
pub use pending::Pending;
pub use protocol::ResultMode;
pub use topic::{SubscribeOptions, TopicCallback};
pub use transport::Transport;
