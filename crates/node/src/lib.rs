//! # ctxwire Node Library
//!
//! Runtime side of the ctxwire protocol: expose local objects to connected
//! peers and call the objects they expose.
//!
//! ## Overview
//!
//! - **Contexts**: local objects implementing [`Context`], or assembled
//!   from closures with [`ContextBuilder`]
//! - **Dispatch**: capability-checked access through a [`Dispatcher`]
//! - **Connections**: request/reply correlation by stream id, timeouts and
//!   close draining
//! - **Router**: handshake, attach/detach, GET/SET serving and peer
//!   bookkeeping
//! - **Transport**: drives a connection over any tokio byte stream
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Router                         │
//! │   contexts ── Dispatcher ── Context (local object)   │
//! │   peers ───── Connection ── awaiters by stream id    │
//! ├──────────────────────────────────────────────────────┤
//! │          Transport (reader task / writer task)       │
//! ├──────────────────────────────────────────────────────┤
//! │          TCP stream / in-memory duplex               │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use node::{transport, ContextBuilder, Router, RouterConfig};
//! use protocol::Value;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let router = Router::new(RouterConfig::default());
//!     let greeter = ContextBuilder::new("greeter")
//!         .sync_method("hello", |_| Ok(Value::from("hello")))
//!         .build();
//!     router.attach_context("greeter", greeter).await?;
//!
//!     let peer = transport::connect_tcp(&router, "127.0.0.1:8642", Duration::from_secs(10)).await?;
//!     let system = router.interface(peer, "system")?;
//!     println!("{:?}", system.call("ping", vec![]).await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`context`]: The `Context` trait and `ContextBuilder`
//! - [`dispatcher`]: Capability-checked dispatch
//! - [`connection`]: One link to one peer
//! - [`router`]: Connection and exposure management
//! - [`interface`]: Handles for remote contexts
//! - [`transport`]: Byte-stream and TCP adapters

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod interface;
pub mod router;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionConfig, ConnectionStatus, RequestHandler, Role};
pub use context::{BoxFuture, Context, ContextBuilder, FnContext, Output};
pub use dispatcher::Dispatcher;
pub use interface::RemoteContext;
pub use router::{Router, RouterConfig, RouterEvent};
pub use transport::{TransportHandle, TransportOptions};
