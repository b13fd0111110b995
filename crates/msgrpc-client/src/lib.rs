//! msgrpc Client
//!
//! Client side of the msgrpc transport.
//!
//! # Components
//!
//! - [`transport`] - one multiplexed connection with call correlation,
//!   timeouts and graceful shutdown
//! - [`pool`] - per-address connection pooling
//! - [`client`] - the high-level [`RpcClient`]
//!
//! # Example
//!
//! ```no_run
//! use msgrpc_client::RpcClient;
//! use msgrpc_common::config::TransportConfig;
//! use rmpv::Value;
//!
//! # async fn example() -> msgrpc_common::Result<()> {
//! let client = RpcClient::new("127.0.0.1:18800", TransportConfig::default()).await?;
//! let sum: i64 = client.call_typed("add", vec![Value::from(1), Value::from(2)]).await?;
//! assert_eq!(sum, 3);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod pool;
pub mod transport;

pub use client::{PendingCall, RpcClient};
pub use pool::{ConnectionPool, PoolConfig, PooledTransport};
pub use transport::{connect_stream, ClientTransport};
