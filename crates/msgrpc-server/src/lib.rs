//! msgrpc Server
//!
//! This crate provides the server side of the msgrpc MessagePack-RPC
//! transport: connection acceptance, one session per connection, method
//! dispatch and graceful shutdown.
//!
//! # Architecture
//!
//! - [`RpcServer`]: builder-configured facade
//! - [`ServerTransportManager`]: listener, accept loops and the session set
//! - [`ServerSession`]: reader and writer tasks for one connection
//! - [`Dispatcher`] / [`MethodRegistry`]: method name to code
//! - [`BuiltinDispatcher`]: `_metrics` and `_info`
//!
//! # Example
//!
//! ```no_run
//! use msgrpc_common::codec::Arguments;
//! use msgrpc_common::RpcError;
//! use msgrpc_server::RpcServer;
//! use rmpv::Value;
//!
//! # async fn run() -> msgrpc_common::Result<()> {
//! let server = RpcServer::builder()
//!     .method("add", |mut args: Arguments| async move {
//!         let a: i64 = args.next()?;
//!         let b: i64 = args.next()?;
//!         a.checked_add(b)
//!             .map(Value::from)
//!             .ok_or_else(|| RpcError::call_error("overflow"))
//!     })
//!     .bind("0.0.0.0:18000")
//!     .await?;
//! # server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod dispatch;
pub mod manager;
pub mod server;
pub mod session;

pub use builtin::BuiltinDispatcher;
pub use dispatch::{to_value, DispatchFuture, Dispatcher, MethodRegistry, RpcMethod};
pub use manager::{bind_listener, ServerTransportManager};
pub use server::{RpcServer, RpcServerBuilder};
pub use session::ServerSession;
