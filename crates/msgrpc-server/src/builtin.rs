//! Built-in observability methods.
//!
//! [`BuiltinDispatcher`] wraps the user dispatcher and answers two method
//! names itself before forwarding anything else:
//!
//! - **`_metrics`**: a [`MetricsSnapshot`](msgrpc_metrics::MetricsSnapshot)
//!   of transport and per-method counters
//! - **`_info`**: [`ServerInfo`] with server type, crate version and uptime

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{self, FutureExt};
use msgrpc_common::codec::Arguments;
use msgrpc_common::MessageId;
use msgrpc_metrics::{MetricsRegistry, ServerInfo};

use msgrpc_common::RpcError;
use rmpv::Value;
use serde::Serialize;

use crate::dispatch::{DispatchFuture, Dispatcher};

pub const METRICS_METHOD: &str = "_metrics";
pub const INFO_METHOD: &str = "_info";

/// Returns whether `method` is answered by [`BuiltinDispatcher`].
pub fn is_builtin(method: &str) -> bool {
    method == METRICS_METHOD || method == INFO_METHOD
}

/// Encodes `value` as a map keyed by field name.
///
/// Goes through `serde_json` so struct fields keep their names on the wire,
/// matching the JSON form of the same snapshot.
fn to_named_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    let json = serde_json::to_value(value)
        .map_err(|e| RpcError::unexpected(format!("snapshot cannot be encoded: {}", e)))?;
    Ok(from_json(json))
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::from(b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::from(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::from(k), from_json(v)))
                .collect(),
        ),
    }
}

/// Intercepts `_metrics` and `_info`, forwarding everything else.
pub struct BuiltinDispatcher {
    inner: Arc<dyn Dispatcher>,
    metrics: Arc<MetricsRegistry>,
    local_addr: Option<SocketAddr>,
}

impl BuiltinDispatcher {
    pub fn new(inner: Arc<dyn Dispatcher>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            inner,
            metrics,
            local_addr: None,
        }
    }

    /// Reports `addr` in `_info` responses.
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    fn info(&self) -> ServerInfo {
        ServerInfo::new(
            self.metrics.uptime_ms(),
            self.local_addr.map(|addr| addr.to_string()),
        )
    }
}

impl Dispatcher for BuiltinDispatcher {
    fn dispatch(&self, method: &str, message_id: Option<MessageId>, args: Arguments) -> DispatchFuture {
        match method {
            METRICS_METHOD => future::ready(to_named_value(&self.metrics.snapshot())).boxed(),
            INFO_METHOD => future::ready(to_named_value(&self.info())).boxed(),
            _ => self.inner.dispatch(method, message_id, args),
        }
    }
}
