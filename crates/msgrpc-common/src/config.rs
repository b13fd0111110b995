//! Transport configuration.
//!
//! [`TransportConfig`] is shared by the client and server transports. It is
//! serde-serializable so hosts can load it from their own configuration
//! files; durations are written as milliseconds and a missing or `null`
//! timeout means the phase is never timed out.
//!
//! # Example
//!
//! ```
//! use msgrpc_common::config::TransportConfig;
//! use std::time::Duration;
//!
//! let config = TransportConfig::new()
//!     .with_max_connections(10)
//!     .with_execution_timeout(Some(Duration::from_secs(5)));
//! assert!(config.validate().is_ok());
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::ParserLimits;
use crate::pool::PoolLimits;
use crate::protocol::{MsgRpcError, Result};
use crate::watchdog::TimeoutBudgets;

/// Address family preferred when resolving or binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    Any,
    V4,
    V6,
}

impl IpVersion {
    /// Orders `addrs` so addresses of the preferred family come first.
    pub fn order(self, mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        match self {
            IpVersion::Any => {}
            IpVersion::V4 => addrs.sort_by_key(|addr| !addr.is_ipv4()),
            IpVersion::V6 => addrs.sort_by_key(|addr| !addr.is_ipv6()),
        }
        addrs
    }
}

/// Options recognized by the client and server transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connections kept ready (client pool) or prewarmed (server sessions).
    pub min_connections: usize,
    /// Upper bound on concurrent connections.
    pub max_connections: usize,
    /// Request and response contexts prewarmed per pool.
    pub min_contexts: usize,
    /// Upper bound on borrowed request or response contexts.
    pub max_contexts: usize,
    #[serde(with = "optional_millis")]
    pub receive_timeout: Option<Duration>,
    #[serde(with = "optional_millis")]
    pub send_timeout: Option<Duration>,
    #[serde(with = "optional_millis")]
    pub execution_timeout: Option<Duration>,
    /// Quota on the declared length of a params array.
    pub max_arguments_length: u32,
    /// Quota on the encoded size of one inbound frame.
    pub max_message_length: usize,
    /// Number of concurrent accept loops.
    pub accept_concurrency: usize,
    pub preferred_ip_version: IpVersion,
    #[serde(with = "millis")]
    pub watchdog_interval: Duration,
    /// Include debug detail in error responses.
    pub debug_mode: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            min_connections: 1,
            max_connections: 100,
            min_contexts: 16,
            max_contexts: 256,
            receive_timeout: Some(Duration::from_secs(30)),
            send_timeout: Some(Duration::from_secs(30)),
            execution_timeout: None,
            max_arguments_length: 1024,
            max_message_length: 16 * 1024 * 1024,
            accept_concurrency: 4,
            preferred_ip_version: IpVersion::Any,
            watchdog_interval: Duration::from_millis(100),
            debug_mode: false,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self.min_connections = self.min_connections.min(max);
        self
    }

    pub fn with_contexts(mut self, min: usize, max: usize) -> Self {
        self.min_contexts = min;
        self.max_contexts = max;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_arguments_length(mut self, max: u32) -> Self {
        self.max_arguments_length = max;
        self
    }

    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    pub fn with_accept_concurrency(mut self, concurrency: usize) -> Self {
        self.accept_concurrency = concurrency;
        self
    }

    pub fn with_preferred_ip_version(mut self, version: IpVersion) -> Self {
        self.preferred_ip_version = version;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Checks the configuration for inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns `MsgRpcError::Config` if:
    /// - a minimum exceeds its maximum
    /// - a maximum, a quota or the accept concurrency is zero
    /// - the watchdog interval or a finite timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MsgRpcError::Config("max_connections must be greater than zero".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(MsgRpcError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_contexts == 0 {
            return Err(MsgRpcError::Config("max_contexts must be greater than zero".into()));
        }
        if self.min_contexts > self.max_contexts {
            return Err(MsgRpcError::Config(format!(
                "min_contexts ({}) exceeds max_contexts ({})",
                self.min_contexts, self.max_contexts
            )));
        }
        if self.max_arguments_length == 0 {
            return Err(MsgRpcError::Config(
                "max_arguments_length must be greater than zero".into(),
            ));
        }
        if self.max_message_length == 0 {
            return Err(MsgRpcError::Config(
                "max_message_length must be greater than zero".into(),
            ));
        }
        if self.accept_concurrency == 0 {
            return Err(MsgRpcError::Config(
                "accept_concurrency must be greater than zero".into(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(MsgRpcError::Config(
                "watchdog_interval must be greater than zero".into(),
            ));
        }
        for (name, timeout) in [
            ("receive_timeout", self.receive_timeout),
            ("send_timeout", self.send_timeout),
            ("execution_timeout", self.execution_timeout),
        ] {
            if timeout.is_some_and(|t| t.is_zero()) {
                return Err(MsgRpcError::Config(format!(
                    "{} must be greater than zero; leave it unset for no timeout",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_arguments_length: self.max_arguments_length,
            max_message_length: self.max_message_length,
        }
    }

    pub fn timeout_budgets(&self) -> TimeoutBudgets {
        TimeoutBudgets {
            receive: self.receive_timeout,
            send: self.send_timeout,
            execute: self.execution_timeout,
        }
    }

    pub fn connection_limits(&self) -> PoolLimits {
        PoolLimits::new(self.min_connections, self.max_connections)
    }

    pub fn context_limits(&self) -> PoolLimits {
        PoolLimits::new(self.min_contexts, self.max_contexts)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
