// Copyright 2025 msgrpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! msgrpc Metrics Collection
//!
//! Thread-safe counters for msgrpc transports: session and frame counts,
//! protocol errors, timeouts and per-method call statistics with latency
//! percentiles.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters plus an `RwLock`-guarded
//!   per-method table
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Built-in Monitoring Methods
//!
//! Servers can expose the registry through two built-in RPC methods:
//!
//! - **`_metrics`**: returns a [`MetricsSnapshot`]
//! - **`_info`**: returns [`ServerInfo`] with server type, version and uptime
//!
//! # Usage Example
//!
//! ```rust
//! use msgrpc_metrics::MetricsRegistry;
//! use std::time::Instant;
//!
//! let registry = MetricsRegistry::new();
//! let start = Instant::now();
//! // ... dispatch a call ...
//! registry.record_call("my_method", start, true);
//!
//! let snapshot = registry.snapshot();
//! println!("Total requests: {}", snapshot.total_requests);
//! ```

mod registry;
mod snapshot;

pub use registry::{MetricsConfig, MetricsRegistry, TimeoutKind, OVERFLOW_METHOD};
pub use snapshot::{MethodMetrics, MetricsSnapshot, ServerInfo, TransportMetrics};
