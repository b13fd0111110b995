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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server information returned by the `_info` built-in method
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_type: String,
    pub version: String,
    pub uptime_ms: u64,
    pub local_addr: Option<String>,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64, local_addr: Option<String>) -> Self {
        Self {
            server_type: "msgrpc".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
            local_addr,
        }
    }
}

/// Metrics for a specific RPC method
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Transport-level counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportMetrics {
    pub accepted_sessions: u64,
    pub active_sessions: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub notifications: u64,
    pub protocol_errors: u64,
    pub quota_errors: u64,
    pub receive_timeouts: u64,
    pub send_timeouts: u64,
    pub execution_timeouts: u64,
    pub connection_resets: u64,
}

/// Complete metrics snapshot returned by the `_metrics` built-in method
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub uptime_ms: u64,
    pub transport: TransportMetrics,
    pub methods: HashMap<String, MethodMetrics>,
}
