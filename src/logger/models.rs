use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One observed request/response cycle.
///
/// This is the wire shape used identically on the live channel and in the
/// journal. A record is immutable once it leaves the middleware.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogRecord {
    pub timestamp: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub remote_addr: String,
    pub status_code: u16,
    pub duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Statistics>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connect_duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_lookup_duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_handshake_duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_byte_duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_latency: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub total_latency: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub connection_reused: bool,
}

/// Process-wide request counters, attached as a snapshot to every record at
/// the moment it is broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub start_time: DateTime<Utc>,
    pub last_request_time: DateTime<Utc>,
    pub status_code_counts: HashMap<u16, u64>,
    pub method_counts: HashMap<String, u64>,
}

impl Default for Statistics {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total_requests: 0,
            success_requests: 0,
            error_requests: 0,
            start_time: now,
            last_request_time: now,
            status_code_counts: HashMap::new(),
            method_counts: HashMap::new(),
        }
    }
}

/// Connection-phase timestamps captured by the forwarder's connector trace.
///
/// Phase fields are absent when the phase did not run: a reused connection
/// carries no DNS/connect/TLS instants, and plain-HTTP upstreams never set
/// the TLS pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTimings {
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_end: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub request_start: Option<Instant>,
    pub request_end: Option<Instant>,
    pub connection_reused: bool,
}

fn span(start: Option<Instant>, end: Option<Instant>) -> Option<Duration> {
    match (start, end) {
        (Some(s), Some(e)) if e >= s => Some(e - s),
        _ => None,
    }
}

impl ConnectionTimings {
    pub fn dns_duration(&self) -> Option<Duration> {
        span(self.dns_start, self.dns_end)
    }

    pub fn connect_duration(&self) -> Option<Duration> {
        span(self.connect_start, self.connect_end)
    }

    pub fn tls_duration(&self) -> Option<Duration> {
        span(self.tls_start, self.tls_end)
    }

    pub fn first_byte_duration(&self) -> Option<Duration> {
        span(self.request_start, self.first_byte)
    }

    pub fn upstream_duration(&self) -> Option<Duration> {
        span(self.request_start, self.request_end)
    }
}

/// Per-request metadata slot shared between the router, the forwarder and
/// the middleware. The router publishes the chosen target URL before the
/// forwarder runs, so the record carries it even when forwarding fails.
#[derive(Debug, Default)]
pub struct RequestMeta {
    pub target_url: String,
    pub timings: Option<ConnectionTimings>,
    /// Headers actually sent upstream, after route overrides
    pub sent_headers: Option<HashMap<String, String>>,
    /// Last forwarding error, when every attempt failed
    pub error: String,
}

pub type SharedRequestMeta = Arc<Mutex<RequestMeta>>;

/// Render a duration the way a person reads one: nanoseconds up through
/// seconds, one unit, no trailing zeros beyond the chosen precision.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.1}µs", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.1}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", nanos as f64 / 1_000_000_000.0)
    }
}

/// Wall-clock timestamp in the record's local-time format
pub fn record_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
