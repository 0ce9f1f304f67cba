//! Process-wide request metrics
//!
//! A single mutex-guarded accumulator. Writers hold the lock only long
//! enough to bump counters; [`MetricsCollector::snapshot`] copies out a
//! serializable view.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// Invocations kept for the "recent requests" view.
pub const HISTORY_CAPACITY: usize = 1000;
/// Invocations shown in a snapshot.
pub const RECENT_IN_SNAPSHOT: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InvocationRecord {
    pub tool: String,
    pub duration_ms: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct ToolStats {
    count: u64,
    errors: u64,
    total_ms: f64,
    min_ms: Option<f64>,
    max_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolMetrics {
    pub count: u64,
    pub errors: u64,
    pub success_rate_percent: f64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub start_time: DateTime<Utc>,
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub success_rate_percent: f64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub active_connections: u64,
    pub tools: BTreeMap<String, ToolMetrics>,
    pub recent: Vec<InvocationRecord>,
}

impl MetricsSnapshot {
    /// Healthy while at least 95% of tool calls succeed, or before any call.
    pub fn is_healthy(&self) -> bool {
        self.total_requests == 0 || self.success_rate_percent > 95.0
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    total_errors: u64,
    rate_limited: u64,
    auth_failures: u64,
    active_connections: u64,
    tools: BTreeMap<String, ToolStats>,
    history: VecDeque<InvocationRecord>,
}

pub struct MetricsCollector {
    start_time: DateTime<Utc>,
    started: Instant,
    counters: Mutex<Counters>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record_invocation(&self, tool: &str, duration_ms: f64, success: bool) {
        let mut c = self.lock();
        c.total_requests += 1;
        if !success {
            c.total_errors += 1;
        }

        let stats = c.tools.entry(tool.to_string()).or_default();
        stats.count += 1;
        if !success {
            stats.errors += 1;
        }
        stats.total_ms += duration_ms;
        stats.min_ms = Some(stats.min_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        stats.max_ms = stats.max_ms.max(duration_ms);

        if c.history.len() == HISTORY_CAPACITY {
            c.history.pop_front();
        }
        c.history.push_back(InvocationRecord {
            tool: tool.to_string(),
            duration_ms,
            success,
            timestamp: Utc::now(),
        });
    }

    pub fn record_rate_limited(&self) {
        self.lock().rate_limited += 1;
    }

    pub fn record_auth_failure(&self) {
        self.lock().auth_failures += 1;
    }

    /// Adjust the live connection gauge. Never drops below zero.
    pub fn record_connection(&self, delta: i64) {
        let mut c = self.lock();
        c.active_connections = if delta >= 0 {
            c.active_connections.saturating_add(delta as u64)
        } else {
            c.active_connections.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.lock();

        let tools = c
            .tools
            .iter()
            .map(|(name, s)| {
                let avg_ms = if s.count > 0 { s.total_ms / s.count as f64 } else { 0.0 };
                (
                    name.clone(),
                    ToolMetrics {
                        count: s.count,
                        errors: s.errors,
                        success_rate_percent: success_rate(s.count, s.errors),
                        total_ms: round3(s.total_ms),
                        avg_ms: round3(avg_ms),
                        min_ms: round3(s.min_ms.unwrap_or(0.0)),
                        max_ms: round3(s.max_ms),
                    },
                )
            })
            .collect();

        let skip = c.history.len().saturating_sub(RECENT_IN_SNAPSHOT);
        let recent = c.history.iter().skip(skip).cloned().collect();

        MetricsSnapshot {
            start_time: self.start_time,
            uptime_secs: self.uptime_secs(),
            total_requests: c.total_requests,
            total_errors: c.total_errors,
            success_rate_percent: success_rate(c.total_requests, c.total_errors),
            rate_limited: c.rate_limited,
            auth_failures: c.auth_failures,
            active_connections: c.active_connections,
            tools,
            recent,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn success_rate(count: u64, errors: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let rate = (count - errors) as f64 / count as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
