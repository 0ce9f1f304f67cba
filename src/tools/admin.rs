//! Server introspection tools: system info, echo, metrics, health

use crate::mcp::protocol::ToolsCallResult;
use crate::metrics::MetricsCollector;
use crate::registry::{
    handler_fn, InputSchema, PropertyType, ToolContext, ToolDescriptor, ToolError, ToolProvider, ToolResult,
};
use crate::session::SessionStore;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct AdminTools {
    metrics: Arc<MetricsCollector>,
    sessions: Arc<SessionStore>,
}

impl AdminTools {
    pub fn new(metrics: Arc<MetricsCollector>, sessions: Arc<SessionStore>) -> Self {
        Self { metrics, sessions }
    }
}

impl ToolProvider for AdminTools {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        let (metrics, sessions) = (self.metrics.clone(), self.sessions.clone());
        let system_info_tool = ToolDescriptor::new(
            "get_system_info",
            "Get system information and server status",
            InputSchema::empty(),
            handler_fn(move |_args, ctx| {
                let (metrics, sessions) = (metrics.clone(), sessions.clone());
                async move { system_info(&metrics, &sessions, &ctx) }
            }),
        );

        let echo_tool = ToolDescriptor::new(
            "echo",
            "Echo a message with client metadata and timestamps",
            InputSchema::empty().required("message", PropertyType::String, "Message to echo"),
            handler_fn(|args, ctx| async move { echo(&args, &ctx) }),
        );

        let metrics = self.metrics.clone();
        let metrics_tool = ToolDescriptor::new(
            "get_metrics",
            "Get server performance metrics and statistics",
            InputSchema::empty(),
            handler_fn(move |_args, _ctx| {
                let metrics = metrics.clone();
                async move { to_result(ToolsCallResult::json(&metrics.snapshot())) }
            }),
        );

        let (metrics, sessions) = (self.metrics.clone(), self.sessions.clone());
        let health_tool = ToolDescriptor::new(
            "health_check",
            "Perform a health check of the server",
            InputSchema::empty(),
            handler_fn(move |_args, _ctx| {
                let (metrics, sessions) = (metrics.clone(), sessions.clone());
                async move { health_check(&metrics, &sessions) }
            }),
        );

        vec![system_info_tool, echo_tool, metrics_tool, health_tool]
    }
}

fn to_result(result: Result<ToolsCallResult, serde_json::Error>) -> ToolResult {
    result.map_err(|e| ToolError::Internal(format!("failed to render result: {}", e)))
}

fn echo(args: &Value, ctx: &ToolContext) -> ToolResult {
    let message = crate::tools::required_str(args, "message")?;
    Ok(ToolsCallResult::text(format!(
        "Echo: {}\nTimestamp: {}\nClient: {}\nRequest count: {}",
        message,
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ctx.session.remote_address,
        ctx.session.request_count,
    )))
}

fn system_info(metrics: &MetricsCollector, sessions: &SessionStore, ctx: &ToolContext) -> ToolResult {
    let snapshot = metrics.snapshot();
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let text = format!(
        "System Information\n\
         \n\
         Platform: {os} ({arch})\n\
         Process ID: {pid}\n\
         Working directory: {cwd}\n\
         Server version: {version}\n\
         \n\
         Server Status\n\
         Current time: {now}\n\
         Uptime: {uptime}\n\
         Active connections: {active}\n\
         Total tool calls: {total}\n\
         \n\
         Client\n\
         Address: {remote}\n\
         Connected: {connected}\n\
         Requests made: {requests}\n\
         Authenticated: {authenticated}",
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        pid = std::process::id(),
        cwd = cwd,
        version = env!("CARGO_PKG_VERSION"),
        now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        uptime = format_uptime(snapshot.uptime_secs),
        active = sessions.active_count(),
        total = snapshot.total_requests,
        remote = ctx.session.remote_address,
        connected = ctx.session.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        requests = ctx.session.request_count,
        authenticated = ctx.session.authenticated,
    );
    Ok(ToolsCallResult::text(text))
}

fn health_check(metrics: &MetricsCollector, sessions: &SessionStore) -> ToolResult {
    let snapshot = metrics.snapshot();
    let healthy = snapshot.is_healthy();
    let overall = if healthy { "healthy" } else { "degraded" };

    let report = json!({
        "overall": overall,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "checks": {
            "success_rate": {
                "status": if healthy { "healthy" } else { "warning" },
                "value": format!("{}%", snapshot.success_rate_percent),
                "requests": snapshot.total_requests,
                "threshold": "95%",
            },
            "process": {
                "status": "healthy",
                "pid": std::process::id(),
                "uptime_secs": snapshot.uptime_secs,
            },
            "sessions": {
                "status": "healthy",
                "active": sessions.active_count(),
            },
        },
    });
    to_result(ToolsCallResult::json(&report))
}

fn format_uptime(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}
