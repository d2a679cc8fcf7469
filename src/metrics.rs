// Prometheus metrics for the operator terminal
//
// Exposed on the /metrics HTTP endpoint when enabled:
// - Active terminal sessions (gauge)
// - Commands run, by command and outcome (counter)
// - Command durations, by delivery mode (histogram)
// - Rejected requests, by reason (counter)
// - Outbound messages and write failures (counter)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Session metrics
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "terminal_sessions_active",
        "Number of currently connected terminal sessions"
    ).expect("Failed to create sessions active metric");

    // Command metrics
    pub static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("terminal_commands_total", "Total number of commands executed"),
        &["command", "outcome"]
    ).expect("Failed to create commands total metric");

    pub static ref COMMAND_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("terminal_command_duration_seconds", "Command duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["mode"]
    ).expect("Failed to create command duration metric");

    pub static ref COMMANDS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("terminal_commands_rejected_total", "Total number of rejected command requests"),
        &["reason"]
    ).expect("Failed to create commands rejected metric");

    // Transport metrics
    pub static ref MESSAGES_SENT_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("terminal_messages_sent_total", "Total number of messages written to operators"),
        &["kind"]
    ).expect("Failed to create messages sent metric");

    pub static ref SEND_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "terminal_send_failures_total",
        "Total number of failed writes that ended a session"
    ).expect("Failed to create send failures metric");
}

static INIT: Once = Once::new();

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| result = register_all());
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_SENT_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SEND_FAILURES_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
