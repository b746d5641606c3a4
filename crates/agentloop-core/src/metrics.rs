use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct AgentMetrics {
    runs: Counter<u64>,
    duration_ms: Histogram<f64>,
    iterations: Histogram<u64>,
    tool_calls: Counter<u64>,
}

static METRICS: OnceCell<AgentMetrics> = OnceCell::new();

fn handles() -> &'static AgentMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("agentloop.agent");
        AgentMetrics {
            runs: meter
                .u64_counter("agent_runs_total")
                .with_description("Total orchestration runs by termination path")
                .init(),
            duration_ms: meter
                .f64_histogram("agent_run_duration_ms")
                .with_description("Orchestration run time in milliseconds")
                .init(),
            iterations: meter
                .u64_histogram("agent_iterations")
                .with_description("Reasoning loop iterations per run")
                .init(),
            tool_calls: meter
                .u64_counter("tool_calls_total")
                .with_description("Tool invocations by tool and status")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("AGENTLOOP_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            service = service_name,
            "AGENTLOOP_OTEL_METRICS_ENDPOINT detected; install an OTLP meter provider to export agent metrics"
        );
    }
}

/// Record one finished run (no-op if no provider installed).
pub fn record_run(termination: &str, duration_ms: u64, iterations: usize, plan_used: bool) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("termination", termination.to_string()),
        KeyValue::new("plan_used", plan_used),
    ];

    metrics.runs.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);
    metrics.iterations.record(iterations as u64, &attrs);
}

pub fn record_tool_call(tool: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    handles().tool_calls.add(
        1,
        &[
            KeyValue::new("tool", tool.to_string()),
            KeyValue::new("status", status),
        ],
    );
}
