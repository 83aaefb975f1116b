/// Prometheus metrics for the `GET /metrics` surface: HTTP request
/// counters/latency and agent lifecycle counters, exposed for scraping
/// alongside the JSON `GET /api/stats` endpoint (which reads `Store` directly
/// rather than these gauges).
use crate::errors::{DaemonError, DaemonResult};
use prometheus::{Counter, CounterVec, Histogram, HistogramVec, IntGauge, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;

pub struct MetricsCollector {
    registry: Registry,

    pub http_requests_total: CounterVec,
    pub http_request_duration: HistogramVec,
    pub http_request_errors: Counter,

    pub agents_started_total: Counter,
    pub agents_stopped_total: Counter,
    pub agents_restarted_total: Counter,
    pub agents_running: IntGauge,

    server_start: Instant,
}

impl MetricsCollector {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("agentd_http_requests_total", "Total HTTP requests handled"),
            &["method", "path", "status"],
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(http_requests_total.clone()))
            .map_err(prometheus_err)?;

        let http_request_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "agentd_http_request_duration_seconds",
                "HTTP request latency",
            ),
            &["method", "path"],
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(http_request_duration.clone()))
            .map_err(prometheus_err)?;

        let http_request_errors = Counter::new(
            "agentd_http_request_errors_total",
            "Total HTTP requests that returned a 4xx/5xx status",
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(http_request_errors.clone()))
            .map_err(prometheus_err)?;

        let agents_started_total = Counter::new(
            "agentd_agents_started_total",
            "Total successful agent start operations, including auto-restarts",
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(agents_started_total.clone()))
            .map_err(prometheus_err)?;

        let agents_stopped_total =
            Counter::new("agentd_agents_stopped_total", "Total agent stop operations")
                .map_err(prometheus_err)?;
        registry
            .register(Box::new(agents_stopped_total.clone()))
            .map_err(prometheus_err)?;

        let agents_restarted_total = Counter::new(
            "agentd_agents_restarted_total",
            "Total agent restarts triggered by an unexpected process exit",
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(agents_restarted_total.clone()))
            .map_err(prometheus_err)?;

        let agents_running = IntGauge::new(
            "agentd_agents_running",
            "Agents currently in the running state",
        )
        .map_err(prometheus_err)?;
        registry
            .register(Box::new(agents_running.clone()))
            .map_err(prometheus_err)?;

        Ok(MetricsCollector {
            registry,
            http_requests_total,
            http_request_duration,
            http_request_errors,
            agents_started_total,
            agents_stopped_total,
            agents_restarted_total,
            agents_running,
            server_start: Instant::now(),
        })
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, path])
            .observe(duration_secs);
        if status >= 400 {
            self.http_request_errors.inc();
        }
    }

    pub fn record_agent_started(&self) {
        self.agents_started_total.inc();
        self.agents_running.inc();
    }

    pub fn record_agent_stopped(&self) {
        self.agents_stopped_total.inc();
        self.agents_running.dec();
    }

    pub fn record_agent_restarted(&self) {
        self.agents_restarted_total.inc();
    }

    pub fn uptime_secs(&self) -> u64 {
        self.server_start.elapsed().as_secs()
    }

    /// Renders the registry in Prometheus text exposition format for
    /// `GET /metrics`.
    pub fn gather(&self) -> DaemonResult<String> {
        use prometheus::Encoder;
        let families = self.registry.gather();
        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(prometheus_err)?;
        String::from_utf8(buf).map_err(|e| DaemonError::Internal(e.to_string()))
    }
}

fn prometheus_err(e: prometheus::Error) -> DaemonError {
    DaemonError::Internal(format!("metrics error: {e}"))
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("metrics registration is infallible for a fixed, non-duplicated metric set")
    }
}

pub type SharedMetrics = Arc<MetricsCollector>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_registered_metric_names() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request("GET", "/api/agents", 200, 0.01);
        let text = metrics.gather().unwrap();
        assert!(text.contains("agentd_http_requests_total"));
    }

    #[test]
    fn agent_lifecycle_counters_track_running_gauge() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_agent_started();
        assert_eq!(metrics.agents_running.get(), 1);
        metrics.record_agent_stopped();
        assert_eq!(metrics.agents_running.get(), 0);
    }
}
