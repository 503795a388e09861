use anyhow::Result;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus registry and handles for every gauge/counter/histogram the
/// engine updates: one struct owning a `Registry` plus typed handles, with a
/// `render()` producing the scrape response body directly.
pub struct CrawlerMetrics {
    registry: Registry,
    pub tasks_processed_total: IntCounterVec,
    pub tasks_in_progress: IntGauge,
    pub task_duration_seconds: Histogram,
    pub api_requests_total: IntCounterVec,
    pub api_request_duration_seconds: Histogram,
    pub items_crawled_total: IntCounterVec,
    pub circuit_breaker_state: IntGauge,
    pub rate_limit_waits_total: prometheus::IntCounter,
    pub adaptive_delay_seconds: prometheus::Gauge,
    pub queue_depth: IntGauge,
    pub auth_mode: IntGauge,
    pub auth_mode_switches_total: IntCounterVec,
    pub auth_consecutive_failures: IntGauge,
    pub dpop_key_age_seconds: prometheus::Gauge,
}

impl CrawlerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_processed_total = IntCounterVec::new(
            Opts::new("crawler_tasks_processed_total", "Tasks processed, by outcome"),
            &["status"],
        )?;
        let tasks_in_progress =
            IntGauge::new("crawler_tasks_in_progress", "Tasks currently being processed")?;
        let task_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("crawler_task_duration_seconds", "Task processing duration")
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let api_requests_total = IntCounterVec::new(
            Opts::new("crawler_api_requests_total", "Upstream search requests"),
            &["status", "endpoint"],
        )?;
        let api_request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "crawler_api_request_duration_seconds",
                "Upstream search request duration",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;
        let items_crawled_total = IntCounterVec::new(
            Opts::new("crawler_items_crawled_total", "Items parsed from search results"),
            &["status"],
        )?;
        let circuit_breaker_state = IntGauge::new(
            "crawler_circuit_breaker_state",
            "0=closed 1=half_open 2=open",
        )?;
        let rate_limit_waits_total = prometheus::IntCounter::new(
            "crawler_rate_limit_waits_total",
            "Times a task waited for a rate-limit token",
        )?;
        let adaptive_delay_seconds = prometheus::Gauge::new(
            "crawler_adaptive_delay_seconds",
            "Current per-process adaptive delay",
        )?;
        let queue_depth = IntGauge::new("crawler_queue_depth_tasks", "Depth of the task queue")?;
        let auth_mode = IntGauge::new("crawler_auth_mode", "0=http 1=browser")?;
        let auth_mode_switches_total = IntCounterVec::new(
            Opts::new("crawler_auth_mode_switches_total", "Auth mode transitions"),
            &["direction"],
        )?;
        let auth_consecutive_failures = IntGauge::new(
            "crawler_auth_consecutive_failures",
            "Consecutive auth failures in the current mode",
        )?;
        let dpop_key_age_seconds =
            prometheus::Gauge::new("crawler_dpop_key_age_seconds", "Age of the active DPoP key")?;

        for collector in [
            Box::new(tasks_processed_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tasks_in_progress.clone()),
            Box::new(task_duration_seconds.clone()),
            Box::new(api_requests_total.clone()),
            Box::new(api_request_duration_seconds.clone()),
            Box::new(items_crawled_total.clone()),
            Box::new(circuit_breaker_state.clone()),
            Box::new(rate_limit_waits_total.clone()),
            Box::new(adaptive_delay_seconds.clone()),
            Box::new(queue_depth.clone()),
            Box::new(auth_mode.clone()),
            Box::new(auth_mode_switches_total.clone()),
            Box::new(auth_consecutive_failures.clone()),
            Box::new(dpop_key_age_seconds.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            tasks_processed_total,
            tasks_in_progress,
            task_duration_seconds,
            api_requests_total,
            api_request_duration_seconds,
            items_crawled_total,
            circuit_breaker_state,
            rate_limit_waits_total,
            adaptive_delay_seconds,
            queue_depth,
            auth_mode,
            auth_mode_switches_total,
            auth_consecutive_failures,
            dpop_key_age_seconds,
        })
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(([("content-type", "text/plain; version=0.0.4")], buffer).into_response())
    }
}
