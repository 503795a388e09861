use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::adaptive_delay::AdaptiveDelayer;
use crate::api_client::{ApiClient, BreakerState};
use crate::auth::Authenticator;
use crate::error::{ApiError, RateLimitError};
use crate::metrics::CrawlerMetrics;
use crate::models::{CrawlRequest, CrawlResponse, Item, ItemStatus};
use crate::queue::ReliableQueue;
use crate::rate_limiter::RateLimiterEngine;

const RATE_LIMIT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub redis: &'static str,
    pub circuit_breaker: &'static str,
    pub auth_mode: &'static str,
    pub auth_failures: u32,
    pub cooling_down: bool,
    pub active_tasks: usize,
    pub running: bool,
    pub adaptive_delay: f64,
    pub chrome_version: &'static str,
}

/// Bounded-concurrency task dispatcher: pops from the reliable queue, fans
/// each task out into concurrent on-sale/sold branches, and guarantees a
/// response is pushed and the task acked even on failure.
pub struct Engine {
    queue: Arc<ReliableQueue>,
    rate_limiter: Arc<dyn RateLimiterEngine>,
    adaptive: Arc<AdaptiveDelayer>,
    api_client: Arc<ApiClient>,
    authenticator: Arc<Authenticator>,
    metrics: Arc<CrawlerMetrics>,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    active_tasks: Arc<AtomicU64>,
    max_concurrent_tasks: usize,
    pop_timeout: f64,
    page_delay: Duration,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<ReliableQueue>,
        rate_limiter: Arc<dyn RateLimiterEngine>,
        adaptive: Arc<AdaptiveDelayer>,
        api_client: Arc<ApiClient>,
        authenticator: Arc<Authenticator>,
        metrics: Arc<CrawlerMetrics>,
        max_concurrent_tasks: usize,
        pop_timeout: f64,
    ) -> Self {
        Self {
            queue,
            rate_limiter,
            adaptive,
            api_client,
            authenticator,
            metrics,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
            running: Arc::new(AtomicBool::new(true)),
            active_tasks: Arc::new(AtomicU64::new(0)),
            max_concurrent_tasks,
            pop_timeout,
            page_delay: Duration::from_secs(2),
        }
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Installs signal handlers, spawns the metrics-refresh loop, and runs
    /// the main loop until shutdown. Already-spawned task bodies are not
    /// cancelled; they're given up to 30 s to drain.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let running = self.running.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
        });

        let metrics_handle = {
            let engine = self.clone();
            tokio::spawn(async move { engine.metrics_refresh_loop().await })
        };

        let mut tasks: JoinSet<()> = JoinSet::new();
        self.main_loop(&mut tasks).await;

        metrics_handle.abort();
        self.cleanup(tasks).await;
        Ok(())
    }

    async fn main_loop(&self, tasks: &mut JoinSet<()>) {
        while self.running.load(Ordering::SeqCst) {
            let popped = self.queue.pop_task(self.pop_timeout).await;
            let request = match popped {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "error popping task, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let engine = self.clone_for_task();
            self.active_tasks.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(async move {
                engine.process_task_wrapper(request).await;
            });
        }
    }

    fn clone_for_task(&self) -> TaskContext {
        TaskContext {
            queue: self.queue.clone(),
            rate_limiter: self.rate_limiter.clone(),
            adaptive: self.adaptive.clone(),
            api_client: self.api_client.clone(),
            metrics: self.metrics.clone(),
            semaphore: self.semaphore.clone(),
            active_tasks: self.active_tasks.clone(),
            page_delay: self.page_delay,
        }
    }

    async fn metrics_refresh_loop(&self) {
        let mut interval = tokio::time::interval(METRICS_REFRESH_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let snapshot = self.authenticator.snapshot().await;
            self.metrics
                .auth_mode
                .set(if snapshot.mode == "browser" { 1 } else { 0 });
            self.metrics
                .auth_consecutive_failures
                .set(snapshot.consecutive_failures as i64);
            self.metrics
                .dpop_key_age_seconds
                .set(self.authenticator.dpop_key_age_seconds().await);
            self.metrics
                .adaptive_delay_seconds
                .set(self.adaptive.current_delay().await.as_secs_f64());
            self.metrics.circuit_breaker_state.set(match self.api_client.breaker_state().await {
                BreakerState::Closed => 0,
                BreakerState::HalfOpen => 1,
                BreakerState::Open => 2,
            });
            if let Ok(depth) = self.queue.queue_depth().await {
                self.metrics.queue_depth.set(depth);
            }
        }
    }

    async fn cleanup(&self, mut tasks: JoinSet<()>) {
        let deadline = tokio::time::sleep(SHUTDOWN_DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let orphaned = tasks.len();
                    if orphaned > 0 {
                        warn!(orphaned, "shutdown drain timed out, abandoning in-flight tasks to the janitor");
                    }
                    break;
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
        }
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let auth = self.authenticator.snapshot().await;
        let breaker = self.api_client.breaker_state().await;
        let redis_ok = self.queue.health_check().await;
        let breaker_open = matches!(breaker, BreakerState::Open);
        let healthy = redis_ok && !breaker_open && !auth.cooling_down;

        HealthSnapshot {
            healthy,
            redis: if redis_ok { "ok" } else { "error" },
            circuit_breaker: match breaker {
                BreakerState::Closed => "closed",
                BreakerState::HalfOpen => "half_open",
                BreakerState::Open => "open",
            },
            auth_mode: auth.mode,
            auth_failures: auth.consecutive_failures,
            cooling_down: auth.cooling_down,
            active_tasks: self.active_tasks.load(Ordering::SeqCst) as usize,
            running: self.running.load(Ordering::SeqCst),
            adaptive_delay: self.adaptive.current_delay().await.as_secs_f64(),
            chrome_version: self.api_client.chrome_version().await,
        }
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }
}

/// The subset of engine state a spawned task body needs; split out so the
/// per-task future doesn't have to hold a reference to the whole `Engine`
/// (which also owns the `Authenticator`, used only by the metrics loop and
/// health snapshot).
struct TaskContext {
    queue: Arc<ReliableQueue>,
    rate_limiter: Arc<dyn RateLimiterEngine>,
    adaptive: Arc<AdaptiveDelayer>,
    api_client: Arc<ApiClient>,
    metrics: Arc<CrawlerMetrics>,
    semaphore: Arc<Semaphore>,
    active_tasks: Arc<AtomicU64>,
    page_delay: Duration,
}

impl TaskContext {
    async fn process_task_wrapper(self, request: CrawlRequest) {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        self.process_task(request).await;
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    async fn process_task(&self, request: CrawlRequest) {
        let start = Instant::now();
        self.metrics.tasks_in_progress.inc();

        let response = match self.rate_limiter.wait_for_token(RATE_LIMIT_WAIT_TIMEOUT).await {
            Err(RateLimitError::Timeout) => Some(self.error_response(&request, "Rate limit timeout")),
            Err(e) => Some(self.error_response(&request, &e.to_string())),
            Ok(()) => {
                self.adaptive.wait_adaptive().await;
                let (items, pages_crawled, error_message) = self.crawl_items(&request).await;
                Some(CrawlResponse {
                    ip_id: request.ip_id,
                    task_id: request.task_id.clone(),
                    crawled_at: chrono::Utc::now().timestamp(),
                    items,
                    total_found: 0,
                    error_message,
                    pages_crawled,
                    retry_count: request.retry_count,
                })
            }
        };

        self.metrics.tasks_in_progress.dec();
        self.metrics.task_duration_seconds.observe(start.elapsed().as_secs_f64());

        if let Some(mut response) = response {
            response.total_found = response.items.len() as u32;
            let status_label = if response.is_success() { "success" } else { "error" };
            self.metrics
                .tasks_processed_total
                .with_label_values(&[status_label])
                .inc();
            if let Err(e) = self.queue.push_result(&response).await {
                error!(error = %e, task_id = %request.task_id, "failed to push result");
            }
        }

        if let Err(e) = self.queue.ack_task(&request).await {
            error!(error = %e, task_id = %request.task_id, "failed to ack task");
        }
    }

    fn error_response(&self, request: &CrawlRequest, message: &str) -> CrawlResponse {
        CrawlResponse {
            ip_id: request.ip_id,
            task_id: request.task_id.clone(),
            crawled_at: chrono::Utc::now().timestamp(),
            items: vec![],
            total_found: 0,
            error_message: message.to_string(),
            pages_crawled: 0,
            retry_count: request.retry_count,
        }
    }

    /// Runs the on-sale and sold branches concurrently; errors inside one
    /// branch are contained to that branch's error string.
    async fn crawl_items(&self, request: &CrawlRequest) -> (Vec<Item>, u32, String) {
        let on_sale = self.crawl_branch(request, ItemStatus::OnSale, request.pages_on_sale, "on_sale");
        let sold = self.crawl_branch(request, ItemStatus::Sold, request.pages_sold, "sold");
        let (on_sale_result, sold_result) = tokio::join!(on_sale, sold);

        let (mut items, on_sale_pages, on_sale_error) = on_sale_result;
        let (sold_items, sold_pages, sold_error) = sold_result;
        items.extend(sold_items);

        let errors: Vec<String> = [on_sale_error, sold_error].into_iter().flatten().collect();
        (items, on_sale_pages + sold_pages, errors.join("; "))
    }

    async fn crawl_branch(
        &self,
        request: &CrawlRequest,
        status: ItemStatus,
        max_pages: u32,
        label: &'static str,
    ) -> (Vec<Item>, u32, Option<String>) {
        if max_pages == 0 {
            return (vec![], 0, None);
        }

        match self
            .api_client
            .search_all_pages(&request.keyword, status, max_pages, self.page_delay)
            .await
        {
            Ok((items, pages)) => {
                self.adaptive.on_success().await;
                self.metrics
                    .items_crawled_total
                    .with_label_values(&[label])
                    .inc_by(items.len() as u64);
                (items, pages, None)
            }
            Err(err) => {
                match &err {
                    ApiError::RateLimited => self.adaptive.on_rate_limit().await,
                    ApiError::Forbidden => self.adaptive.on_forbidden().await,
                    _ => self.adaptive.on_error().await,
                }
                (vec![], 0, Some(format!("{label}: {err}")))
            }
        }
    }
}
