use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crawl_worker::adaptive_delay::AdaptiveDelayer;
use crawl_worker::api_client::ApiClient;
use crawl_worker::auth::{Authenticator, UnavailableBrowserCapture};
use crawl_worker::config::Settings;
use crawl_worker::engine::Engine;
use crawl_worker::http::{health_router, metrics_router};
use crawl_worker::metrics::CrawlerMetrics;
use crawl_worker::queue::ReliableQueue;
use crawl_worker::rate_limiter::{GlobalRateLimiter, RateLimiterEngine};

const NAMESPACE: &str = "animetop";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args().nth(1);
    let settings = Settings::load(config_path.as_deref()).context("loading configuration")?;

    if let Err(e) = run(settings).await {
        tracing::error!(error = %e, "crawl worker exited with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    info!(
        redis = %settings.redis.addr,
        max_concurrent_tasks = settings.crawler.max_concurrent_tasks,
        "starting crawl worker"
    );

    let redis_client = redis::Client::open(settings.redis.connection_url())
        .context("building redis client")?;
    let connection_manager = redis_client
        .get_connection_manager()
        .await
        .context("connecting to redis")?;

    let queue = Arc::new(ReliableQueue::new(connection_manager.clone(), NAMESPACE));

    let rate_limiter: Arc<dyn RateLimiterEngine> = Arc::new(GlobalRateLimiter::new(
        connection_manager,
        NAMESPACE,
        settings.rate_limit.rate,
        settings.rate_limit.burst,
    ));

    let authenticator = Arc::new(Authenticator::new(
        Box::new(UnavailableBrowserCapture),
        settings.token.max_age_minutes,
    ));
    let api_client = Arc::new(ApiClient::new(authenticator.clone()));
    let adaptive = Arc::new(AdaptiveDelayer::new());
    let metrics = Arc::new(CrawlerMetrics::new().context("building metrics registry")?);

    let engine = Arc::new(Engine::new(
        queue,
        rate_limiter,
        adaptive,
        api_client,
        authenticator,
        metrics.clone(),
        settings.crawler.max_concurrent_tasks,
        settings.crawler.pop_timeout,
    ));

    let health_addr = format!("0.0.0.0:{}", settings.health.port);
    let metrics_addr = format!("0.0.0.0:{}", settings.metrics.port);

    let health_listener = tokio::net::TcpListener::bind(&health_addr)
        .await
        .with_context(|| format!("binding health server on {health_addr}"))?;
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("binding metrics server on {metrics_addr}"))?;

    let health_app = health_router(engine.clone());
    let metrics_app = metrics_router(metrics);
    let health_server = tokio::spawn(async move { axum::serve(health_listener, health_app).await });
    let metrics_server = tokio::spawn(async move { axum::serve(metrics_listener, metrics_app).await });

    info!(health_addr, metrics_addr, "health and metrics servers listening");

    engine.run().await.context("engine loop")?;

    health_server.abort();
    metrics_server.abort();

    info!("crawl worker shut down cleanly");
    Ok(())
}
