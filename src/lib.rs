pub mod adaptive_delay;
pub mod api_client;
pub mod auth;
pub mod config;
pub mod dpop;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod rate_limiter;
pub mod request_template;
