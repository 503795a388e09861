use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::error::ApiError;
use crate::models::{Item, ItemStatus, SearchResult};
use crate::request_template::{build_request_body, ITEMS_PER_PAGE};

const SEARCH_URL: &str = "https://api.mercari.jp/v2/entities:search";
const FINGERPRINT_ROTATION_INTERVAL: u32 = 50;
const CIRCUIT_FAIL_MAX: u32 = 5;
const CIRCUIT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

const CHROME_VERSIONS: &[&str] = &["chrome120", "chrome119", "chrome116", "chrome110"];
const ACCEPT_LANGUAGES: &[&str] = &[
    "ja-JP,ja;q=0.9",
    "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
    "ja,en-US;q=0.9,en;q=0.8",
    "ja-JP,en-US;q=0.8,en;q=0.6",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Count-based-open, time-based-half-open circuit breaker. No corpus crate
/// provides a ready-made one for async `reqwest` calls, so this mirrors the
/// teacher's mutex-guarded state-struct idiom instead of fabricating a
/// dependency.
struct CircuitBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn state(&self) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(since) => {
                if since.elapsed() >= CIRCUIT_RESET_TIMEOUT {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn on_failure(&mut self) {
        match self.state() {
            // A half-open probe failed: re-open immediately and restart the
            // reset timer, rather than leaving `opened_at` at its original
            // (already-elapsed) value, which would otherwise read as
            // half-open forever.
            BreakerState::HalfOpen => {
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= CIRCUIT_FAIL_MAX {
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

struct Fingerprint {
    chrome_version: &'static str,
    accept_language: &'static str,
}

fn random_fingerprint() -> Fingerprint {
    let mut rng = rand::thread_rng();
    Fingerprint {
        chrome_version: CHROME_VERSIONS.choose(&mut rng).copied().unwrap_or(CHROME_VERSIONS[0]),
        accept_language: ACCEPT_LANGUAGES.choose(&mut rng).copied().unwrap_or(ACCEPT_LANGUAGES[0]),
    }
}

struct Session {
    client: Client,
    fingerprint: Fingerprint,
}

/// Owns one reusable HTTP session (standing in for a TLS-fingerprinted
/// Chrome profile) and a circuit breaker, and performs single/multi-page
/// searches against the upstream endpoint.
pub struct ApiClient {
    authenticator: Arc<Authenticator>,
    session: Mutex<Session>,
    success_count: AtomicU32,
    breaker: Mutex<CircuitBreaker>,
    search_url: String,
}

impl ApiClient {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self::with_search_url(authenticator, SEARCH_URL.to_string())
    }

    /// Same as [`ApiClient::new`] but targeting an arbitrary search
    /// endpoint, for pointing at a stub server in tests.
    pub fn with_search_url(authenticator: Arc<Authenticator>, search_url: String) -> Self {
        let fingerprint = random_fingerprint();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default config");

        Self {
            authenticator,
            session: Mutex::new(Session { client, fingerprint }),
            success_count: AtomicU32::new(0),
            breaker: Mutex::new(CircuitBreaker::new()),
            search_url,
        }
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().await.state()
    }

    pub async fn chrome_version(&self) -> &'static str {
        self.session.lock().await.fingerprint.chrome_version
    }

    async fn maybe_rotate_fingerprint(&self) {
        let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
        if is_rotation_point(count) {
            let mut guard = self.session.lock().await;
            let fingerprint = random_fingerprint();
            let client = Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default config");
            debug!(chrome_version = fingerprint.chrome_version, "rotating TLS fingerprint");
            *guard = Session { client, fingerprint };
        }
    }

    /// A single page of search results. Fails fast with `CircuitOpen` if the
    /// breaker is open, without touching the authenticator or the network.
    pub async fn search(
        &self,
        keyword: &str,
        status: ItemStatus,
        page_token: Option<&str>,
    ) -> Result<SearchResult, ApiError> {
        {
            let breaker = self.breaker.lock().await;
            if breaker.state() == BreakerState::Open {
                return Err(ApiError::CircuitOpen);
            }
        }

        match self.search_with_retry(keyword, status, page_token).await {
            Ok(result) => {
                self.breaker.lock().await.on_success();
                Ok(result)
            }
            Err(err) => {
                if !matches!(err, ApiError::CircuitOpen) {
                    self.breaker.lock().await.on_failure();
                }
                Err(err)
            }
        }
    }

    async fn search_with_retry(
        &self,
        keyword: &str,
        status: ItemStatus,
        page_token: Option<&str>,
    ) -> Result<SearchResult, ApiError> {
        let mut attempt = 0u32;
        loop {
            match self.do_search(keyword, status, page_token).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < 3 => {
                    let backoff = Duration::from_secs_f64((5.0 * 2f64.powi(attempt as i32)).min(300.0));
                    warn!(attempt, error = %err, "retrying after transient transport error");
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn do_search(
        &self,
        keyword: &str,
        status: ItemStatus,
        page_token: Option<&str>,
    ) -> Result<SearchResult, ApiError> {
        self.maybe_rotate_fingerprint().await;

        let (mut headers, cookies) = self
            .authenticator
            .get_auth_headers(&self.search_url, "POST")
            .await
            .map_err(|e| {
                warn!(error = %e, "authenticator failed to produce headers");
                ApiError::Status(0)
            })?;

        let accept_language = {
            let guard = self.session.lock().await;
            guard.fingerprint.accept_language.to_string()
        };
        headers.insert("accept-language".to_string(), accept_language);

        let device_uuid = self.authenticator.get_device_uuid().await;
        let session_id = self.authenticator.get_session_id().await;
        let body = build_request_body(
            keyword,
            status,
            &session_id,
            &device_uuid,
            page_token.unwrap_or(""),
            ITEMS_PER_PAGE,
        );

        let client = {
            let guard = self.session.lock().await;
            guard.client.clone()
        };

        let mut request = client.post(&self.search_url).json(&body);
        for (k, v) in &headers {
            request = request.header(k.as_str(), v.as_str());
        }
        for (k, v) in &cookies {
            request = request.header("cookie", format!("{k}={v}"));
        }

        let response = request.send().await?;
        let status_code = response.status().as_u16();

        if status_code == 200 {
            let parsed: Value = response.json().await?;
            self.authenticator.on_success().await;
            return Ok(parse_response(&parsed, status));
        }

        self.authenticator.on_failure(status_code).await;
        Err(ApiError::from_status(status_code))
    }

    /// Crawls successive pages until the upstream stops returning a next
    /// page token or `max_pages` is reached; stops early (keeping whatever
    /// was accumulated so far) if a page fails.
    pub async fn search_all_pages(
        &self,
        keyword: &str,
        status: ItemStatus,
        max_pages: u32,
        page_delay: Duration,
    ) -> Result<(Vec<Item>, u32), ApiError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages_crawled = 0u32;

        for page in 0..max_pages {
            let result = self
                .search(keyword, status, page_token.as_deref())
                .await;
            let result = match result {
                Ok(r) => r,
                Err(err) => {
                    if pages_crawled == 0 {
                        return Err(err);
                    }
                    break;
                }
            };

            items.extend(result.items);
            pages_crawled += 1;

            if !result.has_next || result.next_page_token.is_empty() {
                break;
            }
            page_token = Some(result.next_page_token);

            if page + 1 < max_pages {
                sleep(page_delay).await;
            }
        }

        Ok((items, pages_crawled))
    }
}

fn is_rotation_point(count: u32) -> bool {
    count % FINGERPRINT_ROTATION_INTERVAL == 0
}

fn image_url(raw: &Value) -> String {
    if let Some(url) = raw
        .get("thumbnails")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_str())
    {
        return url.to_string();
    }
    if let Some(url) = raw.get("thumbnail").and_then(|v| v.as_str()) {
        return url.to_string();
    }
    if let Some(url) = raw.get("imageUrl").and_then(|v| v.as_str()) {
        return url.to_string();
    }
    String::new()
}

fn parse_response(body: &Value, status: ItemStatus) -> SearchResult {
    let mut items = Vec::new();
    if let Some(raw_items) = body.get("items").and_then(|v| v.as_array()) {
        for raw in raw_items {
            let source_id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if source_id.is_empty() {
                continue;
            }
            let title = raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let price = raw.get("price").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            items.push(Item {
                item_url: format!("https://jp.mercari.com/item/{source_id}"),
                image_url: image_url(raw),
                source_id,
                title,
                price,
                status,
            });
        }
    }

    let meta = body.get("meta");
    let next_page_token = meta
        .and_then(|m| m.get("nextPageToken"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let total_count = meta
        .and_then(|m| m.get("numFound"))
        .and_then(|v| v.as_u64())
        .unwrap_or(items.len() as u64) as u32;

    SearchResult {
        has_next: !next_page_token.is_empty(),
        next_page_token,
        total_count,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_url_prefers_thumbnails_then_thumbnail_then_image_url() {
        let with_thumbnails = serde_json::json!({"thumbnails": ["a.jpg"], "thumbnail": "b.jpg"});
        assert_eq!(image_url(&with_thumbnails), "a.jpg");

        let with_thumbnail = serde_json::json!({"thumbnail": "b.jpg", "imageUrl": "c.jpg"});
        assert_eq!(image_url(&with_thumbnail), "b.jpg");

        let with_image_url = serde_json::json!({"imageUrl": "c.jpg"});
        assert_eq!(image_url(&with_image_url), "c.jpg");

        let with_nothing = serde_json::json!({});
        assert_eq!(image_url(&with_nothing), "");
    }

    #[test]
    fn parse_response_drops_items_with_empty_source_id() {
        let body = serde_json::json!({
            "items": [
                {"id": "", "name": "dropped", "price": 1},
                {"id": "ok", "name": "kept", "price": 500},
            ],
            "meta": {"numFound": 2}
        });
        let result = parse_response(&body, ItemStatus::OnSale);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].source_id, "ok");
        assert_eq!(result.items[0].item_url, "https://jp.mercari.com/item/ok");
    }

    #[tokio::test]
    async fn breaker_opens_after_five_consecutive_failures() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn fingerprint_rotates_exactly_on_the_interval() {
        for count in 1..150 {
            assert_eq!(is_rotation_point(count), count % 50 == 0, "count={count}");
        }
    }

    #[tokio::test]
    async fn breaker_closes_on_success() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.on_failure();
        }
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn a_failed_half_open_probe_reopens_the_breaker() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Simulate the reset timeout elapsing without waiting for it.
        breaker.opened_at = Some(Instant::now() - CIRCUIT_RESET_TIMEOUT);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
