use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dpop::DPoPSigner;
use crate::error::AuthError;

const FALLBACK_THRESHOLD: u32 = 3;
const RECOVERY_INTERVAL: Duration = Duration::from_secs(300);
const KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(900);
const COOLDOWN_AFTER_403: Duration = Duration::from_secs(60);

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Http,
    Browser,
}

#[derive(Debug, Clone, Default)]
pub struct BrowserAuth {
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub search_session_id: String,
    pub laplace_device_uuid: String,
    pub captured_at: Option<Instant>,
}

impl BrowserAuth {
    fn is_valid(&self, max_age: Duration) -> bool {
        match self.captured_at {
            Some(t) => t.elapsed() < max_age,
            None => false,
        }
    }
}

/// External collaborator that captures a real browser session. The actual
/// driver (headless browser automation) lives outside this process; this
/// trait is the seam the engine calls through.
#[async_trait]
pub trait BrowserCapture: Send + Sync {
    async fn capture(&self, keyword: &str) -> Result<BrowserAuth, AuthError>;
}

/// A `BrowserCapture` that always fails. Used as the production default
/// when no real browser-automation collaborator has been wired in.
pub struct UnavailableBrowserCapture;

#[async_trait]
impl BrowserCapture for UnavailableBrowserCapture {
    async fn capture(&self, _keyword: &str) -> Result<BrowserAuth, AuthError> {
        Err(AuthError::CapturationFailed(
            "no browser capture collaborator configured".to_string(),
        ))
    }
}

#[derive(Debug, Default, Clone)]
pub struct AuthStateSnapshot {
    pub mode: &'static str,
    pub consecutive_failures: u32,
    pub total_http_requests: u64,
    pub total_browser_fallbacks: u64,
    pub mode_switches: u64,
    pub cooling_down: bool,
}

struct Inner {
    mode: AuthMode,
    signer: Option<DPoPSigner>,
    browser_auth: Option<BrowserAuth>,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    cooldown_until: Option<Instant>,
    total_http_requests: u64,
    total_browser_fallbacks: u64,
    mode_switches: u64,
}

/// Dual-mode authenticator: prefers cheap self-signed DPoP headers, falls
/// back to headless-browser-captured credentials after sustained failure,
/// and recovers back to the cheap path after a quiet period.
pub struct Authenticator {
    inner: Mutex<Inner>,
    browser_capture: Box<dyn BrowserCapture>,
    user_agent: &'static str,
    max_browser_auth_age: Duration,
}

impl Authenticator {
    pub fn new(browser_capture: Box<dyn BrowserCapture>, max_browser_auth_age_minutes: u64) -> Self {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        Self {
            inner: Mutex::new(Inner {
                mode: AuthMode::Http,
                signer: None,
                browser_auth: None,
                consecutive_failures: 0,
                last_failure_time: None,
                cooldown_until: None,
                total_http_requests: 0,
                total_browser_fallbacks: 0,
                mode_switches: 0,
            }),
            browser_capture,
            user_agent,
            max_browser_auth_age: Duration::from_secs(max_browser_auth_age_minutes * 60),
        }
    }

    pub async fn mode(&self) -> AuthMode {
        self.inner.lock().await.mode
    }

    pub async fn is_cooling_down(&self) -> bool {
        match self.inner.lock().await.cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    pub async fn snapshot(&self) -> AuthStateSnapshot {
        let guard = self.inner.lock().await;
        AuthStateSnapshot {
            mode: match guard.mode {
                AuthMode::Http => "http",
                AuthMode::Browser => "browser",
            },
            consecutive_failures: guard.consecutive_failures,
            total_http_requests: guard.total_http_requests,
            total_browser_fallbacks: guard.total_browser_fallbacks,
            mode_switches: guard.mode_switches,
            cooling_down: guard
                .cooldown_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
        }
    }

    pub async fn dpop_key_age_seconds(&self) -> f64 {
        self.inner
            .lock()
            .await
            .signer
            .as_ref()
            .map(|s| s.age_seconds())
            .unwrap_or(0.0)
    }

    /// The session id bound to the current mode: the DPoP signer's session
    /// id in HTTP mode, or the captured search session id in browser mode.
    pub async fn get_session_id(&self) -> String {
        let guard = self.inner.lock().await;
        match guard.mode {
            AuthMode::Http => guard
                .signer
                .as_ref()
                .map(|s| s.credentials().session_id.clone())
                .unwrap_or_default(),
            AuthMode::Browser => guard
                .browser_auth
                .as_ref()
                .map(|a| a.search_session_id.clone())
                .unwrap_or_default(),
        }
    }

    /// The device uuid bound to the current mode.
    pub async fn get_device_uuid(&self) -> String {
        let guard = self.inner.lock().await;
        match guard.mode {
            AuthMode::Http => guard
                .signer
                .as_ref()
                .map(|s| s.credentials().device_uuid.clone())
                .unwrap_or_default(),
            AuthMode::Browser => guard
                .browser_auth
                .as_ref()
                .map(|a| a.laplace_device_uuid.clone())
                .unwrap_or_default(),
        }
    }

    /// Returns the headers (and, in browser mode, cookies) to attach to the
    /// next request, blocking out any active 403 cooldown first.
    pub async fn get_auth_headers(
        &self,
        url: &str,
        method: &str,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), AuthError> {
        self.wait_out_cooldown().await;

        let mode = self.mode().await;
        match mode {
            AuthMode::Http => {
                let headers = self.get_http_headers(url, method).await?;
                Ok((headers, HashMap::new()))
            }
            AuthMode::Browser => {
                let auth = self.get_browser_auth().await?;
                Ok((auth.headers, auth.cookies))
            }
        }
    }

    async fn wait_out_cooldown(&self) {
        let until = self.inner.lock().await.cooldown_until;
        if let Some(until) = until {
            let now = Instant::now();
            if now < until {
                tokio::time::sleep(until - now).await;
            }
        }
    }

    async fn get_http_headers(
        &self,
        url: &str,
        method: &str,
    ) -> Result<HashMap<String, String>, AuthError> {
        let mut guard = self.inner.lock().await;
        let needs_new_signer = match &guard.signer {
            None => true,
            Some(signer) => signer.age_seconds() > KEY_ROTATION_INTERVAL.as_secs_f64(),
        };
        if needs_new_signer {
            guard.signer = Some(DPoPSigner::new());
        }
        guard.total_http_requests += 1;
        let signer = guard.signer.as_ref().expect("signer just set");
        let dpop = signer.sign(method, url)?;

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-platform".to_string(), "web".to_string());
        headers.insert("dpop".to_string(), dpop);
        headers.insert("user-agent".to_string(), self.user_agent.to_string());
        headers.insert("accept".to_string(), "*/*".to_string());
        headers.insert(
            "accept-language".to_string(),
            "ja-JP,ja;q=0.9".to_string(),
        );
        headers.insert("origin".to_string(), "https://jp.mercari.com".to_string());
        headers.insert("referer".to_string(), "https://jp.mercari.com/".to_string());
        Ok(headers)
    }

    async fn get_browser_auth(&self) -> Result<BrowserAuth, AuthError> {
        {
            let guard = self.inner.lock().await;
            if let Some(auth) = &guard.browser_auth {
                if auth.is_valid(self.max_browser_auth_age) {
                    return Ok(auth.clone());
                }
            }
        }

        let mut fresh = self.browser_capture.capture("test").await?;
        fresh.captured_at = Some(Instant::now());

        let mut guard = self.inner.lock().await;
        guard.browser_auth = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn on_success(&self) {
        let mut guard = self.inner.lock().await;
        guard.consecutive_failures = 0;
    }

    pub async fn on_failure(&self, status_code: u16) {
        let mut guard = self.inner.lock().await;
        guard.consecutive_failures += 1;
        guard.last_failure_time = Some(Instant::now());

        if status_code == 403 {
            guard.cooldown_until = Some(Instant::now() + COOLDOWN_AFTER_403);
        }

        if guard.mode == AuthMode::Http && guard.consecutive_failures >= FALLBACK_THRESHOLD {
            guard.mode = AuthMode::Browser;
            guard.consecutive_failures = 0;
            guard.total_browser_fallbacks += 1;
            guard.mode_switches += 1;
            warn!("authenticator falling back to browser mode after repeated failures");
            drop(guard);
            if let Err(e) = self.get_browser_auth().await {
                warn!(error = %e, "eager browser capture on fallback failed");
            }
        }
    }

    /// Attempts to move back to the cheap HTTP path after a quiet period.
    /// Returns whether the mode is (now, or already) HTTP.
    pub async fn try_recover_http_mode(&self) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.mode == AuthMode::Http {
            return true;
        }
        let eligible = guard
            .last_failure_time
            .map(|t| t.elapsed() >= RECOVERY_INTERVAL)
            .unwrap_or(true);
        if !eligible {
            return false;
        }
        guard.mode = AuthMode::Http;
        guard.consecutive_failures = 0;
        guard.signer = Some(DPoPSigner::new());
        guard.mode_switches += 1;
        info!("authenticator recovered to http mode");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCapture;

    #[async_trait]
    impl BrowserCapture for FakeCapture {
        async fn capture(&self, _keyword: &str) -> Result<BrowserAuth, AuthError> {
            Ok(BrowserAuth {
                headers: HashMap::from([("x-test".to_string(), "1".to_string())]),
                cookies: HashMap::new(),
                search_session_id: "s".to_string(),
                laplace_device_uuid: "d".to_string(),
                captured_at: None,
            })
        }
    }

    #[tokio::test]
    async fn three_consecutive_failures_flip_to_browser() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        auth.on_failure(500).await;
        auth.on_failure(500).await;
        assert_eq!(auth.mode().await, AuthMode::Http);
        auth.on_failure(500).await;
        assert_eq!(auth.mode().await, AuthMode::Browser);
    }

    #[tokio::test]
    async fn success_between_failures_resets_the_counter() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        auth.on_failure(500).await;
        auth.on_failure(500).await;
        auth.on_success().await;
        auth.on_failure(500).await;
        assert_eq!(auth.mode().await, AuthMode::Http);
    }

    #[tokio::test]
    async fn forbidden_triggers_cooldown_without_changing_mode() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        auth.on_failure(403).await;
        assert!(auth.is_cooling_down().await);
        assert_eq!(auth.mode().await, AuthMode::Http);
    }

    #[tokio::test]
    async fn recovery_is_not_eligible_immediately_after_a_fallback() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        auth.on_failure(500).await;
        auth.on_failure(500).await;
        auth.on_failure(500).await;
        assert_eq!(auth.mode().await, AuthMode::Browser);
        assert!(!auth.try_recover_http_mode().await);
        assert_eq!(auth.mode().await, AuthMode::Browser);
    }

    #[tokio::test]
    async fn recovery_is_a_no_op_when_already_in_http_mode() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        assert!(auth.try_recover_http_mode().await);
        assert_eq!(auth.mode().await, AuthMode::Http);
    }

    #[tokio::test]
    async fn http_headers_are_well_formed() {
        let auth = Authenticator::new(Box::new(FakeCapture), 30);
        let (headers, cookies) = auth.get_auth_headers("https://x/search", "POST").await.unwrap();
        assert!(headers.contains_key("dpop"));
        assert_eq!(headers.get("x-platform").unwrap(), "web");
        assert!(cookies.is_empty());
    }
}
