use std::time::Duration;

use tokio::sync::Mutex;

const MIN_DELAY: f64 = 1.5;
const MAX_DELAY: f64 = 30.0;
const DEFAULT_DELAY: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 2.0;
const RECOVERY_FACTOR: f64 = 0.95;
const RECOVERY_THRESHOLD: u32 = 20;

struct State {
    delay: f64,
    success_streak: u32,
}

/// Per-process delay controller layered on top of the shared
/// [`crate::rate_limiter::GlobalRateLimiter`]. It does not coordinate with
/// other workers; it only smooths this process's own request cadence and
/// reacts to upstream signals faster than the shared limiter alone could.
pub struct AdaptiveDelayer {
    state: Mutex<State>,
}

impl AdaptiveDelayer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                delay: DEFAULT_DELAY,
                success_streak: 0,
            }),
        }
    }

    pub async fn current_delay(&self) -> Duration {
        Duration::from_secs_f64(self.state.lock().await.delay)
    }

    pub async fn wait_adaptive(&self) {
        let delay = self.current_delay().await;
        tokio::time::sleep(delay).await;
    }

    pub async fn on_success(&self) {
        let mut guard = self.state.lock().await;
        guard.success_streak += 1;
        if guard.success_streak >= RECOVERY_THRESHOLD {
            guard.delay = (guard.delay * RECOVERY_FACTOR).max(MIN_DELAY);
            guard.success_streak = 0;
        }
    }

    pub async fn on_rate_limit(&self) {
        self.backoff(BACKOFF_FACTOR).await;
    }

    pub async fn on_forbidden(&self) {
        self.backoff(BACKOFF_FACTOR).await;
    }

    pub async fn on_error(&self) {
        self.backoff(1.2).await;
    }

    async fn backoff(&self, factor: f64) {
        let mut guard = self.state.lock().await;
        guard.success_streak = 0;
        guard.delay = (guard.delay * factor).min(MAX_DELAY);
    }
}

impl Default for AdaptiveDelayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_stays_within_bounds_under_repeated_backoff() {
        let delayer = AdaptiveDelayer::new();
        for _ in 0..10 {
            delayer.on_rate_limit().await;
        }
        let delay = delayer.current_delay().await.as_secs_f64();
        assert!((MIN_DELAY..=MAX_DELAY).contains(&delay));
        assert_eq!(delay, MAX_DELAY);
    }

    #[tokio::test]
    async fn twenty_successes_decrease_delay() {
        let delayer = AdaptiveDelayer::new();
        delayer.on_rate_limit().await; // delay = 4.0
        let before = delayer.current_delay().await.as_secs_f64();
        for _ in 0..20 {
            delayer.on_success().await;
        }
        let after = delayer.current_delay().await.as_secs_f64();
        assert!(after < before);
    }

    #[tokio::test]
    async fn rate_limit_at_least_doubles_delay() {
        let delayer = AdaptiveDelayer::new();
        let before = delayer.current_delay().await.as_secs_f64();
        delayer.on_rate_limit().await;
        let after = delayer.current_delay().await.as_secs_f64();
        assert!(after >= (before * 2.0).min(MAX_DELAY) - 1e-9);
    }
}
