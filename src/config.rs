use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const ENV_PREFIX: &str = "CRAWLER";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

impl RedisSettings {
    /// Builds a `redis://` connection URL from the settings' `host:port` address.
    pub fn connection_url(&self) -> String {
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", self.password)
        };
        format!("redis://{}{}/{}", auth, self.addr, self.db)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub rate: f64,
    pub burst: f64,
    /// Loaded for compatibility; intentionally unwired (see DESIGN.md).
    pub jitter_min: f64,
    /// Loaded for compatibility; intentionally unwired (see DESIGN.md).
    pub jitter_max: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate: 5.0,
            burst: 10.0,
            jitter_min: 1.0,
            jitter_max: 5.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub max_age_minutes: u64,
    /// Loaded for compatibility; see DESIGN.md Open Question resolutions.
    pub proactive_refresh_ratio: f64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            max_age_minutes: 30,
            proactive_refresh_ratio: 0.05,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CrawlerSettings {
    pub max_concurrent_tasks: usize,
    pub pop_timeout: f64,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            pop_timeout: 2.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { port: 2113 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub port: u16,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { port: 8081 }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisSettings,
    pub rate_limit: RateLimitSettings,
    pub token: TokenSettings,
    pub crawler: CrawlerSettings,
    pub metrics: MetricsSettings,
    pub health: HealthSettings,
}

impl Settings {
    /// Loads settings from an optional YAML file, then layers environment
    /// variables on top (`CRAWLER_REDIS__ADDR=...`), then falls back to
    /// built-in defaults. Precedence: env > file > default.
    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(false));
        } else {
            for candidate in ["configs/config.yaml", "config.yaml", "/etc/crawl-worker/config.yaml"] {
                builder = builder.add_source(File::new(candidate, FileFormat::Yaml).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn defaults_when_nothing_set() {
        let settings = Settings::load(Some("does-not-exist.yaml")).unwrap();
        assert_eq!(settings.redis.addr, "localhost:6379");
        assert_eq!(settings.crawler.max_concurrent_tasks, 3);
        assert_eq!(settings.metrics.port, 2113);
    }

    #[test]
    fn env_override_beats_default() {
        env::set_var("CRAWLER_CRAWLER__MAX_CONCURRENT_TASKS", "9");
        let settings = Settings::load(Some("does-not-exist.yaml")).unwrap();
        env::remove_var("CRAWLER_CRAWLER__MAX_CONCURRENT_TASKS");
        assert_eq!(settings.crawler.max_concurrent_tasks, 9);
    }
}
