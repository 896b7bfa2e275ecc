//! Environment-driven configuration.

use std::env;
use std::time::Duration;

/// How the external payout provider is reached.
#[derive(Debug, Clone)]
pub enum ProviderMode {
    /// In-memory simulated provider. Default for local runs and tests.
    Simulated,
    /// Real provider behind an HTTP endpoint.
    Http { base_url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub provider_mode: ProviderMode,
    pub provider_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "payout_engine.db".to_string());

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3000);

        let worker_count = env::var("WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(4);

        let queue_capacity = env::var("WORK_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1024);

        let max_retries = env::var("PAYOUT_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(3);

        let retry_base = env::var("RETRY_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        let retry_cap = env::var("RETRY_CAP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(60));

        let provider_mode = match env::var("PROVIDER_URL") {
            Ok(url) if !url.trim().is_empty() => ProviderMode::Http {
                base_url: url.trim().trim_end_matches('/').to_string(),
            },
            _ => ProviderMode::Simulated,
        };

        let provider_timeout = env::var("PROVIDER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));

        Self {
            database_path,
            port,
            worker_count,
            queue_capacity,
            max_retries,
            retry_base,
            retry_cap,
            provider_mode,
            provider_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "payout_engine.db".to_string(),
            port: 3000,
            worker_count: 4,
            queue_capacity: 1024,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            provider_mode: ProviderMode::Simulated,
            provider_timeout: Duration::from_secs(10),
        }
    }
}
