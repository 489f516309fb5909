//! Server configuration
//!
//! Environment-driven with builder setters for tests. The server fails fast
//! at startup when the live store is unreachable; everything else degrades at
//! runtime.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    pub redis_url: String,
    pub database_url: String,
    /// Remote task service base URL (server-side workflow steps)
    pub celery_api_url: String,

    /// `development` relaxes CORS to any origin
    pub node_env: String,
    pub cors_origins: Vec<String>,

    /// Whole-job deadline fallback when the workflow carries none
    pub job_timeout: Duration,
    /// How long a dispatched command may wait for the node's ack
    pub agent_response_timeout: Duration,
    /// A node whose heartbeat is older than this is declared stale
    pub heartbeat_timeout: Duration,
    /// Liveness sweep cadence
    pub liveness_interval: Duration,
    /// Metrics sampling cadence
    pub metrics_interval: Duration,
    /// Concurrent jobs per node queue
    pub node_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/droidfarm".to_string(),
            celery_api_url: "http://127.0.0.1:8001".to_string(),
            node_env: "development".to_string(),
            cors_origins: vec![],
            job_timeout: Duration::from_secs(300),
            agent_response_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            node_concurrency: 5,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("HOST", &defaults.host),
            port: env_parsed("WORKFLOW_PORT", defaults.port),
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            celery_api_url: env_or("CELERY_API_URL", &defaults.celery_api_url),
            node_env: env_or("NODE_ENV", &defaults.node_env),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            job_timeout: Duration::from_secs(env_parsed("JOB_TIMEOUT_SECS", 300)),
            agent_response_timeout: Duration::from_secs(env_parsed(
                "AGENT_RESPONSE_TIMEOUT_SECS",
                30,
            )),
            heartbeat_timeout: Duration::from_secs(env_parsed("HEARTBEAT_TIMEOUT_SECS", 60)),
            liveness_interval: Duration::from_secs(env_parsed("LIVENESS_INTERVAL_SECS", 30)),
            metrics_interval: Duration::from_secs(env_parsed("METRICS_INTERVAL_SECS", 60)),
            node_concurrency: env_parsed("NODE_CONCURRENCY", defaults.node_concurrency),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_agent_response_timeout(mut self, timeout: Duration) -> Self {
        self.agent_response_timeout = timeout;
        self
    }

    pub fn with_node_concurrency(mut self, concurrency: usize) -> Self {
        self.node_concurrency = concurrency.max(1);
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
