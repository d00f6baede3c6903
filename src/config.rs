/// Service configuration, resolved from the environment
use anyhow::Context;
use tokio::time::Duration;

use crate::fanout::RetryPolicy;
use crate::signing::AwsCredentials;

/// Connection registry settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Pool size shared by the registry and the bus publisher
    pub max_connections: u32,

    /// Registry table name
    pub table: String,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            table: std::env::var("CONNECTIONS_TABLE")
                .unwrap_or_else(|_| "connections".to_string()),
        })
    }
}

/// Change bus settings
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Notification channel shared by all gateway processes
    pub channel: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: std::env::var("CHANGE_BUS_CHANNEL")
                .unwrap_or_else(|_| "actor_state_changes".to_string()),
        }
    }
}

/// Push endpoint settings
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Management endpoint base URL, e.g.
    /// `https://abc123.execute-api.us-east-1.amazonaws.com/production`
    pub endpoint: String,

    /// Signing region
    pub region: String,

    /// None when the environment carries no credentials; requests then go
    /// out unsigned, which only local emulators accept
    pub credentials: Option<AwsCredentials>,

    /// Signing timestamps are backdated by this much so a gateway clock
    /// running ahead of the edge still produces acceptable signatures
    pub clock_skew_tolerance: Duration,
}

impl PushConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: std::env::var("PUSH_ENDPOINT").context("PUSH_ENDPOINT must be set")?,
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            credentials: AwsCredentials::from_env(),
            clock_skew_tolerance: std::env::var("PUSH_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::ZERO),
        })
    }
}

fn retry_policy_from_env() -> RetryPolicy {
    let defaults = RetryPolicy::default();
    RetryPolicy {
        max_attempts: std::env::var("FANOUT_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts),
        initial_backoff: std::env::var("FANOUT_INITIAL_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff),
        max_backoff: std::env::var("FANOUT_MAX_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff),
        shed_after: std::env::var("FANOUT_SHED_AFTER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.shed_after),
    }
}

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub push: PushConfig,
    pub retry: RetryPolicy,
}

impl FanoutConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            store: StoreConfig::from_env()?,
            bus: BusConfig::default(),
            push: PushConfig::from_env()?,
            retry: retry_policy_from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_config_default_channel() {
        // Runs without CHANGE_BUS_CHANNEL in the test environment
        if std::env::var("CHANGE_BUS_CHANNEL").is_err() {
            assert_eq!(BusConfig::default().channel, "actor_state_changes");
        }
    }

    #[test]
    fn test_store_config_defaults() {
        if std::env::var("DATABASE_URL").is_err() && std::env::var("CONNECTIONS_TABLE").is_err() {
            std::env::set_var("DATABASE_URL", "postgres://localhost/fanout");
            let config = StoreConfig::from_env().unwrap();
            assert_eq!(config.table, "connections");
            assert_eq!(config.max_connections, 5);
            std::env::remove_var("DATABASE_URL");
        }
    }

    #[test]
    fn test_push_clock_skew_defaults_to_zero() {
        if std::env::var("PUSH_ENDPOINT").is_err() && std::env::var("PUSH_CLOCK_SKEW_SECS").is_err()
        {
            std::env::set_var("PUSH_ENDPOINT", "https://edge.example.com/production");
            let config = PushConfig::from_env().unwrap();
            assert_eq!(config.clock_skew_tolerance, Duration::ZERO);
            std::env::remove_var("PUSH_ENDPOINT");
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.initial_backoff < policy.max_backoff);
        assert!(policy.shed_after > 0);
    }
}
