//! Recovery and timeout knobs for MCP operations.

use std::time::Duration;

/// Configuration for MCP recovery behavior: retry once, 60s per
/// operation, 10s to re-initialize a session, and a 0.25–0.75s randomized
/// backoff when rate limited.
#[derive(Debug, Clone)]
pub struct McpRecoveryConfig {
    /// Retries per operation, on top of the first attempt.
    pub retry_limit: u32,
    pub operation_timeout: Duration,
    pub reinit_timeout: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for McpRecoveryConfig {
    fn default() -> Self {
        Self {
            retry_limit: 1,
            operation_timeout: Duration::from_secs(60),
            reinit_timeout: Duration::from_secs(10),
            retry_backoff_min: Duration::from_millis(250),
            retry_backoff_max: Duration::from_millis(750),
        }
    }
}

impl From<&tarsy_domain::config::McpRecoverySettings> for McpRecoveryConfig {
    fn from(settings: &tarsy_domain::config::McpRecoverySettings) -> Self {
        Self {
            retry_limit: settings.retry_limit,
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
            reinit_timeout: Duration::from_secs(settings.reinit_timeout_secs),
            retry_backoff_min: Duration::from_millis(settings.retry_backoff_min_ms),
            retry_backoff_max: Duration::from_millis(settings.retry_backoff_max_ms),
        }
    }
}

impl McpRecoveryConfig {
    /// A randomized backoff duration within the configured window.
    pub fn random_backoff(&self) -> Duration {
        use rand::Rng;
        if self.retry_backoff_max <= self.retry_backoff_min {
            return self.retry_backoff_min;
        }
        let span = self.retry_backoff_max - self.retry_backoff_min;
        self.retry_backoff_min + span.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = McpRecoveryConfig::default();
        assert_eq!(cfg.retry_limit, 1);
        assert_eq!(cfg.operation_timeout, Duration::from_secs(60));
        assert_eq!(cfg.reinit_timeout, Duration::from_secs(10));
    }

    #[test]
    fn backoff_stays_in_window() {
        let cfg = McpRecoveryConfig::default();
        for _ in 0..100 {
            let backoff = cfg.random_backoff();
            assert!(backoff >= cfg.retry_backoff_min);
            assert!(backoff <= cfg.retry_backoff_max);
        }
    }

    #[test]
    fn built_from_config_settings() {
        let settings = tarsy_domain::config::McpRecoverySettings {
            retry_limit: 2,
            operation_timeout_secs: 30,
            reinit_timeout_secs: 5,
            retry_backoff_min_ms: 100,
            retry_backoff_max_ms: 200,
        };
        let cfg = McpRecoveryConfig::from(&settings);
        assert_eq!(cfg.retry_limit, 2);
        assert_eq!(cfg.operation_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry_backoff_max, Duration::from_millis(200));
    }

    #[test]
    fn degenerate_window_is_constant() {
        let cfg = McpRecoveryConfig {
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(cfg.random_backoff(), Duration::from_millis(100));
    }
}
