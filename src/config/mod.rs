use std::env;

/// Reassembly engine configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Container (bucket) the export pipeline writes into
    pub container: String,

    /// Maximum number of sources per compose call (default: 32, the
    /// store-side fan-in limit); larger sets are reduced in batches
    pub compose_fan_in: usize,

    /// Timeout for a single storage call in seconds (default: 60)
    pub op_timeout_secs: u64,

    /// Retry budget for transient listing failures (default: 2)
    pub list_retries: u32,

    /// Age in seconds after which a reassembly lease is considered
    /// abandoned and may be broken (default: 300)
    pub lock_ttl_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            container: "deidentified_site_recruitment_data_prod".to_string(),
            compose_fan_in: 32,
            op_timeout_secs: 60,
            list_retries: 2,
            lock_ttl_secs: 300,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            container: env::var("DATA_CONTAINER").unwrap_or(default.container),

            compose_fan_in: env::var("COMPOSE_FAN_IN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.compose_fan_in),

            op_timeout_secs: env::var("OP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.op_timeout_secs),

            list_retries: env::var("LIST_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.list_retries),

            lock_ttl_secs: env::var("LOCK_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.lock_ttl_secs),
        }
    }

    /// Create config for development (local bucket, fast timeouts)
    pub fn development() -> Self {
        Self {
            container: "recruitment-data-dev".to_string(),
            compose_fan_in: 32,
            op_timeout_secs: 10,
            list_retries: 0,
            lock_ttl_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.container, "deidentified_site_recruitment_data_prod");
        assert_eq!(config.compose_fan_in, 32);
        assert_eq!(config.op_timeout_secs, 60);
        assert_eq!(config.list_retries, 2);
        assert_eq!(config.lock_ttl_secs, 300);
    }

    #[test]
    fn test_development_config() {
        let config = RelayConfig::development();
        assert_eq!(config.container, "recruitment-data-dev");
        assert_eq!(config.list_retries, 0);
    }
}
