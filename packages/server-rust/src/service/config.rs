use std::time::Duration;

/// Request-pipeline configuration: admission control and failure recovery.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Token-bucket settings shared by every request under the API prefix.
    pub rate_limit: RateLimitConfig,
    /// Include a captured call stack when logging recovered panics.
    pub verbose_panics: bool,
    /// Resolve client addresses from `X-Forwarded-For` / `X-Real-IP`.
    pub trust_forwarded_headers: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            verbose_panics: true,
            trust_forwarded_headers: true,
        }
    }
}

/// Token-bucket parameters.
///
/// One token accrues per `refill_interval`, up to `burst` tokens. The
/// defaults admit a burst of 60 and then one request per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Bucket capacity. Must be at least 1.
    pub burst: u32,
    /// Time for one token to accrue. Must be non-zero.
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 60,
            refill_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.burst, 60);
        assert_eq!(config.refill_interval, Duration::from_secs(1));
    }

    #[test]
    fn service_config_defaults() {
        let config = ServiceConfig::default();
        assert!(config.verbose_panics);
        assert!(config.trust_forwarded_headers);
    }
}
