//! Engine configuration for itinerary-routing
//!
//! Provider endpoint, retry policy, scheduling delays and cache lifetimes.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::core::model::TravelMode;

/// Progress callback: (days finished, days total)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Routing provider endpoint
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of an OSRM-compatible routing service
    pub base_url: String,

    /// Override for the profile path segment; derived from the travel mode when unset
    pub profile: Option<String>,

    /// Bound on a single attempt, independent of retry backoff
    pub request_timeout: Duration,

    pub connect_timeout: Duration,

    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://router.project-osrm.org".to_string(),
            profile: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: format!("itinerary-routing/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProviderConfig {
    pub fn profile_for(&self, mode: TravelMode) -> &str {
        self.profile.as_deref().unwrap_or_else(|| mode.profile())
    }
}

/// Retry behaviour of the provider client
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Wait after an HTTP 429
    pub rate_limit_backoff: Duration,

    /// Wait after a timeout, 5xx or unreadable body
    pub transient_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            rate_limit_backoff: Duration::from_secs(2),
            transient_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            rate_limit_backoff: Duration::ZERO,
            transient_backoff: Duration::ZERO,
        }
    }
}

/// Delays that keep the engine under the provider's rate limit
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub inter_leg_delay: Duration,
    pub inter_day_delay: Duration,

    /// Quiet period before a change-triggered recomputation starts
    pub settle_delay: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            inter_leg_delay: Duration::from_millis(500),
            inter_day_delay: Duration::from_secs(1),
            settle_delay: Duration::from_millis(750),
        }
    }
}

impl SchedulePolicy {
    pub fn immediate() -> Self {
        Self {
            inter_leg_delay: Duration::ZERO,
            inter_day_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
        }
    }
}

/// Route cache lifetimes and lookup radius
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub driving_ttl: Duration,
    pub default_ttl: Duration,
    pub similarity_radius_m: f64,
    pub sweep_interval: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            driving_ttl: TravelMode::Driving.default_ttl(),
            default_ttl: TravelMode::Walking.default_ttl(),
            similarity_radius_m: 1000.0,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CachePolicy {
    pub fn ttl_for(&self, mode: TravelMode) -> Duration {
        match mode {
            TravelMode::Driving => self.driving_ttl,
            _ => self.default_ttl,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub retry: RetryPolicy,
    pub schedule: SchedulePolicy,
    pub cache: CachePolicy,
    pub mode: TravelMode,
}

impl EngineConfig {
    /// Defaults overlaid with `ROUTING_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = env::var("ROUTING_BASE_URL") {
            config.provider.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(profile) = env::var("ROUTING_PROFILE") {
            config.provider.profile = Some(profile);
        }
        if let Ok(secs) = env::var("ROUTING_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|_| {
                Error::InvalidInput(format!(
                    "ROUTING_TIMEOUT_SECS must be an integer, got '{secs}'"
                ))
            })?;
            config.provider.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(retries) = env::var("ROUTING_MAX_RETRIES") {
            config.retry.max_retries = retries.parse::<u32>().map_err(|_| {
                Error::InvalidInput(format!(
                    "ROUTING_MAX_RETRIES must be an integer, got '{retries}'"
                ))
            })?;
        }
        if let Ok(mode) = env::var("ROUTING_MODE") {
            config.mode = mode.parse()?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.rate_limit_backoff, Duration::from_secs(2));
        assert_eq!(config.retry.transient_backoff, Duration::from_secs(1));
        assert_eq!(config.schedule.inter_leg_delay, Duration::from_millis(500));
        assert_eq!(config.schedule.inter_day_delay, Duration::from_secs(1));
        assert_eq!(config.provider.request_timeout, Duration::from_secs(10));
        assert_eq!(config.cache.similarity_radius_m, 1000.0);
    }

    #[test]
    fn test_ttl_for_mode() {
        let policy = CachePolicy::default();
        assert_eq!(policy.ttl_for(TravelMode::Driving), Duration::from_secs(3600));
        assert_eq!(policy.ttl_for(TravelMode::Cycling), Duration::from_secs(86_400));
    }

    #[test]
    fn test_profile_override() {
        let mut provider = ProviderConfig::default();
        assert_eq!(provider.profile_for(TravelMode::Walking), "foot");
        provider.profile = Some("car".to_string());
        assert_eq!(provider.profile_for(TravelMode::Walking), "car");
    }
}
