//! Centralized configuration for Driftwood.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Driftwood components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct DriftwoodConfig {
    pub session: SessionConfig,
    pub fetch: FetchConfig,
    pub media: MediaConfig,
    pub control: ControlConfig,
}

/// Session lifecycle configuration.
///
/// Controls eviction of long-lived sessions and the sweep job cadence.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Age beyond which any session is evicted regardless of track state
    pub age_limit: Duration,
    /// Interval between sweep job runs
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            age_limit: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Manifest and segment retrieval configuration.
///
/// Controls HTTP timeouts, the retry budget shared by manifest, init-segment
/// and media-segment fetches, and manifest refresh behavior.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// HTTP request timeout; a fetch with no complete body inside this
    /// window counts as a failure for retry purposes
    pub idle_timeout: Duration,
    /// Maximum consecutive retries per fetch before escalation
    pub retry_limit: u32,
    /// Wait before re-requesting a failed manifest fetch
    pub manifest_retry_delay: Duration,
    /// Refresh window used when the manifest declares no positive
    /// mediaPresentationDuration
    pub default_refresh_window: Duration,
    /// Whether to run manifest validation after each parse
    pub validate_manifests: bool,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            retry_limit: 3,
            manifest_retry_delay: Duration::from_secs(1),
            default_refresh_window: Duration::from_secs(30),
            validate_manifests: true,
            user_agent: "driftwood/0.1.0",
        }
    }
}

/// Media persistence and segmentation-tool configuration.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Base directory for republished manifests and segments
    pub base_path: PathBuf,
    /// Segmentation script invoked for manifest-on-demand generation
    pub script_path: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("media"),
            script_path: PathBuf::from("scripts/segment.sh"),
        }
    }
}

/// Control channel configuration.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// UDP listen address for session begin/end control messages
    pub listen_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9780".to_string(),
        }
    }
}

impl DriftwoodConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(limit) = std::env::var("DRIFTWOOD_SESSION_AGE_LIMIT_MS") {
            if let Ok(millis) = limit.parse::<u64>() {
                config.session.age_limit = Duration::from_millis(millis);
            }
        }

        if let Ok(retries) = std::env::var("DRIFTWOOD_RETRY_LIMIT") {
            if let Ok(count) = retries.parse::<u32>() {
                config.fetch.retry_limit = count;
            }
        }

        if let Ok(timeout) = std::env::var("DRIFTWOOD_IDLE_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.fetch.idle_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(validate) = std::env::var("DRIFTWOOD_VALIDATE_MANIFESTS") {
            config.fetch.validate_manifests = validate.parse().unwrap_or(true);
        }

        if let Ok(base) = std::env::var("DRIFTWOOD_MEDIA_BASE_PATH") {
            config.media.base_path = PathBuf::from(base);
        }

        if let Ok(script) = std::env::var("DRIFTWOOD_SCRIPT_PATH") {
            config.media.script_path = PathBuf::from(script);
        }

        if let Ok(addr) = std::env::var("DRIFTWOOD_CONTROL_LISTEN_ADDR") {
            config.control.listen_addr = addr;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts and sweep intervals so timing-sensitive tests finish
    /// quickly; validation stays on to exercise the full parse path.
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig {
                age_limit: Duration::from_millis(5000),
                sweep_interval: Duration::from_millis(100),
            },
            fetch: FetchConfig {
                idle_timeout: Duration::from_millis(500),
                manifest_retry_delay: Duration::from_millis(10),
                default_refresh_window: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DriftwoodConfig::default();

        assert_eq!(config.session.age_limit, Duration::from_secs(3600));
        assert_eq!(config.fetch.retry_limit, 3);
        assert_eq!(config.fetch.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.fetch.default_refresh_window, Duration::from_secs(30));
        assert!(config.fetch.validate_manifests);
        assert_eq!(config.control.listen_addr, "0.0.0.0:9780");
    }

    #[test]
    fn test_testing_preset_shrinks_windows() {
        let config = DriftwoodConfig::for_testing();

        assert_eq!(config.session.age_limit, Duration::from_millis(5000));
        assert!(config.fetch.idle_timeout < Duration::from_secs(1));
        assert!(config.fetch.validate_manifests);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("DRIFTWOOD_SESSION_AGE_LIMIT_MS", "2500");
            std::env::set_var("DRIFTWOOD_RETRY_LIMIT", "7");
            std::env::set_var("DRIFTWOOD_VALIDATE_MANIFESTS", "false");
        }

        let config = DriftwoodConfig::from_env();

        assert_eq!(config.session.age_limit, Duration::from_millis(2500));
        assert_eq!(config.fetch.retry_limit, 7);
        assert!(!config.fetch.validate_manifests);

        // Cleanup
        unsafe {
            std::env::remove_var("DRIFTWOOD_SESSION_AGE_LIMIT_MS");
            std::env::remove_var("DRIFTWOOD_RETRY_LIMIT");
            std::env::remove_var("DRIFTWOOD_VALIDATE_MANIFESTS");
        }
    }
}
